//! Generic job queue (base spec §4.5): `{mutex, cond, pending list,
//! free list, num_run_threads, max_workers}`, with O(1) tail append and a
//! free-list that recycles job-entry records to avoid steady-state
//! allocation.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Client,
    Close,
    HeartbeatCluster,
    HeartbeatResource,
}

struct Slot<T> {
    value: Option<T>,
}

struct Inner<T> {
    pending: VecDeque<Box<Slot<T>>>,
    free_list: Vec<Box<Slot<T>>>,
    num_run_threads: usize,
    max_workers: usize,
    shutdown: bool,
}

/// A bounded worker-pool job queue for one [`QueueKind`].
pub struct JobQueue<T> {
    kind: QueueKind,
    state: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T> JobQueue<T> {
    pub fn new(kind: QueueKind, max_workers: usize) -> Self {
        JobQueue {
            kind,
            state: Mutex::new(Inner {
                pending: VecDeque::new(),
                free_list: Vec::new(),
                num_run_threads: 0,
                max_workers,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Appends `value` to the tail of the pending list, recycling a
    /// free-list slot when one is available, then wakes one waiting
    /// worker.
    pub fn add(&self, value: T) {
        let mut inner = self.state.lock().unwrap();
        let mut slot = inner.free_list.pop().unwrap_or_else(|| Box::new(Slot { value: None }));
        slot.value = Some(value);
        inner.pending.push_back(slot);
        self.cond.notify_one();
    }

    /// Blocks until a job is available or the queue is shut down.
    /// Returns `None` only after shutdown with an empty pending list.
    pub fn get_new_job(&self) -> Option<T> {
        let mut inner = self.state.lock().unwrap();
        loop {
            if let Some(mut slot) = inner.pending.pop_front() {
                let value = slot.value.take();
                inner.free_list.push(slot);
                return value;
            }
            if inner.shutdown {
                return None;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    pub fn shutdown(&self) {
        let mut inner = self.state.lock().unwrap();
        inner.shutdown = true;
        self.cond.notify_all();
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn enter_worker(&self) -> bool {
        let mut inner = self.state.lock().unwrap();
        if inner.num_run_threads >= inner.max_workers {
            return false;
        }
        inner.num_run_threads += 1;
        true
    }

    pub fn exit_worker(&self) {
        let mut inner = self.state.lock().unwrap();
        inner.num_run_threads = inner.num_run_threads.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn add_then_get_preserves_fifo_order() {
        let queue: JobQueue<u32> = JobQueue::new(QueueKind::Client, 4);
        queue.add(1);
        queue.add(2);
        queue.add(3);
        assert_eq!(queue.get_new_job(), Some(1));
        assert_eq!(queue.get_new_job(), Some(2));
        assert_eq!(queue.get_new_job(), Some(3));
    }

    #[test]
    fn free_list_recycles_slots() {
        let queue: JobQueue<u32> = JobQueue::new(QueueKind::Close, 1);
        queue.add(1);
        queue.get_new_job();
        assert_eq!(queue.state.lock().unwrap().free_list.len(), 1);
        queue.add(2);
        assert_eq!(queue.state.lock().unwrap().free_list.len(), 0, "add reused the recycled slot");
    }

    #[test]
    fn shutdown_wakes_blocked_worker_with_none() {
        let queue = Arc::new(JobQueue::<u32>::new(QueueKind::Client, 1));
        let worker_queue = queue.clone();
        let handle = thread::spawn(move || worker_queue.get_new_job());
        thread::sleep(std::time::Duration::from_millis(50));
        queue.shutdown();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn worker_slots_are_bounded_by_max_workers() {
        let queue: JobQueue<u32> = JobQueue::new(QueueKind::Client, 2);
        assert!(queue.enter_worker());
        assert!(queue.enter_worker());
        assert!(!queue.enter_worker());
        queue.exit_worker();
        assert!(queue.enter_worker());
    }
}
