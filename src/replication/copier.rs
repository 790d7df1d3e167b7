//! Log copier (base spec §4.7): client of the master database's
//! WAL-streaming RPC, feeding a back-pressured recv queue the writer
//! drains.

use crate::common::PageId;
use crate::error::{Result, RyeError};
use crate::heartbeat::node::NodeState;
use crate::replication::page::FileStatus;
use crate::replication::wal_rpc::{WalRequest, WalResponse};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// One entry on the writer's recv queue: either a page batch or a marker
/// recording a stream interruption (base spec §4.7 step 4).
#[derive(Debug, Clone)]
pub enum RecvNode {
    Pages {
        pageid: PageId,
        eof_pageid: PageId,
        num_pages: u32,
        file_status: FileStatus,
        server_state: NodeState,
        payload: Vec<u8>,
    },
    ServerDead,
    NetworkFailure(String),
}

struct Inner {
    queue: VecDeque<RecvNode>,
    shutdown: bool,
}

/// Bounded producer/consumer queue between the copier and the writer.
/// Pushing past `max_count` blocks the copier on `not_full` (base spec
/// §4.7 step 3, `HB_RECV_Q_MAX_COUNT`).
pub struct RecvQueue {
    max_count: usize,
    state: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl RecvQueue {
    pub fn new(max_count: usize) -> Self {
        RecvQueue {
            max_count,
            state: Mutex::new(Inner { queue: VecDeque::new(), shutdown: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn push(&self, node: RecvNode) {
        let mut inner = self.state.lock().unwrap();
        while inner.queue.len() > self.max_count && !inner.shutdown {
            inner = self.not_full.wait(inner).unwrap();
        }
        inner.queue.push_back(node);
        self.not_empty.notify_one();
    }

    pub fn pop(&self) -> Option<RecvNode> {
        let mut inner = self.state.lock().unwrap();
        loop {
            if let Some(node) = inner.queue.pop_front() {
                self.not_full.notify_one();
                return Some(node);
            }
            if inner.shutdown {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    pub fn shutdown(&self) {
        let mut inner = self.state.lock().unwrap();
        inner.shutdown = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport abstraction over the master's WAL-streaming RPC so the
/// copier's retry/back-pressure logic can be exercised without a real
/// network connection.
pub trait WalTransport: Send + Sync {
    fn request(&self, req: WalRequest) -> Result<WalResponse>;
}

/// Client side of the WAL-streaming RPC (base spec §4.7).
pub struct Copier<T: WalTransport> {
    transport: T,
    recv_queue: std::sync::Arc<RecvQueue>,
    compressed: bool,
    last_received_pageid: PageId,
    last_file_status: FileStatus,
    shutdown: std::sync::Arc<AtomicBool>,
}

impl<T: WalTransport> Copier<T> {
    pub fn new(
        transport: T,
        recv_queue: std::sync::Arc<RecvQueue>,
        compressed: bool,
        shutdown: std::sync::Arc<AtomicBool>,
    ) -> Self {
        Copier {
            transport,
            recv_queue,
            compressed,
            last_received_pageid: 0,
            last_file_status: FileStatus::Clear,
            shutdown,
        }
    }

    /// Next pageid to request: re-reads the same tail page if the previous
    /// response left us `synchronized`, otherwise continues forward (base
    /// spec §4.7 step 2).
    fn next_request_pageid(&self, required_lsa_pageid: PageId) -> PageId {
        if self.last_received_pageid == 0 {
            return required_lsa_pageid;
        }
        match self.last_file_status {
            FileStatus::Synchronized => self.last_received_pageid,
            _ => self.last_received_pageid + 1,
        }
    }

    /// Runs one request/response cycle, enqueuing the result onto the recv
    /// queue. Returns `false` once the caller should stop (shutdown flag
    /// observed).
    pub fn step(&mut self, required_lsa_pageid: PageId) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }

        let pageid = self.next_request_pageid(required_lsa_pageid);
        let req = WalRequest::resume_from(pageid, self.compressed);
        match self.transport.request(req) {
            Ok(WalResponse::GetNextLogPages {
                pageid,
                eof_pageid,
                num_pages,
                file_status,
                server_state,
                payload,
                ..
            }) => {
                if server_state == NodeState::Dead {
                    self.recv_queue.push(RecvNode::ServerDead);
                } else {
                    self.last_received_pageid = pageid + num_pages.saturating_sub(1) as u64;
                    self.last_file_status = file_status;
                    self.recv_queue.push(RecvNode::Pages {
                        pageid,
                        eof_pageid,
                        num_pages,
                        file_status,
                        server_state,
                        payload,
                    });
                }
                true
            }
            Ok(WalResponse::EndCallback { err }) => {
                self.recv_queue.push(RecvNode::NetworkFailure(err));
                true
            }
            Err(e) => {
                self.recv_queue.push(RecvNode::NetworkFailure(e.to_string()));
                true
            }
        }
    }
}

pub fn validate_bootstrap_header(magic: &[u8; 8]) -> Result<()> {
    if magic != crate::replication::page::LOG_HEADER_MAGIC {
        return Err(RyeError::Corruption("log header magic mismatch".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<WalResponse>>>,
    }

    impl WalTransport for ScriptedTransport {
        fn request(&self, _req: WalRequest) -> Result<WalResponse> {
            self.responses.lock().unwrap().pop_front().unwrap_or(Err(RyeError::Unavailable("exhausted".into())))
        }
    }

    fn page_response(pageid: PageId, file_status: FileStatus) -> WalResponse {
        WalResponse::GetNextLogPages {
            length: 16,
            pageid,
            eof_pageid: pageid,
            num_pages: 1,
            file_status,
            server_state: NodeState::Master,
            is_zipped: false,
            payload: vec![0u8; 16],
        }
    }

    #[test]
    fn synchronized_status_re_requests_same_pageid() {
        let transport =
            ScriptedTransport { responses: Mutex::new(VecDeque::from(vec![Ok(page_response(5, FileStatus::Synchronized))])) };
        let recv_queue = Arc::new(RecvQueue::new(16));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut copier = Copier::new(transport, recv_queue, false, shutdown);
        copier.step(1);
        assert_eq!(copier.next_request_pageid(1), 5);
    }

    #[test]
    fn clear_status_requests_next_pageid() {
        let transport =
            ScriptedTransport { responses: Mutex::new(VecDeque::from(vec![Ok(page_response(5, FileStatus::Clear))])) };
        let recv_queue = Arc::new(RecvQueue::new(16));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut copier = Copier::new(transport, recv_queue, false, shutdown);
        copier.step(1);
        assert_eq!(copier.next_request_pageid(1), 6);
    }

    #[test]
    fn dead_server_state_enqueues_marker_not_pages() {
        let mut dead = page_response(5, FileStatus::Clear);
        if let WalResponse::GetNextLogPages { ref mut server_state, .. } = dead {
            *server_state = NodeState::Dead;
        }
        let transport = ScriptedTransport { responses: Mutex::new(VecDeque::from(vec![Ok(dead)])) };
        let recv_queue = Arc::new(RecvQueue::new(16));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut copier = Copier::new(transport, recv_queue.clone(), false, shutdown);
        copier.step(1);
        assert!(matches!(recv_queue.pop(), Some(RecvNode::ServerDead)));
    }

    #[test]
    fn recv_queue_blocks_producer_past_max_count() {
        let q = Arc::new(RecvQueue::new(1));
        q.push(RecvNode::ServerDead);
        q.push(RecvNode::ServerDead);
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.push(RecvNode::ServerDead));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(q.len(), 2, "third push should still be blocked");
        q.pop();
        handle.join().unwrap();
        assert_eq!(q.len(), 2);
    }
}
