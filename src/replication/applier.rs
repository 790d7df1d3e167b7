//! Applier pool (base spec §4.11): fixed lanes replaying committed
//! replication items against the local database through its client RPC.

use crate::common::{Lsa, Trid};
use crate::error::Result;
use crate::replication::progress::{ApplierProgressRow, ProgressStore};
use crate::replication::record::ReplicationItem;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// How a failed apply should be handled (base spec §4.11 step 4, §7
/// "Process health" / retryable vs fatal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Committed,
    Retryable(String),
    Fatal(String),
}

/// Local database client an applier replays items through. Out of scope
/// for this crate beyond this seam (base spec §1 Non-goals: SQL engine,
/// query client protocol).
pub trait LocalDbClient: Send + Sync {
    fn apply(&self, item: &ReplicationItem) -> ApplyOutcome;
    /// Checks whether the target state already reflects this item's
    /// primary key, for idempotent retry after an ambiguous failure (base
    /// spec §4.11 "Idempotence").
    fn already_applied(&self, item: &ReplicationItem) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct ApplierQueueItem {
    pub trid: Trid,
    pub tran_start_lsa: Lsa,
    pub target_committed_lsa: Lsa,
    pub repl_start_lsa: Lsa,
    pub item: ReplicationItem,
}

struct QueueState {
    items: VecDeque<ApplierQueueItem>,
    shutdown: bool,
}

/// One lane of the applier pool: index 0 is the DDL lane, index 1 is
/// global-groupid, indices 2..N are shard-keyed (base spec §4.11).
pub struct Applier<C: LocalDbClient> {
    pub index: usize,
    client: C,
    state: Mutex<QueueState>,
    cond: Condvar,
    committed_lsa: Mutex<Lsa>,
    num_uncommitted: AtomicU64,
    num_applied: AtomicU64,
    num_retried: AtomicU64,
    max_retries: u32,
    progress: ProgressStore<ApplierProgressRow>,
    host_ip: String,
}

impl<C: LocalDbClient> Applier<C> {
    pub fn new(index: usize, client: C, log_path: &Path, host_ip: &str, max_retries: u32) -> Self {
        let progress: ProgressStore<ApplierProgressRow> =
            ProgressStore::new(log_path.join(format!("applier_{index}_progress")));
        let committed_lsa = progress.load().map(|row| row.committed_lsa).unwrap_or(Lsa::NULL);
        Applier {
            index,
            client,
            state: Mutex::new(QueueState { items: VecDeque::new(), shutdown: false }),
            cond: Condvar::new(),
            committed_lsa: Mutex::new(committed_lsa),
            num_uncommitted: AtomicU64::new(0),
            num_applied: AtomicU64::new(0),
            num_retried: AtomicU64::new(0),
            max_retries,
            progress,
            host_ip: host_ip.to_string(),
        }
    }

    pub fn push(&self, item: ApplierQueueItem) {
        let mut state = self.state.lock().unwrap();
        self.num_uncommitted.fetch_add(1, Ordering::SeqCst);
        state.items.push_back(item);
        self.cond.notify_one();
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        self.cond.notify_all();
    }

    pub fn committed_lsa(&self) -> Lsa {
        *self.committed_lsa.lock().unwrap()
    }

    pub fn is_idle(&self) -> bool {
        self.num_uncommitted.load(Ordering::SeqCst) == 0
    }

    fn pop(&self) -> Option<ApplierQueueItem> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.shutdown {
                return None;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Runs one queue item to completion: applies the item, retrying
    /// retryable failures with bounded backoff and checking idempotence
    /// before re-applying, then advances `committed_lsa` (base spec §4.11
    /// steps 2-3).
    pub fn process_one(&self) -> Result<ApplyOutcome> {
        let Some(queued) = self.pop() else { return Ok(ApplyOutcome::Committed) };

        if queued.item.source_lsa() > queued.target_committed_lsa {
            self.num_uncommitted.fetch_sub(1, Ordering::SeqCst);
            return Ok(ApplyOutcome::Committed);
        }

        let mut attempts = 0;
        loop {
            if attempts > 0 && self.client.already_applied(&queued.item)? {
                break;
            }
            match self.client.apply(&queued.item) {
                ApplyOutcome::Committed => break,
                ApplyOutcome::Retryable(msg) => {
                    attempts += 1;
                    self.num_retried.fetch_add(1, Ordering::SeqCst);
                    if attempts > self.max_retries {
                        return Ok(ApplyOutcome::Fatal(format!("exhausted retries: {msg}")));
                    }
                    std::thread::sleep(Duration::from_millis(50 * attempts as u64));
                }
                ApplyOutcome::Fatal(msg) => return Ok(ApplyOutcome::Fatal(msg)),
            }
        }

        *self.committed_lsa.lock().unwrap() = queued.target_committed_lsa;
        self.num_uncommitted.fetch_sub(1, Ordering::SeqCst);
        self.num_applied.fetch_add(1, Ordering::SeqCst);
        self.persist_progress()?;
        Ok(ApplyOutcome::Committed)
    }

    fn persist_progress(&self) -> Result<()> {
        self.progress.store(&ApplierProgressRow {
            host_ip: self.host_ip.clone(),
            id: self.index,
            committed_lsa: self.committed_lsa(),
            num_applied: self.num_applied.load(Ordering::SeqCst),
            num_retried: self.num_retried.load(Ordering::SeqCst),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::record::{DataItem, RcvIndex};
    use std::sync::atomic::AtomicU32;

    struct FlakyClient {
        fail_times: AtomicU32,
    }

    impl LocalDbClient for FlakyClient {
        fn apply(&self, _item: &ReplicationItem) -> ApplyOutcome {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                ApplyOutcome::Retryable("connection reset".into())
            } else {
                ApplyOutcome::Committed
            }
        }

        fn already_applied(&self, _item: &ReplicationItem) -> Result<bool> {
            Ok(false)
        }
    }

    fn data_item(lsa: Lsa) -> ReplicationItem {
        ReplicationItem::Data(DataItem {
            rcv_index: RcvIndex::Insert,
            groupid: 0,
            class_name: "orders".into(),
            idxkey: vec![1],
            recdes: vec![],
            source_lsa: lsa,
        })
    }

    #[test]
    fn retryable_failure_eventually_commits() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Applier::new(2, FlakyClient { fail_times: AtomicU32::new(2) }, dir.path(), "127.0.0.1", 5);
        applier.push(ApplierQueueItem {
            trid: Trid(1),
            tran_start_lsa: Lsa::new(1, 0),
            target_committed_lsa: Lsa::new(2, 0),
            repl_start_lsa: Lsa::new(1, 0),
            item: data_item(Lsa::new(1, 0)),
        });
        let outcome = applier.process_one().unwrap();
        assert_eq!(outcome, ApplyOutcome::Committed);
        assert_eq!(applier.committed_lsa(), Lsa::new(2, 0));
    }

    #[test]
    fn exhausting_retries_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Applier::new(2, FlakyClient { fail_times: AtomicU32::new(99) }, dir.path(), "127.0.0.1", 2);
        applier.push(ApplierQueueItem {
            trid: Trid(1),
            tran_start_lsa: Lsa::new(1, 0),
            target_committed_lsa: Lsa::new(2, 0),
            repl_start_lsa: Lsa::new(1, 0),
            item: data_item(Lsa::new(1, 0)),
        });
        let outcome = applier.process_one().unwrap();
        assert!(matches!(outcome, ApplyOutcome::Fatal(_)));
    }

    #[test]
    fn applier_becomes_idle_once_queue_drains() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Applier::new(1, FlakyClient { fail_times: AtomicU32::new(0) }, dir.path(), "127.0.0.1", 5);
        assert!(applier.is_idle());
        applier.push(ApplierQueueItem {
            trid: Trid(1),
            tran_start_lsa: Lsa::new(1, 0),
            target_committed_lsa: Lsa::new(2, 0),
            repl_start_lsa: Lsa::new(1, 0),
            item: data_item(Lsa::new(1, 0)),
        });
        assert!(!applier.is_idle());
        applier.process_one().unwrap();
        assert!(applier.is_idle());
    }
}
