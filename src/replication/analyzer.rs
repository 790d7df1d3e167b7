//! Log analyzer (base spec §4.10): single-threaded scan of the persisted
//! log, transaction-table bookkeeping, applier dispatch and the
//! `required_lsa` horizon.

use crate::common::{Lsa, PageId, Trid};
use crate::error::{Result, RyeError};
use crate::heartbeat::node::NodeState;
use crate::replication::page::PageSource;
use crate::replication::progress::{AnalyzerProgressRow, ProgressStore};
use crate::replication::record::{
    CatalogItem, DataItem, HaServerStateItem, LogRecordType, ReplicationItem, SchemaItem, TransactionEntry,
    GLOBAL_GROUPID,
};
use crate::replication::scan::LogScanner;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DDL_APPLIER_INDEX: usize = 0;
pub const GLOBAL_APPLIER_INDEX: usize = 1;

/// One committed item ready to ship to an applier (base spec §4.10 step 3
/// "COMMIT").
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub applier_index: usize,
    pub trid: Trid,
    pub tran_start_lsa: Lsa,
    pub tran_end_lsa: Lsa,
    pub item: ReplicationItem,
    pub blocking: bool,
}

/// Chooses the applier lane for a parsed `REPLICATION_DATA` record (base
/// spec §4.10 step 3, "Choose applier index").
pub fn choose_applier_index(
    groupid: i32,
    class_name: &str,
    shard_group_skey_table: &str,
    shard_key: Option<&[u8]>,
    pk_first_column: &[u8],
    n_appliers: usize,
) -> usize {
    let lanes = n_appliers.saturating_sub(1).max(1);
    if groupid == GLOBAL_GROUPID && class_name == shard_group_skey_table {
        let key = shard_key.unwrap_or(pk_first_column);
        1 + (hash_bytes(key) as usize % lanes)
    } else if groupid == GLOBAL_GROUPID {
        GLOBAL_APPLIER_INDEX
    } else {
        1 + (hash_bytes(pk_first_column) as usize % lanes)
    }
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

struct MasterStateEvent {
    lsa: Lsa,
    state: NodeState,
    master_time_unix_ms: u64,
}

/// In-memory transaction table plus the rolling `required_lsa` horizon
/// (base spec §4.10).
pub struct Analyzer {
    pub current_lsa: Lsa,
    pub eof_lsa: Lsa,
    pub required_lsa: Lsa,
    n_appliers: usize,
    shard_group_skey_table: String,
    transactions: HashMap<Trid, TransactionEntry>,
    dummy_ha_fifo: VecDeque<MasterStateEvent>,
    max_committed_array: usize,
    retry_count: u32,
    max_retries: u32,
    progress: ProgressStore<AnalyzerProgressRow>,
    host_ip: String,
    pub is_role_changed: bool,
}

impl Analyzer {
    pub fn new(
        log_path: &Path,
        db_name: &str,
        host_ip: &str,
        n_appliers: usize,
        shard_group_skey_table: &str,
        max_committed_array: usize,
        max_retries: u32,
    ) -> Self {
        let progress: ProgressStore<AnalyzerProgressRow> =
            ProgressStore::new(log_path.join(format!("{db_name}_log_analyzer_progress")));
        let (current_lsa, required_lsa) = progress
            .load()
            .map(|row| (row.current_lsa, row.required_lsa))
            .unwrap_or((Lsa::new(1, 0), Lsa::new(1, 0)));
        Analyzer {
            current_lsa,
            eof_lsa: Lsa::NULL,
            required_lsa,
            n_appliers,
            shard_group_skey_table: shard_group_skey_table.to_string(),
            transactions: HashMap::new(),
            dummy_ha_fifo: VecDeque::new(),
            max_committed_array,
            retry_count: 0,
            max_retries,
            progress,
            host_ip: host_ip.to_string(),
            is_role_changed: false,
        }
    }

    /// Applies one parsed log record, returning a [`Dispatch`] when a
    /// `COMMIT` finalises a transaction's item (base spec §4.10 step 3).
    ///
    /// `ha_server_state` carries the body of a `DUMMY_HA_SERVER_STATE`
    /// record (`struct log_ha_server_state { server_state, at_time }` in
    /// the original); it is only meaningful when `record_type` is
    /// [`LogRecordType::DummyHaServerState`] and is ignored otherwise.
    pub fn apply_record(
        &mut self,
        record_type: LogRecordType,
        trid: Trid,
        lsa: Lsa,
        data: Option<DataItem>,
        schema: Option<SchemaItem>,
        catalog: Option<CatalogItem>,
        ha_server_state: Option<HaServerStateItem>,
    ) -> Result<Option<Dispatch>> {
        self.current_lsa = lsa;

        match record_type {
            LogRecordType::DummyHaServerState => {
                let Some(reported) = ha_server_state else {
                    return Err(RyeError::Corruption(
                        "DUMMY_HA_SERVER_STATE record missing its server-state body".into(),
                    ));
                };
                let state = reported.server_state;
                self.dummy_ha_fifo.push_back(MasterStateEvent {
                    lsa,
                    state,
                    master_time_unix_ms: reported.at_time_unix_ms,
                });
                if !matches!(state, NodeState::Master | NodeState::Slave | NodeState::ToBeSlave) {
                    self.is_role_changed = true;
                }
                Ok(None)
            }
            LogRecordType::ReplicationSchema => {
                let entry = self.transactions.entry(trid).or_insert_with(|| TransactionEntry::new(trid, lsa));
                entry.applier_index = DDL_APPLIER_INDEX;
                if let Some(schema) = schema {
                    entry.pending_item = Some(ReplicationItem::Schema(schema));
                }
                Ok(None)
            }
            LogRecordType::DummyUpdateGidBitmap => {
                let entry = self.transactions.entry(trid).or_insert_with(|| TransactionEntry::new(trid, lsa));
                entry.applier_index = DDL_APPLIER_INDEX;
                if let Some(catalog) = catalog {
                    entry.pending_item = Some(ReplicationItem::Catalog(catalog));
                }
                Ok(None)
            }
            LogRecordType::ReplicationData => {
                let entry = self.transactions.entry(trid).or_insert_with(|| TransactionEntry::new(trid, lsa));
                if let Some(data) = data {
                    entry.applier_index = choose_applier_index(
                        data.groupid,
                        &data.class_name,
                        &self.shard_group_skey_table,
                        None,
                        &data.idxkey,
                        self.n_appliers,
                    );
                    entry.pending_item = Some(ReplicationItem::Data(data));
                }
                Ok(None)
            }
            LogRecordType::Commit => {
                let mut entry = self
                    .transactions
                    .remove(&trid)
                    .ok_or_else(|| RyeError::Corruption(format!("commit for unknown trid {trid}")))?;
                entry.finalize_commit(lsa);
                let Some(item) = entry.pending_item.take() else { return Ok(None) };
                let blocking = item.is_blocking();
                Ok(Some(Dispatch {
                    applier_index: entry.applier_index,
                    trid,
                    tran_start_lsa: entry.tran_start_lsa,
                    tran_end_lsa: entry.tran_end_lsa,
                    item,
                    blocking,
                }))
            }
            LogRecordType::Abort => {
                self.transactions.remove(&trid);
                Ok(None)
            }
            LogRecordType::DummyCrashRecovery | LogRecordType::EndChkpt | LogRecordType::EndOfLog => Ok(None),
        }
    }

    /// Scans forward from `current_lsa` through every record persisted up
    /// to `last_flushed_pageid`, applying each in turn and collecting the
    /// dispatches it produces in source-LSA order (base spec §4.10 steps
    /// 1-3: "refresh header page" / "scan records via the page buffer" /
    /// per-record-type dispatch rules).
    pub fn scan_and_apply<S: PageSource>(
        &mut self,
        scanner: &LogScanner<S>,
        last_flushed_pageid: PageId,
    ) -> Result<Vec<Dispatch>> {
        let mut dispatches = Vec::new();
        loop {
            let Some((record, end_lsa)) = scanner.next_record(self.current_lsa, last_flushed_pageid)? else {
                break;
            };
            let dispatch = self.apply_record(
                record.header.record_type,
                record.header.trid,
                end_lsa,
                record.data,
                record.schema,
                record.catalog,
                record.ha_server_state,
            )?;
            dispatches.extend(dispatch);
        }
        Ok(dispatches)
    }

    /// Reclaims committed transactions whose `tran_end_lsa` is at or below
    /// the reporting applier's `committed_lsa`, recomputes `required_lsa`,
    /// and drains the server-state FIFO up to it (base spec §4.10 step 4).
    pub fn sweep(&mut self, applier_committed_lsas: &[Lsa]) -> Vec<u64> {
        let mut reclaimed = 0;
        self.transactions.retain(|_, entry| {
            if reclaimed >= self.max_committed_array {
                return true;
            }
            let committed = applier_committed_lsas.get(entry.applier_index).copied().unwrap_or(Lsa::NULL);
            let done = !entry.tran_end_lsa.is_null() && entry.tran_end_lsa <= committed;
            if done {
                reclaimed += 1;
            }
            !done
        });

        self.required_lsa = self
            .transactions
            .values()
            .map(|t| t.tran_start_lsa)
            .min()
            .unwrap_or(self.current_lsa);

        let mut applied_times = Vec::new();
        while let Some(front) = self.dummy_ha_fifo.front() {
            if front.lsa > self.required_lsa {
                break;
            }
            let event = self.dummy_ha_fifo.pop_front().unwrap();
            applied_times.push(event.master_time_unix_ms);
        }
        applied_times
    }

    /// Bounded parse-retry counter (base spec §4.10 "Failure semantics",
    /// `LA_GET_PAGE_RETRY_COUNT`). Returns `true` once the caller must tear
    /// down appliers and restart from `required_lsa`.
    pub fn record_parse_failure(&mut self) -> bool {
        self.retry_count += 1;
        self.retry_count >= self.max_retries
    }

    pub fn reset_after_restart(&mut self) {
        self.retry_count = 0;
        self.current_lsa = self.required_lsa;
        self.transactions.clear();
    }

    pub fn persist_progress(&self) -> Result<()> {
        self.progress.store(&AnalyzerProgressRow {
            host_ip: self.host_ip.clone(),
            current_lsa: self.current_lsa,
            required_lsa: self.required_lsa,
            source_applied_time_unix_ms: 0,
            creation_time_unix_ms: now_unix_ms(),
            queue_full_count: 0,
        })
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::page::{LogPage, PageLocation};
    use crate::replication::record::{LogRecord, LogRecordHeader, RcvIndex};

    fn analyzer(dir: &Path) -> Analyzer {
        Analyzer::new(dir, "testdb", "127.0.0.1", 5, "shard_group_skey", 1024, 3)
    }

    struct FakeLog {
        page_size: usize,
        payload: Vec<u8>,
    }

    impl PageSource for FakeLog {
        fn read_page(&self, pageid: PageId, _location: PageLocation) -> Result<LogPage> {
            Ok(LogPage { pageid, first_record_offset: 0, payload: self.payload.clone() })
        }
    }

    fn single_page_log(records: &[LogRecord], page_size: usize) -> LogScanner<FakeLog> {
        let mut payload = Vec::new();
        for record in records {
            payload.extend(record.encode().unwrap());
        }
        payload.resize(page_size, 0);
        LogScanner::new(FakeLog { page_size, payload }, page_size, 4)
    }

    #[test]
    fn global_groupid_on_ordinary_class_dispatches_to_global_lane() {
        let idx = choose_applier_index(GLOBAL_GROUPID, "orders", "shard_group_skey", None, b"1", 5);
        assert_eq!(idx, GLOBAL_APPLIER_INDEX);
    }

    #[test]
    fn shard_group_skey_table_hashes_into_shard_lanes() {
        let idx = choose_applier_index(GLOBAL_GROUPID, "shard_group_skey", "shard_group_skey", Some(b"k1"), b"1", 5);
        assert!((1..5).contains(&idx));
    }

    #[test]
    fn schema_then_commit_dispatches_a_blocking_item_to_ddl_lane() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = analyzer(dir.path());
        let trid = Trid(1);
        a.apply_record(
            LogRecordType::ReplicationSchema,
            trid,
            Lsa::new(1, 0),
            None,
            Some(SchemaItem {
                stmt_type: "CREATE".into(),
                ddl_type: "TABLE".into(),
                db_user: "dba".into(),
                query_text: "CREATE TABLE t (id INT)".into(),
                source_lsa: Lsa::new(1, 0),
            }),
            None,
            None,
        )
        .unwrap();
        let dispatch = a
            .apply_record(LogRecordType::Commit, trid, Lsa::new(2, 0), None, None, None, None)
            .unwrap()
            .unwrap();
        assert_eq!(dispatch.applier_index, DDL_APPLIER_INDEX);
        assert!(dispatch.blocking);
    }

    #[test]
    fn data_then_commit_dispatches_non_blocking_item() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = analyzer(dir.path());
        let trid = Trid(2);
        a.apply_record(
            LogRecordType::ReplicationData,
            trid,
            Lsa::new(1, 0),
            Some(DataItem {
                rcv_index: RcvIndex::Insert,
                groupid: 7,
                class_name: "orders".into(),
                idxkey: b"k".to_vec(),
                recdes: vec![],
                source_lsa: Lsa::new(1, 0),
            }),
            None,
            None,
            None,
        )
        .unwrap();
        let dispatch = a
            .apply_record(LogRecordType::Commit, trid, Lsa::new(2, 0), None, None, None, None)
            .unwrap()
            .unwrap();
        assert!(!dispatch.blocking);
    }

    #[test]
    fn abort_drops_the_transaction_without_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = analyzer(dir.path());
        let trid = Trid(3);
        a.apply_record(LogRecordType::ReplicationData, trid, Lsa::new(1, 0), None, None, None, None).unwrap();
        let dispatch = a.apply_record(LogRecordType::Abort, trid, Lsa::new(2, 0), None, None, None, None).unwrap();
        assert!(dispatch.is_none());
    }

    #[test]
    fn sweep_recomputes_required_lsa_from_oldest_live_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = analyzer(dir.path());
        a.apply_record(LogRecordType::ReplicationData, Trid(1), Lsa::new(5, 0), None, None, None, None).unwrap();
        a.transactions.get_mut(&Trid(1)).unwrap().applier_index = 1;
        a.sweep(&[Lsa::NULL, Lsa::NULL]);
        assert_eq!(a.required_lsa, Lsa::new(5, 0));
    }

    #[test]
    fn retry_counter_trips_restart_at_the_configured_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = analyzer(dir.path());
        assert!(!a.record_parse_failure());
        assert!(!a.record_parse_failure());
        assert!(a.record_parse_failure());
    }

    #[test]
    fn ha_server_state_reporting_slave_does_not_flag_a_role_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = analyzer(dir.path());
        a.apply_record(
            LogRecordType::DummyHaServerState,
            Trid(0),
            Lsa::new(1, 0),
            None,
            None,
            None,
            Some(HaServerStateItem { server_state: NodeState::Slave, at_time_unix_ms: 42 }),
        )
        .unwrap();
        assert!(!a.is_role_changed);
    }

    #[test]
    fn ha_server_state_leaving_the_stable_roles_flags_a_role_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = analyzer(dir.path());
        a.apply_record(
            LogRecordType::DummyHaServerState,
            Trid(0),
            Lsa::new(1, 0),
            None,
            None,
            None,
            Some(HaServerStateItem { server_state: NodeState::ToBeMaster, at_time_unix_ms: 42 }),
        )
        .unwrap();
        assert!(a.is_role_changed);
    }

    #[test]
    fn ha_server_state_without_a_body_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = analyzer(dir.path());
        let err = a.apply_record(LogRecordType::DummyHaServerState, Trid(0), Lsa::new(1, 0), None, None, None, None);
        assert!(err.is_err());
    }

    #[test]
    fn scan_and_apply_reads_schema_then_commit_off_the_page_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = analyzer(dir.path());
        let trid = Trid(9);
        let records = [
            LogRecord {
                header: LogRecordHeader {
                    record_type: LogRecordType::ReplicationSchema,
                    trid,
                    prev_tran_lsa: Lsa::NULL,
                    prev_lsa: Lsa::NULL,
                    forward_lsa: Lsa::NULL,
                },
                data: None,
                schema: Some(SchemaItem {
                    stmt_type: "CREATE".into(),
                    ddl_type: "TABLE".into(),
                    db_user: "dba".into(),
                    query_text: "CREATE TABLE t (id INT)".into(),
                    source_lsa: Lsa::new(1, 0),
                }),
                catalog: None,
                ha_server_state: None,
            },
            LogRecord {
                header: LogRecordHeader {
                    record_type: LogRecordType::Commit,
                    trid,
                    prev_tran_lsa: Lsa::NULL,
                    prev_lsa: Lsa::NULL,
                    forward_lsa: Lsa::NULL,
                },
                data: None,
                schema: None,
                catalog: None,
                ha_server_state: None,
            },
        ];
        let scanner = single_page_log(&records, 256);

        let dispatches = a.scan_and_apply(&scanner, 1).unwrap();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].applier_index, DDL_APPLIER_INDEX);
        assert!(dispatches[0].blocking);
        assert_eq!(dispatches[0].trid, trid);
    }

    #[test]
    fn scan_and_apply_returns_nothing_once_the_log_is_drained() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = analyzer(dir.path());
        a.current_lsa = Lsa::new(5, 0);
        let scanner = single_page_log(&[], 64);
        let dispatches = a.scan_and_apply(&scanner, 3).unwrap();
        assert!(dispatches.is_empty());
    }
}
