//! Log record types and the replication item tagged union (base spec §3).

use crate::common::{Lsa, Trid};
use crate::error::{Result, RyeError};
use crate::replication::page::read_align;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecordType {
    Commit,
    Abort,
    ReplicationData,
    ReplicationSchema,
    DummyUpdateGidBitmap,
    DummyHaServerState,
    DummyCrashRecovery,
    EndChkpt,
    EndOfLog,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogRecordHeader {
    pub record_type: LogRecordType,
    pub trid: Trid,
    pub prev_tran_lsa: Lsa,
    pub prev_lsa: Lsa,
    pub forward_lsa: Lsa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RcvIndex {
    Insert,
    Update,
    Delete,
}

pub const GLOBAL_GROUPID: i32 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataItem {
    pub rcv_index: RcvIndex,
    pub groupid: i32,
    pub class_name: String,
    pub idxkey: Vec<u8>,
    pub recdes: Vec<u8>,
    pub source_lsa: Lsa,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaItem {
    pub stmt_type: String,
    pub ddl_type: String,
    pub db_user: String,
    pub query_text: String,
    pub source_lsa: Lsa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyareaOp {
    AnalyzerUpdate,
    ApplierUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogItem {
    pub class_name: String,
    pub idxkey: Vec<u8>,
    pub recdes: Vec<u8>,
    pub copyarea_op: CopyareaOp,
    pub source_lsa: Lsa,
}

/// Tagged union of the three kinds of work an applier can be asked to
/// replay (base spec §3 "Replication item").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationItem {
    Data(DataItem),
    Schema(SchemaItem),
    Catalog(CatalogItem),
}

impl ReplicationItem {
    pub fn source_lsa(&self) -> Lsa {
        match self {
            ReplicationItem::Data(d) => d.source_lsa,
            ReplicationItem::Schema(s) => s.source_lsa,
            ReplicationItem::Catalog(c) => c.source_lsa,
        }
    }

    /// Whether this item must run alone on the DDL lane with every other
    /// applier idle (base spec §4.10: DDL and group-id-bitmap items).
    pub fn is_blocking(&self) -> bool {
        matches!(self, ReplicationItem::Schema(_))
    }
}

/// Per-`trid` bookkeeping the analyzer maintains while a transaction is
/// in flight (base spec §3 "Transaction entry").
#[derive(Debug, Clone)]
pub struct TransactionEntry {
    pub trid: Trid,
    pub tran_start_lsa: Lsa,
    pub tran_end_lsa: Lsa,
    pub repl_start_lsa: Lsa,
    pub applier_index: usize,
    pub pending_item: Option<ReplicationItem>,
}

impl TransactionEntry {
    pub fn new(trid: Trid, tran_start_lsa: Lsa) -> Self {
        TransactionEntry {
            trid,
            tran_start_lsa,
            tran_end_lsa: Lsa::NULL,
            repl_start_lsa: Lsa::NULL,
            applier_index: 0,
            pending_item: None,
        }
    }

    pub fn finalize_commit(&mut self, tran_end_lsa: Lsa) {
        self.tran_end_lsa = tran_end_lsa;
    }
}

/// Body of a `DUMMY_HA_SERVER_STATE` record: the master's reported role and
/// the time it reported it (base spec §4.10 step 3; original `struct
/// log_ha_server_state { server_state, at_time }`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HaServerStateItem {
    pub server_state: crate::heartbeat::node::NodeState,
    pub at_time_unix_ms: u64,
}

/// One persisted log record as the analyzer's page buffer sees it: a
/// header plus whichever body variant `record_type` calls for. Encoded as
/// a length-prefixed, 8-byte-aligned blob so the scanner can walk a page's
/// payload as a byte stream (base spec §4.6 "read_align").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub header: LogRecordHeader,
    pub data: Option<DataItem>,
    pub schema: Option<SchemaItem>,
    pub catalog: Option<CatalogItem>,
    pub ha_server_state: Option<HaServerStateItem>,
}

impl LogRecord {
    /// Encodes this record as `[len: u32 LE][bincode body]`, padded to the
    /// log-record alignment.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RyeError::Corruption(format!("log record encode failed: {e}")))?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out.resize(read_align(out.len()), 0);
        Ok(out)
    }

    /// Decodes one record from the start of `bytes`, returning it and the
    /// aligned number of bytes consumed. `Err` means `bytes` doesn't yet
    /// hold a complete record (short read at the tail of a page, or real
    /// corruption); the caller distinguishes the two the way base spec
    /// §4.10's "Failure semantics" retry loop does.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < 4 {
            return Err(RyeError::Corruption("log record truncated (length prefix)".into()));
        }
        let len = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
        if bytes.len() < 4 + len {
            return Err(RyeError::Corruption("log record truncated (body)".into()));
        }
        let (record, _): (LogRecord, usize) =
            bincode::serde::decode_from_slice(&bytes[4..4 + len], bincode::config::standard())
                .map_err(|e| RyeError::Corruption(format!("log record decode failed: {e}")))?;
        Ok((record, read_align(4 + len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_items_are_blocking_data_items_are_not() {
        let data = ReplicationItem::Data(DataItem {
            rcv_index: RcvIndex::Insert,
            groupid: GLOBAL_GROUPID,
            class_name: "orders".into(),
            idxkey: vec![1],
            recdes: vec![],
            source_lsa: Lsa::new(1, 0),
        });
        assert!(!data.is_blocking());

        let schema = ReplicationItem::Schema(SchemaItem {
            stmt_type: "CREATE".into(),
            ddl_type: "TABLE".into(),
            db_user: "dba".into(),
            query_text: "CREATE TABLE t (id INT)".into(),
            source_lsa: Lsa::new(2, 0),
        });
        assert!(schema.is_blocking());
    }

    #[test]
    fn encoded_record_length_is_aligned_and_decode_recovers_the_commit() {
        let record = LogRecord {
            header: LogRecordHeader {
                record_type: LogRecordType::Commit,
                trid: Trid(7),
                prev_tran_lsa: Lsa::new(1, 0),
                prev_lsa: Lsa::new(2, 0),
                forward_lsa: Lsa::new(3, 0),
            },
            data: None,
            schema: None,
            catalog: None,
            ha_server_state: None,
        };
        let encoded = record.encode().unwrap();
        assert_eq!(encoded.len() % 8, 0);

        let (decoded, consumed) = LogRecord::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.header.trid, Trid(7));
        assert!(matches!(decoded.header.record_type, LogRecordType::Commit));
    }

    #[test]
    fn decode_reports_truncation_rather_than_panicking() {
        assert!(LogRecord::decode(&[1, 2]).is_err());
    }
}
