//! Replication pipeline (base spec §4.6–§4.11): the log copier, log
//! writer, archive promotion, log analyzer and sharded applier pool that
//! ship and replay a master database's write-ahead log.

pub mod analyzer;
pub mod applier;
pub mod archive;
pub mod copier;
pub mod page;
pub mod progress;
pub mod record;
pub mod scan;
pub mod wal_rpc;
pub mod writer;

pub use analyzer::{Analyzer, Dispatch};
pub use applier::{Applier, ApplierQueueItem, ApplyOutcome, LocalDbClient};
pub use archive::Archiver;
pub use copier::{Copier, RecvNode, RecvQueue, WalTransport};
pub use page::{FilePageSource, LogHeader, LogPage, PageBuffer, PageLocation, PageSource};
pub use record::{HaServerStateItem, LogRecord, LogRecordHeader, LogRecordType, ReplicationItem, TransactionEntry};
pub use scan::LogScanner;
pub use wal_rpc::{WalRequest, WalResponse};
pub use writer::{run_writer_loop, LogWriter, WriterCt};
