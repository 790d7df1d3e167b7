//! Shared-memory fabric (base spec §4.1).
//!
//! A thin, typed layer over System-V shared memory (`shmget`/`shmat`/
//! `shmctl`, via `libc`): every region starts with a [`ShmHeader`] carrying
//! a magic string/number, a type tag and a status, the way the base spec
//! describes "process-wide, cross-process key/value regions with magic/
//! version header, robust mutex, and typed views".
//!
//! [`master_region`] is the one concrete typed view this crate needs: the
//! heartbeat node table and shard-management table the master process
//! owns and every other process attaches read-only.

pub mod master_region;
pub mod mutex;
pub mod region;

pub use region::{ShmRegion, ShmStatus};
