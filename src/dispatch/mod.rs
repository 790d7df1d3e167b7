//! Connection / dispatch core (base spec §4.5): per-queue-type job
//! scheduling and the epoll-based idle connection watcher shared by the
//! master and by `rye_server`-facing code.

pub mod queue;
pub mod watcher;

pub use queue::{JobQueue, QueueKind};
pub use watcher::IdleConnectionWatcher;
