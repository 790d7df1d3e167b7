//! Master/supervisor process (base spec §4.3).

pub mod fd_passing;
pub mod lock;
pub mod requests;
pub mod supervisor;

pub use requests::{MasterRequest, MasterRequestCode, MasterResponse};
pub use supervisor::{ConnectionKind, Supervisor};
