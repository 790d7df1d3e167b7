//! Crate-wide error type.
//!
//! Subsystems (shm, monitor, master, heartbeat, dispatch, replication) each
//! define a focused `thiserror` enum for their own failure modes; this type
//! is the aggregate that crosses module boundaries, the way the teacher
//! crate's `DbError` aggregates per-subsystem errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RyeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shared memory error: {0}")]
    Shm(String),

    #[error("monitor error: {0}")]
    Monitor(String),

    #[error("master error: {0}")]
    Master(String),

    #[error("heartbeat error: {0}")]
    Heartbeat(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("replication error: {0}")]
    Replication(String),

    #[error("log corruption: {0}")]
    Corruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation not allowed: {0}")]
    OperationNotAllowed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Clone for RyeError {
    fn clone(&self) -> Self {
        match self {
            RyeError::Io(e) => RyeError::Io(std::io::Error::new(e.kind(), e.to_string())),
            RyeError::Shm(s) => RyeError::Shm(s.clone()),
            RyeError::Monitor(s) => RyeError::Monitor(s.clone()),
            RyeError::Master(s) => RyeError::Master(s.clone()),
            RyeError::Heartbeat(s) => RyeError::Heartbeat(s.clone()),
            RyeError::Dispatch(s) => RyeError::Dispatch(s.clone()),
            RyeError::Replication(s) => RyeError::Replication(s.clone()),
            RyeError::Corruption(s) => RyeError::Corruption(s.clone()),
            RyeError::Serialization(s) => RyeError::Serialization(s.clone()),
            RyeError::Configuration(s) => RyeError::Configuration(s.clone()),
            RyeError::NotFound(s) => RyeError::NotFound(s.clone()),
            RyeError::AlreadyExists(s) => RyeError::AlreadyExists(s.clone()),
            RyeError::InvalidArgument(s) => RyeError::InvalidArgument(s.clone()),
            RyeError::OperationNotAllowed(s) => RyeError::OperationNotAllowed(s.clone()),
            RyeError::Timeout(s) => RyeError::Timeout(s.clone()),
            RyeError::Unavailable(s) => RyeError::Unavailable(s.clone()),
            RyeError::ResourceExhausted(s) => RyeError::ResourceExhausted(s.clone()),
            RyeError::InvalidState(s) => RyeError::InvalidState(s.clone()),
            RyeError::Fatal(s) => RyeError::Fatal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RyeError>;

impl From<bincode::error::EncodeError> for RyeError {
    fn from(e: bincode::error::EncodeError) -> Self {
        RyeError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for RyeError {
    fn from(e: bincode::error::DecodeError) -> Self {
        RyeError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RyeError {
    fn from(e: serde_json::Error) -> Self {
        RyeError::Serialization(e.to_string())
    }
}
