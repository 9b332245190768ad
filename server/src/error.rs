//! Error types for the worker pool and its session tasks.

use std::io;

use crate::worker::WorkerStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every worker is in use; callers surface this as a conflict
    #[error("worker currently not available")]
    Capacity,

    #[error("invalid status change: worker status is {found}, expected {expected}")]
    InvalidState {
        expected: WorkerStatus,
        found: WorkerStatus,
    },

    #[error("invalid status change: worker does not have a send routine")]
    SendRoutineMissing,

    #[error("user {0} is already bound to a worker")]
    UserAlreadyBound(String),

    #[error("client information invalid: {0}")]
    InvalidClientInformation(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no worker found for {0}")]
    NotFound(String),

    #[error("protocol violation: {0}")]
    Protocol(#[from] shared::ProtocolError),

    #[error("fault tolerance exhausted after {0} failed writes")]
    FaultToleranceExhausted(u32),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("no data received within {0:?}")]
    ReadDeadline(std::time::Duration),

    #[error("dialing client {0} timed out")]
    DialTimeout(std::net::SocketAddr),

    #[error("forced exit")]
    ForcedExit,

    #[error("inbound event queue closed")]
    EventQueueClosed,

    #[error("worker pool initialization failed. initialized count: {actual}, expected count: {expected}")]
    PoolInitialization { actual: usize, expected: usize },
}

impl Error {
    /// Errors that only reject the caller and leave the session untouched
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Capacity
                | Error::NotFound(_)
                | Error::UserAlreadyBound(_)
                | Error::InvalidClientInformation(_)
        )
    }
}
