//! Error types for boardci.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("shell never reached its ready prompt: {0}")]
    SessionNotReady(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("status notification failed: {0}")]
    Notify(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Configuration errors abort a job immediately and are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::SessionNotReady(_) | Error::InvalidInput(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
