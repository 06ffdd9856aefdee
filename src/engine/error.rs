use thiserror::Error;
use ulid::Ulid;

use crate::model::Minute;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("duration {0} minutes not offered by this service")]
    UnsupportedDuration(Minute),
    #[error("invalid working hours: {0}")]
    InvalidHours(&'static str),
    #[error("invalid units: {0}")]
    InvalidUnits(&'static str),
    #[error("reservation {0} already finalized with a different reference")]
    AlreadyFinalized(Ulid),
    #[error("claim {0} expired before it was finalized")]
    ClaimExpired(Ulid),
    #[error("booking reference already in use: {0}")]
    DuplicateReference(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
    /// Storage or network unreachable. Safe to retry.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    /// Transient I/O failures that a caller may retry with the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::WalError(_) | EngineError::Unavailable(_))
    }
}
