//! Error types for the lock and semaphore coordinators

use std::time::Duration;

use kvlock_common::StoreError;

/// Errors surfaced by `LockCoordinator` and `SemaphoreCoordinator`.
///
/// Contention is not an error: losing a CAS or finding the semaphore full
/// only drives the retry loop. Losing a hold after acquisition is not an
/// error either; it shows up through `is_held()` and the lease.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("lock already held")]
    LockHeld,

    #[error("lock not held")]
    LockNotHeld,

    #[error("lock in use")]
    LockInUse,

    #[error("existing key '{0}' does not match lock use")]
    LockConflict(String),

    #[error("semaphore already held")]
    SemaphoreHeld,

    #[error("semaphore not held")]
    SemaphoreNotHeld,

    #[error("semaphore in use")]
    SemaphoreInUse,

    #[error("existing key '{0}' does not match semaphore use")]
    SemaphoreConflict(String),

    #[error("semaphore limit conflict: local limit {local}, remote limit {remote}")]
    LimitConflict { local: u32, remote: u32 },

    #[error("semaphore limit must be at least 1, got {0}")]
    InvalidLimit(u32),

    #[error("an acquisition is already pending on this instance")]
    AcquirePending,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("max attempts reached acquiring '{key}' after {elapsed:?}")]
    MaxAttemptsReached { key: String, elapsed: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("corrupted data in key '{key}': {reason}")]
    CorruptedData { key: String, reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Coarse classification of `CoordinationError`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Programmer error, never retried
    Usage,
    /// Structural mismatch at the key, or the key is in use
    Conflict,
    /// TryOnce budget spent
    Exhaustion,
    /// Caller cancelled
    Cancellation,
    /// Stored data could not be decoded
    Data,
    /// Store/transport failure, surfaced unchanged
    Store,
}

impl CoordinationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinationError::LockHeld
            | CoordinationError::LockNotHeld
            | CoordinationError::SemaphoreHeld
            | CoordinationError::SemaphoreNotHeld
            | CoordinationError::LimitConflict { .. }
            | CoordinationError::InvalidLimit(_)
            | CoordinationError::AcquirePending
            | CoordinationError::InvalidConfig(_) => ErrorKind::Usage,
            CoordinationError::LockInUse
            | CoordinationError::LockConflict(_)
            | CoordinationError::SemaphoreInUse
            | CoordinationError::SemaphoreConflict(_) => ErrorKind::Conflict,
            CoordinationError::MaxAttemptsReached { .. } => ErrorKind::Exhaustion,
            CoordinationError::Cancelled => ErrorKind::Cancellation,
            CoordinationError::CorruptedData { .. } => ErrorKind::Data,
            CoordinationError::Store(_) => ErrorKind::Store,
        }
    }

    /// Whether this is the "not held" error of either primitive
    pub fn is_not_held(&self) -> bool {
        matches!(
            self,
            CoordinationError::LockNotHeld | CoordinationError::SemaphoreNotHeld
        )
    }

    /// Short label used for metrics
    pub(crate) fn label(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Usage => "usage",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Exhaustion => "exhausted",
            ErrorKind::Cancellation => "cancelled",
            ErrorKind::Data => "corrupted",
            ErrorKind::Store => "store_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;
