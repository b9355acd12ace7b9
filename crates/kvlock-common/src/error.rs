//! Store error types

/// Error returned by a store collaborator.
///
/// Everything except `SessionExpired` / `InvalidSession` is treated as an
/// infrastructure failure and surfaced unchanged to the coordinator's caller.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("session '{0}' expired or not found")]
    SessionExpired(String),

    #[error("invalid session '{0}'")]
    InvalidSession(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether the error means the session is gone for good.
    pub fn is_session_gone(&self) -> bool {
        matches!(
            self,
            StoreError::SessionExpired(_) | StoreError::InvalidSession(_)
        )
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
