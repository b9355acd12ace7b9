//! Store collaborator traits
//!
//! These traits abstract away the coordination service, allowing the
//! lock and semaphore coordinators to run against any backend that can
//! provide index-stamped KV, sessions and blocking reads.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::model::{KvPair, KvWrite, SessionInfo, SessionRequest};

/// Index-stamped key/value access
#[async_trait]
pub trait KeyValueGateway: Send + Sync {
    /// Read a single key
    async fn get(&self, key: &str) -> StoreResult<Option<KvPair>>;

    /// Write `write` only if the key's modify index equals `expected_index`.
    ///
    /// `expected_index == 0` means "create only if the key does not exist".
    /// Returns `false` when the index is stale or the store refuses the
    /// acquisition (session invalid, key held by another session, lock-delay).
    async fn cas(&self, write: KvWrite, expected_index: u64) -> StoreResult<bool>;

    /// Delete a key unconditionally
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete a key only if its modify index equals `expected_index`
    async fn delete_cas(&self, key: &str, expected_index: u64) -> StoreResult<bool>;

    /// List every key under `prefix`, plus the store index to block on
    async fn list(&self, prefix: &str) -> StoreResult<(Vec<KvPair>, u64)>;
}

/// Session lifecycle
#[async_trait]
pub trait SessionGateway: Send + Sync {
    /// Create a session, returning its ID
    async fn create_session(&self, request: SessionRequest) -> StoreResult<String>;

    /// Renew a session's TTL.
    ///
    /// Fails with `StoreError::SessionExpired` once the session is gone.
    async fn renew_session(&self, session_id: &str) -> StoreResult<Duration>;

    /// Destroy a session, returning whether it existed
    async fn destroy_session(&self, session_id: &str) -> StoreResult<bool>;

    /// Look a session up; `None` once it expired or was destroyed
    async fn session_info(&self, session_id: &str) -> StoreResult<Option<SessionInfo>>;
}

/// Long-poll reads keyed by a change index
#[async_trait]
pub trait BlockingWaiter: Send + Sync {
    /// Wait until `key_or_prefix` changes past `since_index` or `max_wait` elapses.
    ///
    /// A path ending in `/` is a prefix; anything else names a single key.
    /// Returns the current index for the watched key or prefix.
    async fn blocking_read(
        &self,
        key_or_prefix: &str,
        since_index: u64,
        max_wait: Duration,
    ) -> StoreResult<u64>;
}

/// Convenience bound for a backend providing all three collaborators
pub trait CoordinationStore: KeyValueGateway + SessionGateway + BlockingWaiter {}

impl<T> CoordinationStore for T where T: KeyValueGateway + SessionGateway + BlockingWaiter {}
