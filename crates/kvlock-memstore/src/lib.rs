//! In-memory coordination store for kvlock
//!
//! `MemStore` implements `KeyValueGateway`, `SessionGateway` and
//! `BlockingWaiter` in one process:
//! - `kv`: index-stamped key table with CAS, tombstones and lock-delay
//! - `session`: TTL leases with release/delete behaviour
//!
//! Mutations are serialized through one write lock so a session
//! invalidation and a concurrent acquisition can never interleave.
//! Blocking reads park on a watch channel instead of polling.

pub mod kv;
pub mod session;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{Instant, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kvlock_common::{
    BlockingWaiter, KeyValueGateway, KvPair, KvWrite, SessionGateway, SessionInfo,
    SessionRequest, StoreError, StoreResult,
};

pub use kv::{CasOutcome, MemKvService};
pub use session::MemSessionService;

/// In-memory store implementing all three collaborator traits
pub struct MemStore {
    kv: MemKvService,
    sessions: MemSessionService,
    write_lock: Mutex<()>,
    /// Fault injection: every call fails with a transport error while set
    unavailable: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            kv: MemKvService::new(),
            sessions: MemSessionService::new(),
            write_lock: Mutex::new(()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Create a shared store
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn kv(&self) -> &MemKvService {
        &self.kv
    }

    pub fn sessions(&self) -> &MemSessionService {
        &self.sessions
    }

    /// Make every gateway call fail with `StoreError::Transport` until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("store unavailable".to_string()));
        }
        Ok(())
    }

    /// Invalidate a session and the keys it holds.
    ///
    /// Returns whether the session existed.
    fn invalidate(&self, session_id: &str) -> bool {
        let _guard = self.write_lock.lock();
        match self.sessions.remove(session_id) {
            Some(info) => {
                self.kv
                    .invalidate_session(&info.id, info.behavior, info.lock_delay);
                true
            }
            None => false,
        }
    }

    /// Invalidate every expired session.
    ///
    /// Returns the number of sessions reaped.
    pub fn reap_expired(&self) -> usize {
        let expired = self.sessions.expired_ids();
        expired.iter().filter(|id| self.invalidate(id)).count()
    }

    /// Start a background task reaping expired sessions every `every`.
    ///
    /// Returns a CancellationToken that stops the task.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("Session reaper started (every {:?})", every);

            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        info!("Session reaper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = store.reap_expired();
                        if reaped > 0 {
                            debug!("Reaped {} expired sessions", reaped);
                        }
                    }
                }
            }
        });

        cancel
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueGateway for MemStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KvPair>> {
        self.check_available()?;
        self.reap_expired();
        Ok(self.kv.get(key))
    }

    async fn cas(&self, write: KvWrite, expected_index: u64) -> StoreResult<bool> {
        self.check_available()?;
        self.reap_expired();

        let _guard = self.write_lock.lock();
        if let Some(session) = &write.session
            && !self.sessions.is_live(session)
        {
            return Err(StoreError::InvalidSession(session.clone()));
        }

        let key = write.key.clone();
        let outcome = self.kv.cas(write, expected_index);
        if !matches!(outcome, CasOutcome::Written(_)) {
            debug!("CAS on '{}' at index {} refused: {:?}", key, expected_index, outcome);
        }
        Ok(matches!(outcome, CasOutcome::Written(_)))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let _guard = self.write_lock.lock();
        Ok(self.kv.delete(key))
    }

    async fn delete_cas(&self, key: &str, expected_index: u64) -> StoreResult<bool> {
        self.check_available()?;
        let _guard = self.write_lock.lock();
        Ok(self.kv.delete_cas(key, expected_index))
    }

    async fn list(&self, prefix: &str) -> StoreResult<(Vec<KvPair>, u64)> {
        self.check_available()?;
        self.reap_expired();
        let _guard = self.write_lock.lock();
        Ok((self.kv.list(prefix), self.kv.prefix_index(prefix)))
    }
}

#[async_trait]
impl SessionGateway for MemStore {
    async fn create_session(&self, request: SessionRequest) -> StoreResult<String> {
        self.check_available()?;
        if request.ttl.is_zero() {
            return Err(StoreError::Other(anyhow::anyhow!(
                "session TTL must be greater than zero"
            )));
        }
        let index = self.kv.next_index();
        Ok(self.sessions.create(request, index).id)
    }

    async fn renew_session(&self, session_id: &str) -> StoreResult<Duration> {
        self.check_available()?;
        match self.sessions.renew(session_id) {
            Some(ttl) => Ok(ttl),
            None => {
                // Expired but not yet reaped: invalidate now
                if self.invalidate(session_id) {
                    warn!("Session '{}' expired before renewal", session_id);
                }
                Err(StoreError::SessionExpired(session_id.to_string()))
            }
        }
    }

    async fn destroy_session(&self, session_id: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.invalidate(session_id))
    }

    async fn session_info(&self, session_id: &str) -> StoreResult<Option<SessionInfo>> {
        self.check_available()?;
        self.reap_expired();
        Ok(self.sessions.get(session_id))
    }
}

#[async_trait]
impl BlockingWaiter for MemStore {
    async fn blocking_read(
        &self,
        key_or_prefix: &str,
        since_index: u64,
        max_wait: Duration,
    ) -> StoreResult<u64> {
        self.check_available()?;
        let deadline = Instant::now() + max_wait;
        // Subscribe before reading so a change between the two is not missed
        let mut changes = self.kv.subscribe();

        loop {
            self.reap_expired();
            let current = self.kv.watch_index(key_or_prefix);
            if current > since_index {
                return Ok(current);
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Ok(current);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(self.kv.watch_index(key_or_prefix));
                }
            }
        }
    }
}
