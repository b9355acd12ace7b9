//! Common test utilities for coordinator integration tests
//!
//! Provides a shared tracing setup, an in-memory store, and option presets
//! with short timings so contention tests finish quickly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use kvlock::{LockOptions, SemaphoreOptions};
use kvlock_common::{
    BlockingWaiter, KeyValueGateway, KvPair, KvWrite, SessionGateway, SessionInfo,
    SessionRequest, StoreError, StoreResult,
};
use kvlock_memstore::MemStore;

/// Blocking wait used by the presets
pub const WAIT: Duration = Duration::from_millis(300);

/// Session TTL used by the presets
pub const TTL: Duration = Duration::from_secs(2);

static TRACING: Once = Once::new();

/// Install a test subscriber once; filter with `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Fresh store with tracing installed
pub fn store() -> Arc<MemStore> {
    init_tracing();
    MemStore::shared()
}

/// Lock options with short timings and no lock-delay
#[allow(dead_code)]
pub fn lock_options(key: &str) -> LockOptions {
    LockOptions::new(key)
        .with_wait_time(WAIT)
        .with_session_ttl(TTL)
        .with_lock_delay(Duration::ZERO)
        .with_retry_time(Duration::from_millis(50))
}

/// Semaphore options with short timings
#[allow(dead_code)]
pub fn semaphore_options(prefix: &str, limit: u32) -> SemaphoreOptions {
    SemaphoreOptions::new(prefix, limit)
        .with_wait_time(WAIT)
        .with_session_ttl(TTL)
}

/// Poll `check` until it holds or `within` elapses
#[allow(dead_code)]
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Store whose renewals can be made to report the session gone.
///
/// The inner session keeps being renewed, so held keys stay untouched and
/// only the renewal loop learns about the expiry.
#[allow(dead_code)]
pub struct RejectingRenewals {
    inner: Arc<MemStore>,
    reject: AtomicBool,
}

#[allow(dead_code)]
impl RejectingRenewals {
    pub fn shared(inner: Arc<MemStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            reject: AtomicBool::new(false),
        })
    }

    pub fn reject_renewals(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueGateway for RejectingRenewals {
    async fn get(&self, key: &str) -> StoreResult<Option<KvPair>> {
        self.inner.get(key).await
    }

    async fn cas(&self, write: KvWrite, expected_index: u64) -> StoreResult<bool> {
        self.inner.cas(write, expected_index).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.inner.delete(key).await
    }

    async fn delete_cas(&self, key: &str, expected_index: u64) -> StoreResult<bool> {
        self.inner.delete_cas(key, expected_index).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<(Vec<KvPair>, u64)> {
        self.inner.list(prefix).await
    }
}

#[async_trait]
impl SessionGateway for RejectingRenewals {
    async fn create_session(&self, request: SessionRequest) -> StoreResult<String> {
        self.inner.create_session(request).await
    }

    async fn renew_session(&self, session_id: &str) -> StoreResult<Duration> {
        let ttl = self.inner.renew_session(session_id).await?;
        if self.reject.load(Ordering::SeqCst) {
            return Err(StoreError::SessionExpired(session_id.to_string()));
        }
        Ok(ttl)
    }

    async fn destroy_session(&self, session_id: &str) -> StoreResult<bool> {
        self.inner.destroy_session(session_id).await
    }

    async fn session_info(&self, session_id: &str) -> StoreResult<Option<SessionInfo>> {
        self.inner.session_info(session_id).await
    }
}

#[async_trait]
impl BlockingWaiter for RejectingRenewals {
    async fn blocking_read(
        &self,
        key_or_prefix: &str,
        since_index: u64,
        max_wait: Duration,
    ) -> StoreResult<u64> {
        self.inner
            .blocking_read(key_or_prefix, since_index, max_wait)
            .await
    }
}
