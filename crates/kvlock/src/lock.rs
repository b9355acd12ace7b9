//! Distributed mutual-exclusion lock
//!
//! A lock is one key acquired by a session: the key's `Session` field names
//! the holder and its `Flags` mark it as a lock key. Acquisition is a CAS at
//! the observed modify index; contention is waited out with blocking reads.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kvlock_common::{CoordinationStore, KvPair, KvWrite, StoreResult};

use crate::config::{LOCK_FLAG_VALUE, LockOptions};
use crate::contention::{AcquireBudget, Attempt, cancellable, wait_out};
use crate::error::{CoordinationError, Result};
use crate::hold::{Hold, HoldSlot, HoldWatch, LockState, PendingGuard};
use crate::monitor::{HoldMonitor, HoldProbe, LossReason, MonitorSettings, Probe, new_loss_cell};
use crate::renewal::RenewalState;
use crate::session::SessionLease;

const KIND: &str = "lock";

/// Proof of a held lock
#[derive(Debug, Clone)]
pub struct LockLease {
    key: String,
    session: String,
    lock_index: u64,
    watch: HoldWatch,
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Session holding the key
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Number of times the key had been acquired, including this one
    pub fn lock_index(&self) -> u64 {
        self.lock_index
    }

    pub fn is_valid(&self) -> bool {
        self.watch.is_valid()
    }

    /// Resolves once the lock is lost or released
    pub async fn lost(&mut self) -> LossReason {
        self.watch.lost().await
    }
}

/// Acquires, releases and destroys one lock key.
///
/// One instance tracks at most one hold; share it behind an `Arc` to use
/// it from several tasks.
pub struct LockCoordinator {
    store: Arc<dyn CoordinationStore>,
    opts: LockOptions,
    slot: HoldSlot,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn CoordinationStore>, opts: LockOptions) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            store,
            opts,
            slot: HoldSlot::new(),
        })
    }

    pub fn options(&self) -> &LockOptions {
        &self.opts
    }

    pub fn key(&self) -> &str {
        &self.opts.key
    }

    /// Whether the lock is held right now.
    ///
    /// Flips to `false` without any call once the session expires or the
    /// key is deleted or taken over.
    pub fn is_held(&self) -> bool {
        self.slot.is_held()
    }

    pub fn state(&self) -> LockState {
        self.slot.state()
    }

    /// Renewal state of the session in use.
    ///
    /// An owned session is `Renewing` from creation, so this reports the
    /// loop while an acquisition is still pending too. `Idle` when no
    /// owned session exists.
    pub fn renewal_state(&self) -> RenewalState {
        self.slot.renewal_state()
    }

    /// Acquire the lock, waiting until it is free.
    ///
    /// With `lock_try_once` the wait is bounded by the try-once budget.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<LockLease> {
        let (guard, stale) = self.slot.begin(CoordinationError::LockHeld)?;
        if let Some(stale) = stale {
            debug!("Tearing down lost hold on '{}'", self.opts.key);
            stale.teardown(self.store.as_ref()).await;
        }

        let acquired = self.acquire_inner(&guard, cancel).await;
        match acquired {
            Ok((hold, lease)) => {
                guard.complete(hold);
                metrics::counter!("kvlock_acquire_total", "kind" => KIND, "result" => "acquired")
                    .increment(1);
                info!(
                    "Acquired lock '{}' with session '{}' (lock index {})",
                    lease.key, lease.session, lease.lock_index
                );
                Ok(lease)
            }
            Err(e) => {
                metrics::counter!("kvlock_acquire_total", "kind" => KIND, "result" => e.label())
                    .increment(1);
                debug!("Failed to acquire lock '{}': {}", self.opts.key, e);
                Err(e)
            }
        }
    }

    async fn acquire_inner(
        &self,
        guard: &PendingGuard<'_>,
        cancel: &CancellationToken,
    ) -> Result<(Hold, LockLease)> {
        let session = SessionLease::obtain(
            &self.store,
            self.opts.session.as_deref(),
            self.opts.session_request(),
            cancel,
        )
        .await?;
        guard.track_renewal(session.subscribe_renewal());

        match self.contend(session.id(), cancel).await {
            Ok(pair) => Ok(self.start_hold(session, pair)),
            Err(e) => {
                session.dispose(self.store.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn contend(&self, session_id: &str, cancel: &CancellationToken) -> Result<KvPair> {
        let mut budget = AcquireBudget::new(self.opts.lock_wait_time, self.opts.try_once_budget());
        loop {
            match self.attempt(session_id, cancel).await? {
                Attempt::Acquired(pair) => return Ok(pair),
                other => {
                    wait_out(
                        self.store.as_ref(),
                        &other,
                        &self.opts.key,
                        self.opts.lock_retry_time,
                        &mut budget,
                        cancel,
                    )
                    .await?
                }
            }
        }
    }

    async fn attempt(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Attempt<KvPair>> {
        let key = &self.opts.key;
        let current = cancellable(cancel, self.store.get(key)).await?;

        if let Some(pair) = &current {
            if pair.flags != LOCK_FLAG_VALUE {
                return Err(CoordinationError::LockConflict(key.clone()));
            }
            if pair.is_held_by(session_id) {
                info!("Reclaiming lock '{}' already held by session '{}'", key, session_id);
                return Ok(Attempt::Acquired(pair.clone()));
            }
            if pair.session.is_some() {
                return Ok(Attempt::Contended {
                    index: pair.modify_index,
                });
            }
        }

        let expected = current.as_ref().map_or(0, |p| p.modify_index);
        let write = KvWrite::new(key.clone(), self.opts.value.clone().unwrap_or_default())
            .with_flags(LOCK_FLAG_VALUE)
            .with_session(Some(session_id.to_string()));

        if cancellable(cancel, self.store.cas(write, expected)).await? {
            // Read back for the lock index; not raced against cancellation so
            // a completed acquisition is never reported as cancelled
            return match self.store.get(key).await? {
                Some(pair) if pair.is_held_by(session_id) => Ok(Attempt::Acquired(pair)),
                other => Ok(Attempt::Contended {
                    index: other.map_or(expected, |p| p.modify_index),
                }),
            };
        }

        let after = cancellable(cancel, self.store.get(key)).await?;
        if after.as_ref().map_or(0, |p| p.modify_index) == expected {
            Ok(Attempt::Refused)
        } else {
            Ok(Attempt::Contended { index: expected })
        }
    }

    fn start_hold(&self, session: SessionLease, pair: KvPair) -> (Hold, LockLease) {
        let lost = new_loss_cell();
        let monitor = HoldMonitor::spawn(
            Arc::clone(&self.store),
            LockProbe {
                key: self.opts.key.clone(),
                session: session.id().to_string(),
            },
            pair.modify_index,
            MonitorSettings {
                kind: KIND,
                wait: self.opts.lock_wait_time,
                retries: self.opts.monitor_retries,
                retry_time: self.opts.monitor_retry_time,
            },
            session.subscribe_renewal(),
            lost.clone(),
        );

        let lease = LockLease {
            key: self.opts.key.clone(),
            session: session.id().to_string(),
            lock_index: pair.lock_index,
            watch: HoldWatch::new(&lost, session.subscribe_renewal()),
        };
        let hold = Hold {
            session,
            monitor: Some(monitor),
            lost,
        };
        (hold, lease)
    }

    /// Release the lock, keeping the key.
    ///
    /// Fails with `LockNotHeld` when nothing is held, including after the
    /// hold was lost.
    pub async fn release(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(mut hold) = self.slot.take_held() else {
            return Err(CoordinationError::LockNotHeld);
        };
        if hold.is_lost() {
            hold.teardown(self.store.as_ref()).await;
            return Err(CoordinationError::LockNotHeld);
        }

        hold.stop_monitor().await;
        let session_id = hold.session.id().to_string();
        let result = self.clear_session(&session_id, cancel).await;
        hold.teardown(self.store.as_ref()).await;

        metrics::counter!("kvlock_release_total", "kind" => KIND).increment(1);
        match &result {
            Ok(()) => info!("Released lock '{}'", self.opts.key),
            Err(e) => warn!("Releasing lock '{}' failed: {}", self.opts.key, e),
        }
        result
    }

    async fn clear_session(&self, session_id: &str, cancel: &CancellationToken) -> Result<()> {
        let key = &self.opts.key;
        loop {
            let Some(pair) = cancellable(cancel, self.store.get(key)).await? else {
                return Ok(());
            };
            if !pair.is_held_by(session_id) {
                return Ok(());
            }

            let write = KvWrite::new(key.clone(), pair.value.clone())
                .with_flags(pair.flags)
                .with_session(None);
            if cancellable(cancel, self.store.cas(write, pair.modify_index)).await? {
                return Ok(());
            }
            debug!("Release CAS on '{}' lost, retrying", key);
        }
    }

    /// Delete the lock key once no session holds it.
    ///
    /// Fails with `LockHeld` while this instance holds the lock and with
    /// `LockInUse` while any other session does.
    pub async fn destroy(&self, cancel: &CancellationToken) -> Result<()> {
        if let Some(stale) = self.slot.take_for_destroy(CoordinationError::LockHeld)? {
            stale.teardown(self.store.as_ref()).await;
        }

        let key = &self.opts.key;
        let Some(pair) = cancellable(cancel, self.store.get(key)).await? else {
            return Ok(());
        };
        if pair.flags != LOCK_FLAG_VALUE {
            return Err(CoordinationError::LockConflict(key.clone()));
        }
        if let Some(holder) = &pair.session
            && !self.is_own_live_session(holder, cancel).await?
        {
            return Err(CoordinationError::LockInUse);
        }

        if !cancellable(cancel, self.store.delete_cas(key, pair.modify_index)).await? {
            return Err(CoordinationError::LockInUse);
        }
        info!("Destroyed lock '{}'", key);
        Ok(())
    }

    async fn is_own_live_session(&self, holder: &str, cancel: &CancellationToken) -> Result<bool> {
        if self.opts.session.as_deref() != Some(holder) {
            return Ok(false);
        }
        Ok(cancellable(cancel, self.store.session_info(holder))
            .await?
            .is_some())
    }
}

struct LockProbe {
    key: String,
    session: String,
}

#[async_trait]
impl HoldProbe for LockProbe {
    fn watch_key(&self) -> &str {
        &self.key
    }

    async fn probe(&self, store: &dyn CoordinationStore) -> StoreResult<Probe> {
        Ok(match store.get(&self.key).await? {
            None => Probe::Lost(LossReason::KeyDeleted),
            Some(pair) if pair.is_held_by(&self.session) => Probe::Held {
                index: pair.modify_index,
            },
            Some(_) => Probe::Lost(LossReason::SessionChanged),
        })
    }
}
