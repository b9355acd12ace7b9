//! Distributed counting semaphore
//!
//! A semaphore owns a key prefix. Each contender writes a flag key
//! `<prefix>/<session>` acquired by its session; the manifest at
//! `<prefix>/.lock` records the limit and the sessions holding a slot.
//! Holders whose flag key is gone are pruned by whoever next updates the
//! manifest, so a crashed holder frees its slot once its session dies.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kvlock_common::{CoordinationStore, KvPair, KvWrite, StoreResult};

use crate::config::{SEMAPHORE_FLAG_VALUE, SemaphoreOptions};
use crate::contention::{AcquireBudget, Attempt, cancellable, wait_out};
use crate::error::{CoordinationError, Result};
use crate::hold::{Hold, HoldSlot, HoldWatch, LockState, PendingGuard};
use crate::manifest::SemaphoreManifest;
use crate::monitor::{HoldMonitor, HoldProbe, LossReason, MonitorSettings, Probe, new_loss_cell};
use crate::renewal::RenewalState;
use crate::session::SessionLease;

const KIND: &str = "semaphore";

/// Proof of a held semaphore slot
#[derive(Debug, Clone)]
pub struct SemaphoreLease {
    prefix: String,
    session: String,
    lock_index: u64,
    watch: HoldWatch,
}

impl SemaphoreLease {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Modify index of the manifest version that admitted this holder
    pub fn lock_index(&self) -> u64 {
        self.lock_index
    }

    pub fn is_valid(&self) -> bool {
        self.watch.is_valid()
    }

    pub async fn lost(&mut self) -> LossReason {
        self.watch.lost().await
    }
}

/// Snapshot of a semaphore prefix
struct PrefixView {
    manifest: SemaphoreManifest,
    /// Modify index of the manifest key, 0 when absent
    manifest_index: u64,
    /// Index to block on for the whole prefix
    index: u64,
    /// Sessions whose contender key is still held
    live: HashSet<String>,
}

/// Acquires, releases and destroys one slot of a semaphore prefix
pub struct SemaphoreCoordinator {
    store: Arc<dyn CoordinationStore>,
    opts: SemaphoreOptions,
    slot: HoldSlot,
}

impl SemaphoreCoordinator {
    pub fn new(store: Arc<dyn CoordinationStore>, opts: SemaphoreOptions) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            store,
            opts,
            slot: HoldSlot::new(),
        })
    }

    pub fn options(&self) -> &SemaphoreOptions {
        &self.opts
    }

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

    /// Acquire a slot, waiting while the semaphore is full
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<SemaphoreLease> {
        let (guard, stale) = self.slot.begin(CoordinationError::SemaphoreHeld)?;
        if let Some(stale) = stale {
            self.drop_hold(stale).await;
        }

        let acquired = self.acquire_inner(&guard, cancel).await;
        match acquired {
            Ok((hold, lease)) => {
                guard.complete(hold);
                metrics::counter!("kvlock_acquire_total", "kind" => KIND, "result" => "acquired")
                    .increment(1);
                info!(
                    "Acquired semaphore '{}' slot with session '{}'",
                    lease.prefix, lease.session
                );
                Ok(lease)
            }
            Err(e) => {
                metrics::counter!("kvlock_acquire_total", "kind" => KIND, "result" => e.label())
                    .increment(1);
                debug!("Failed to acquire semaphore '{}': {}", self.opts.prefix, e);
                Err(e)
            }
        }
    }

    async fn acquire_inner(
        &self,
        guard: &PendingGuard<'_>,
        cancel: &CancellationToken,
    ) -> Result<(Hold, SemaphoreLease)> {
        let session = SessionLease::obtain(
            &self.store,
            self.opts.session.as_deref(),
            self.opts.session_request(),
            cancel,
        )
        .await?;
        guard.track_renewal(session.subscribe_renewal());

        let contended = match self.write_contender(session.id(), cancel).await {
            Ok(()) => self.contend(session.id(), cancel).await,
            Err(e) => Err(e),
        };

        match contended {
            Ok(manifest_index) => Ok(self.start_hold(session, manifest_index)),
            Err(e) => {
                self.remove_contender(session.id()).await;
                session.dispose(self.store.as_ref()).await;
                Err(e)
            }
        }
    }

    /// Write `<prefix>/<session>` acquired by our session
    async fn write_contender(&self, session_id: &str, cancel: &CancellationToken) -> Result<()> {
        let key = self.opts.contender_key(session_id);
        let write = KvWrite::new(key.clone(), self.opts.value.clone().unwrap_or_default())
            .with_flags(SEMAPHORE_FLAG_VALUE)
            .with_session(Some(session_id.to_string()));

        if cancellable(cancel, self.store.cas(write, 0)).await? {
            debug!("Registered contender '{}'", key);
            return Ok(());
        }

        // Left over from an earlier acquisition with the same session
        match cancellable(cancel, self.store.get(&key)).await? {
            Some(pair) if pair.flags != SEMAPHORE_FLAG_VALUE => {
                Err(CoordinationError::SemaphoreConflict(key))
            }
            Some(pair) if pair.is_held_by(session_id) => Ok(()),
            _ => Err(CoordinationError::SemaphoreConflict(key)),
        }
    }

    /// Best-effort removal of our contender key
    async fn remove_contender(&self, session_id: &str) {
        let key = self.opts.contender_key(session_id);
        if let Err(e) = self.store.delete(&key).await {
            warn!("Failed to remove contender '{}': {}", key, e);
        }
    }

    async fn contend(&self, session_id: &str, cancel: &CancellationToken) -> Result<u64> {
        let prefix = self.opts.watch_prefix();
        let mut budget = AcquireBudget::new(
            self.opts.semaphore_wait_time,
            self.opts.try_once_budget(),
        );
        loop {
            match self.attempt(session_id, cancel).await? {
                Attempt::Acquired(index) => return Ok(index),
                other => {
                    wait_out(
                        self.store.as_ref(),
                        &other,
                        &prefix,
                        self.opts.semaphore_wait_time,
                        &mut budget,
                        cancel,
                    )
                    .await?
                }
            }
        }
    }

    /// List the prefix and decode it, checking flags and the limit
    async fn read_prefix(&self, cancel: &CancellationToken) -> Result<PrefixView> {
        let (pairs, index) =
            cancellable(cancel, self.store.list(&self.opts.watch_prefix())).await?;
        view_of(&self.opts, pairs, index)
    }

    async fn attempt(&self, session_id: &str, cancel: &CancellationToken) -> Result<Attempt<u64>> {
        let mut view = self.read_prefix(cancel).await?;

        let pruned = view.manifest.prune(&view.live);
        if pruned > 0 {
            debug!(
                "Pruned {} stale holders from semaphore '{}'",
                pruned, self.opts.prefix
            );
        }

        if view.manifest.contains(session_id) {
            info!(
                "Reclaiming semaphore '{}' slot already held by session '{}'",
                self.opts.prefix, session_id
            );
            return Ok(Attempt::Acquired(view.manifest_index));
        }

        if !view.manifest.add(session_id) {
            return Ok(Attempt::Full { index: view.index });
        }

        let write = KvWrite::new(self.opts.lock_key(), view.manifest.encode()?)
            .with_flags(SEMAPHORE_FLAG_VALUE);
        if cancellable(cancel, self.store.cas(write, view.manifest_index)).await? {
            // Index of our own manifest write; not raced against cancellation
            let index = self
                .store
                .get(&self.opts.lock_key())
                .await?
                .map_or(view.index, |pair| pair.modify_index);
            return Ok(Attempt::Acquired(index));
        }

        debug!("Manifest CAS on '{}' lost, re-reading", self.opts.lock_key());
        Ok(Attempt::Contended { index: view.index })
    }

    fn start_hold(&self, session: SessionLease, manifest_index: u64) -> (Hold, SemaphoreLease) {
        let lost = new_loss_cell();
        let monitor = HoldMonitor::spawn(
            Arc::clone(&self.store),
            SemaphoreProbe {
                opts: self.opts.clone(),
                prefix: self.opts.watch_prefix(),
                session: session.id().to_string(),
            },
            manifest_index,
            MonitorSettings {
                kind: KIND,
                wait: self.opts.semaphore_wait_time,
                retries: self.opts.monitor_retries,
                retry_time: self.opts.monitor_retry_time,
            },
            session.subscribe_renewal(),
            lost.clone(),
        );

        let lease = SemaphoreLease {
            prefix: self.opts.prefix.clone(),
            session: session.id().to_string(),
            lock_index: manifest_index,
            watch: HoldWatch::new(&lost, session.subscribe_renewal()),
        };
        let hold = Hold {
            session,
            monitor: Some(monitor),
            lost,
        };
        (hold, lease)
    }

    /// Give the slot back.
    ///
    /// Fails with `SemaphoreNotHeld` when nothing is held, including after
    /// the hold was lost.
    pub async fn release(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(mut hold) = self.slot.take_held() else {
            return Err(CoordinationError::SemaphoreNotHeld);
        };
        if hold.is_lost() {
            self.drop_hold(hold).await;
            return Err(CoordinationError::SemaphoreNotHeld);
        }

        hold.stop_monitor().await;
        let session_id = hold.session.id().to_string();
        let result = self.leave_manifest(&session_id, cancel).await;
        self.drop_hold(hold).await;

        metrics::counter!("kvlock_release_total", "kind" => KIND).increment(1);
        match &result {
            Ok(()) => info!("Released semaphore '{}' slot", self.opts.prefix),
            Err(e) => warn!("Releasing semaphore '{}' slot failed: {}", self.opts.prefix, e),
        }
        result
    }

    /// Remove our contender key, then tear the hold down
    async fn drop_hold(&self, hold: Hold) {
        self.remove_contender(hold.session.id()).await;
        hold.teardown(self.store.as_ref()).await;
    }

    /// CAS ourselves out of the holder set
    async fn leave_manifest(&self, session_id: &str, cancel: &CancellationToken) -> Result<()> {
        let lock_key = self.opts.lock_key();
        loop {
            let Some(pair) = cancellable(cancel, self.store.get(&lock_key)).await? else {
                return Ok(());
            };
            let mut manifest = SemaphoreManifest::decode(&lock_key, &pair.value)?;
            if !manifest.remove(session_id) {
                return Ok(());
            }

            let write = KvWrite::new(lock_key.clone(), manifest.encode()?)
                .with_flags(SEMAPHORE_FLAG_VALUE);
            if cancellable(cancel, self.store.cas(write, pair.modify_index)).await? {
                return Ok(());
            }
            debug!("Release CAS on '{}' lost, retrying", lock_key);
        }
    }

    /// Delete the manifest once no live holder remains.
    ///
    /// Fails with `SemaphoreHeld` while this instance holds a slot and with
    /// `SemaphoreInUse` while any other session does.
    pub async fn destroy(&self, cancel: &CancellationToken) -> Result<()> {
        if let Some(stale) = self.slot.take_for_destroy(CoordinationError::SemaphoreHeld)? {
            self.drop_hold(stale).await;
        }

        let mut view = self.read_prefix(cancel).await?;
        if view.manifest_index == 0 {
            return Ok(());
        }

        view.manifest.prune(&view.live);
        if !view.manifest.is_empty() {
            return Err(CoordinationError::SemaphoreInUse);
        }

        if !cancellable(
            cancel,
            self.store
                .delete_cas(&self.opts.lock_key(), view.manifest_index),
        )
        .await?
        {
            return Err(CoordinationError::SemaphoreInUse);
        }
        info!("Destroyed semaphore '{}'", self.opts.prefix);
        Ok(())
    }
}

/// Decode a listing of the semaphore prefix
fn view_of(opts: &SemaphoreOptions, pairs: Vec<KvPair>, index: u64) -> Result<PrefixView> {
    let lock_key = opts.lock_key();
    let mut manifest = None;
    let mut live = HashSet::new();

    for pair in pairs {
        if pair.flags != SEMAPHORE_FLAG_VALUE {
            return Err(CoordinationError::SemaphoreConflict(pair.key));
        }
        if pair.key == lock_key {
            manifest = Some(pair);
        } else if let Some(session) = pair.session {
            live.insert(session);
        }
    }

    let (manifest, manifest_index) = match manifest {
        Some(pair) => (
            SemaphoreManifest::decode(&lock_key, &pair.value)?,
            pair.modify_index,
        ),
        None => (SemaphoreManifest::new(opts.limit), 0),
    };

    if manifest.limit() != opts.limit {
        return Err(CoordinationError::LimitConflict {
            local: opts.limit,
            remote: manifest.limit(),
        });
    }

    Ok(PrefixView {
        manifest,
        manifest_index,
        index,
        live,
    })
}

struct SemaphoreProbe {
    opts: SemaphoreOptions,
    prefix: String,
    session: String,
}

#[async_trait]
impl HoldProbe for SemaphoreProbe {
    fn watch_key(&self) -> &str {
        &self.prefix
    }

    async fn probe(&self, store: &dyn CoordinationStore) -> StoreResult<Probe> {
        let (pairs, index) = store.list(&self.prefix).await?;

        let contender = self.opts.contender_key(&self.session);
        let holds_contender = pairs
            .iter()
            .any(|pair| pair.key == contender && pair.is_held_by(&self.session));
        if !holds_contender {
            return Ok(Probe::Lost(LossReason::KeyDeleted));
        }

        let lock_key = self.opts.lock_key();
        let named = pairs
            .iter()
            .find(|pair| pair.key == lock_key)
            .and_then(|pair| SemaphoreManifest::decode(&lock_key, &pair.value).ok())
            .is_some_and(|manifest| manifest.contains(&self.session));
        if !named {
            return Ok(Probe::Lost(LossReason::Evicted));
        }

        Ok(Probe::Held { index })
    }
}
