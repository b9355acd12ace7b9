//! Hold monitoring
//!
//! While a lock or semaphore slot is held, a `HoldMonitor` blocks on the
//! held key (or prefix) and re-checks ownership every time it changes. It
//! also follows the renewal loop so an expired session is reported at
//! once. The first loss is latched in a shared `watch` cell read by
//! `is_held()` and by the lease.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kvlock_common::{CoordinationStore, StoreError, StoreResult};

use crate::renewal::RenewalState;

/// Why a hold ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// The holder released it
    Released,
    /// The session expired or was destroyed
    SessionExpired,
    /// The held key was deleted
    KeyDeleted,
    /// The key is no longer held by our session
    SessionChanged,
    /// The semaphore manifest no longer names our session
    Evicted,
    /// The monitor ran out of retries talking to the store
    MonitorFailed,
}

impl LossReason {
    pub fn as_str(self) -> &'static str {
        match self {
            LossReason::Released => "released",
            LossReason::SessionExpired => "session_expired",
            LossReason::KeyDeleted => "key_deleted",
            LossReason::SessionChanged => "session_changed",
            LossReason::Evicted => "evicted",
            LossReason::MonitorFailed => "monitor_failed",
        }
    }
}

impl std::fmt::Display for LossReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latched loss of a hold; `None` while held
pub(crate) type LossCell = Arc<watch::Sender<Option<LossReason>>>;

pub(crate) fn new_loss_cell() -> LossCell {
    let (tx, _) = watch::channel(None);
    Arc::new(tx)
}

/// Record `reason` unless a loss was already recorded.
///
/// Returns whether this call recorded it.
pub(crate) fn mark_lost(cell: &LossCell, reason: LossReason) -> bool {
    cell.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    })
}

/// Result of re-checking a hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    /// Still held; keep blocking from `index`
    Held { index: u64 },
    Lost(LossReason),
}

/// Ownership check for one kind of hold
#[async_trait]
pub(crate) trait HoldProbe: Send + Sync + 'static {
    /// Key or prefix to block on
    fn watch_key(&self) -> &str;

    async fn probe(&self, store: &dyn CoordinationStore) -> StoreResult<Probe>;
}

/// Monitor settings
#[derive(Debug, Clone, Copy)]
pub(crate) struct MonitorSettings {
    pub kind: &'static str,
    pub wait: Duration,
    pub retries: u32,
    pub retry_time: Duration,
}

/// Handle to a running monitor task
pub(crate) struct HoldMonitor {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HoldMonitor {
    pub(crate) fn spawn<P: HoldProbe>(
        store: Arc<dyn CoordinationStore>,
        probe: P,
        start_index: u64,
        settings: MonitorSettings,
        renewal: Option<watch::Receiver<RenewalState>>,
        lost: LossCell,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            store,
            probe,
            start_index,
            settings,
            renewal,
            lost,
            cancel.clone(),
        ));
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop the monitor and wait for it to exit
    pub(crate) async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!("Hold monitor task failed: {}", e);
        }
    }
}

impl Drop for HoldMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Resolves once the renewal loop reports `Expired`; never if there is none
async fn renewal_expired(renewal: &mut Option<watch::Receiver<RenewalState>>) {
    match renewal {
        Some(rx) => {
            if rx.wait_for(|s| *s == RenewalState::Expired).await.is_err() {
                // Loop handle dropped without expiring
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run<P: HoldProbe>(
    store: Arc<dyn CoordinationStore>,
    probe: P,
    start_index: u64,
    settings: MonitorSettings,
    mut renewal: Option<watch::Receiver<RenewalState>>,
    lost: LossCell,
    cancel: CancellationToken,
) {
    let key = probe.watch_key().to_string();
    let mut index = start_index;
    let mut retries_left = settings.retries;

    debug!("Monitoring {} hold on '{}' from index {}", settings.kind, key, index);

    let reason = loop {
        let step: StoreResult<Probe> = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = renewal_expired(&mut renewal) => break LossReason::SessionExpired,
            waited = store.blocking_read(&key, index, settings.wait) => match waited {
                Ok(current) => probe.probe(store.as_ref()).await.map(|checked| match checked {
                    Probe::Held { index } => Probe::Held { index: index.max(current) },
                    lost => lost,
                }),
                Err(e) => Err(e),
            },
        };

        match step {
            Ok(Probe::Held { index: next }) => {
                index = next;
            }
            Ok(Probe::Lost(reason)) => break reason,
            Err(e) if e.is_session_gone() => break LossReason::SessionExpired,
            Err(e) if retries_left > 0 && is_retryable(&e) => {
                retries_left -= 1;
                warn!(
                    "Monitor of '{}' failed, retrying in {:?} ({} retries left): {}",
                    key, settings.retry_time, retries_left, e
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(settings.retry_time) => {}
                }
            }
            Err(e) => {
                warn!("Monitor of '{}' giving up: {}", key, e);
                break LossReason::MonitorFailed;
            }
        }
    };

    if cancel.is_cancelled() {
        return;
    }
    if mark_lost(&lost, reason) {
        metrics::counter!(
            "kvlock_hold_lost_total",
            "kind" => settings.kind,
            "reason" => reason.as_str()
        )
        .increment(1);
        info!("Lost {} hold on '{}': {}", settings.kind, key, reason);
    }
}

fn is_retryable(err: &StoreError) -> bool {
    matches!(err, StoreError::Transport(_))
}
