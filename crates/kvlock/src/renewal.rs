//! Background session renewal
//!
//! A `SessionRenewalLoop` renews one session every `ttl / 2` until it is
//! stopped or the store reports the session gone. State changes are pushed
//! through a `watch` channel so holders observe expiry without polling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kvlock_common::CoordinationStore;

/// Renewal loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    /// No loop is running
    Idle,
    Renewing,
    /// Stopped on request; never followed by `Expired`
    Stopped,
    /// The session is gone (terminal)
    Expired,
}

impl RenewalState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RenewalState::Stopped | RenewalState::Expired)
    }
}

/// Handle to a running renewal task
pub struct SessionRenewalLoop {
    session_id: String,
    cancel: CancellationToken,
    state: watch::Receiver<RenewalState>,
    handle: Option<JoinHandle<()>>,
}

impl SessionRenewalLoop {
    /// Start renewing `session_id` every `ttl / 2`.
    ///
    /// The loop is `Renewing` as soon as this returns.
    pub fn spawn(store: Arc<dyn CoordinationStore>, session_id: &str, ttl: Duration) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(RenewalState::Renewing);

        let handle = tokio::spawn(run(
            store,
            session_id.to_string(),
            ttl,
            cancel.clone(),
            tx,
        ));

        Self {
            session_id: session_id.to_string(),
            cancel,
            state: rx,
            handle: Some(handle),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> RenewalState {
        *self.state.borrow()
    }

    pub fn is_expired(&self) -> bool {
        self.state() == RenewalState::Expired
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<RenewalState> {
        self.state.clone()
    }

    /// Stop renewing and wait for the task to finish.
    ///
    /// Returns the final state: `Stopped`, or `Expired` if the session was
    /// already gone before the stop.
    pub async fn stop(mut self) -> RenewalState {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!("Renewal task for session '{}' failed: {}", self.session_id, e);
        }
        self.state()
    }
}

impl Drop for SessionRenewalLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    store: Arc<dyn CoordinationStore>,
    session_id: String,
    ttl: Duration,
    cancel: CancellationToken,
    state: watch::Sender<RenewalState>,
) {
    let period = (ttl / 2).max(Duration::from_millis(1));
    let mut deadline = Instant::now() + ttl;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(
        "Renewing session '{}' every {:?} (ttl={:?})",
        session_id, period, ttl
    );

    let final_state = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break RenewalState::Stopped,
            _ = ticker.tick() => {}
        }

        let renewed = tokio::select! {
            biased;
            _ = cancel.cancelled() => break RenewalState::Stopped,
            renewed = store.renew_session(&session_id) => renewed,
        };

        match renewed {
            Ok(new_ttl) => {
                deadline = Instant::now() + new_ttl;
            }
            Err(e) if e.is_session_gone() => {
                metrics::counter!("kvlock_session_renew_failures_total").increment(1);
                warn!("Session '{}' is gone, stopping renewal: {}", session_id, e);
                break RenewalState::Expired;
            }
            Err(e) => {
                metrics::counter!("kvlock_session_renew_failures_total").increment(1);
                if Instant::now() >= deadline {
                    warn!(
                        "Session '{}' could not be renewed before its TTL ran out: {}",
                        session_id, e
                    );
                    break RenewalState::Expired;
                }
                warn!("Failed to renew session '{}', will retry: {}", session_id, e);
            }
        }
    };

    // A stop request wins over a concurrent expiry
    let final_state = if cancel.is_cancelled() {
        RenewalState::Stopped
    } else {
        final_state
    };
    if final_state == RenewalState::Expired {
        info!("Session '{}' expired", session_id);
    }
    state.send_replace(final_state);
}
