//! Sessions used by one acquisition
//!
//! A coordinator either borrows a caller-supplied session or creates its own.
//! An owned session is renewed in the background from the moment it is
//! created and destroyed exactly once, when the `SessionLease` is disposed.
//! A borrowed session is never renewed or destroyed.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kvlock_common::{CoordinationStore, SessionRequest};

use crate::contention::cancellable;
use crate::error::Result;
use crate::renewal::{RenewalState, SessionRenewalLoop};

pub(crate) struct SessionLease {
    id: String,
    renewal: Option<SessionRenewalLoop>,
}

impl SessionLease {
    /// Borrow `supplied` or create a session from `request`
    pub(crate) async fn obtain(
        store: &Arc<dyn CoordinationStore>,
        supplied: Option<&str>,
        request: SessionRequest,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        if let Some(id) = supplied {
            return Ok(Self {
                id: id.to_string(),
                renewal: None,
            });
        }

        let ttl = request.ttl;
        let name = request.name.clone();
        let id = cancellable(cancel, store.create_session(request)).await?;
        debug!("Created session '{}' ({}, ttl={:?})", id, name, ttl);

        let renewal = SessionRenewalLoop::spawn(Arc::clone(store), &id, ttl);
        Ok(Self {
            id,
            renewal: Some(renewal),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn renewal_state(&self) -> RenewalState {
        self.renewal
            .as_ref()
            .map(SessionRenewalLoop::state)
            .unwrap_or(RenewalState::Idle)
    }

    pub(crate) fn subscribe_renewal(&self) -> Option<tokio::sync::watch::Receiver<RenewalState>> {
        self.renewal.as_ref().map(SessionRenewalLoop::subscribe)
    }

    /// Stop renewal and destroy an owned session.
    ///
    /// Failures are logged, never returned: an undestroyed session simply
    /// expires once its TTL runs out.
    pub(crate) async fn dispose(self, store: &dyn CoordinationStore) {
        let Some(renewal) = self.renewal else {
            return;
        };
        let final_state = renewal.stop().await;
        if final_state == RenewalState::Expired {
            debug!("Session '{}' already expired", self.id);
            return;
        }

        match store.destroy_session(&self.id).await {
            Ok(existed) => debug!("Destroyed session '{}' (existed={})", self.id, existed),
            Err(e) => warn!("Failed to destroy session '{}': {}", self.id, e),
        }
    }
}
