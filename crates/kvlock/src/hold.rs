//! Local hold state shared by both coordinators

use parking_lot::Mutex;
use tokio::sync::watch;

use kvlock_common::CoordinationStore;

use crate::error::{CoordinationError, Result};
use crate::monitor::{HoldMonitor, LossCell, LossReason, mark_lost};
use crate::renewal::RenewalState;
use crate::session::SessionLease;

/// Local view of a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unheld,
    /// An acquisition is in flight
    Pending,
    Held,
}

/// Everything owned by an active hold
pub(crate) struct Hold {
    pub(crate) session: SessionLease,
    pub(crate) monitor: Option<HoldMonitor>,
    pub(crate) lost: LossCell,
}

impl Hold {
    pub(crate) fn is_lost(&self) -> bool {
        self.lost.borrow().is_some() || self.session.renewal_state() == RenewalState::Expired
    }

    pub(crate) async fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }
    }

    /// Stop background work and dispose of the session
    pub(crate) async fn teardown(mut self, store: &dyn CoordinationStore) {
        self.stop_monitor().await;
        mark_lost(&self.lost, LossReason::Released);
        self.session.dispose(store).await;
    }
}

enum Slot {
    Unheld,
    /// Carries the renewal state of the session being acquired with
    Pending(Option<watch::Receiver<RenewalState>>),
    Held(Hold),
}

/// Mutex-guarded hold slot; never locked across an await
pub(crate) struct HoldSlot {
    slot: Mutex<Slot>,
}

impl HoldSlot {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Unheld),
        }
    }

    pub(crate) fn state(&self) -> LockState {
        match &*self.slot.lock() {
            Slot::Held(hold) if !hold.is_lost() => LockState::Held,
            Slot::Pending(_) => LockState::Pending,
            _ => LockState::Unheld,
        }
    }

    pub(crate) fn is_held(&self) -> bool {
        self.state() == LockState::Held
    }

    /// Renewal state of the session in use, held or still contending
    pub(crate) fn renewal_state(&self) -> RenewalState {
        match &*self.slot.lock() {
            Slot::Held(hold) => hold.session.renewal_state(),
            Slot::Pending(Some(renewal)) => *renewal.borrow(),
            _ => RenewalState::Idle,
        }
    }

    /// Move to `Pending` for a new acquisition.
    ///
    /// Returns the guard plus any hold that was lost and must be torn down.
    pub(crate) fn begin(
        &self,
        held: CoordinationError,
    ) -> Result<(PendingGuard<'_>, Option<Hold>)> {
        let mut slot = self.slot.lock();
        let stale = match std::mem::replace(&mut *slot, Slot::Pending(None)) {
            Slot::Unheld => None,
            Slot::Pending(renewal) => {
                *slot = Slot::Pending(renewal);
                return Err(CoordinationError::AcquirePending);
            }
            Slot::Held(hold) if !hold.is_lost() => {
                *slot = Slot::Held(hold);
                return Err(held);
            }
            Slot::Held(hold) => Some(hold),
        };
        Ok((
            PendingGuard {
                owner: self,
                armed: true,
            },
            stale,
        ))
    }

    /// Take the hold out for release, leaving `Unheld`
    pub(crate) fn take_held(&self) -> Option<Hold> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Unheld) {
            Slot::Held(hold) => Some(hold),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Check that the coordinator may destroy its key.
    ///
    /// Returns a lost hold to tear down first, if any.
    pub(crate) fn take_for_destroy(&self, held: CoordinationError) -> Result<Option<Hold>> {
        let mut slot = self.slot.lock();
        let stale = match &*slot {
            Slot::Pending(_) => return Err(CoordinationError::AcquirePending),
            Slot::Held(hold) if !hold.is_lost() => return Err(held),
            Slot::Held(_) => true,
            Slot::Unheld => false,
        };
        if !stale {
            return Ok(None);
        }
        match std::mem::replace(&mut *slot, Slot::Unheld) {
            Slot::Held(hold) => Ok(Some(hold)),
            _ => Ok(None),
        }
    }
}

/// Resets a `Pending` slot to `Unheld` unless the acquisition completed,
/// including when the acquiring future is dropped.
pub(crate) struct PendingGuard<'a> {
    owner: &'a HoldSlot,
    armed: bool,
}

impl PendingGuard<'_> {
    /// Expose the renewal loop of the session now contending
    pub(crate) fn track_renewal(&self, renewal: Option<watch::Receiver<RenewalState>>) {
        if let Slot::Pending(current) = &mut *self.owner.slot.lock() {
            *current = renewal;
        }
    }

    pub(crate) fn complete(mut self, hold: Hold) {
        *self.owner.slot.lock() = Slot::Held(hold);
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.owner.slot.lock() = Slot::Unheld;
        }
    }
}

/// Observer of a hold, handed out in leases
#[derive(Debug, Clone)]
pub struct HoldWatch {
    lost: watch::Receiver<Option<LossReason>>,
    renewal: Option<watch::Receiver<RenewalState>>,
}

impl HoldWatch {
    pub(crate) fn new(lost: &LossCell, renewal: Option<watch::Receiver<RenewalState>>) -> Self {
        Self {
            lost: lost.subscribe(),
            renewal,
        }
    }

    /// Why the hold ended, if it has
    pub fn loss(&self) -> Option<LossReason> {
        if let Some(reason) = *self.lost.borrow() {
            return Some(reason);
        }
        match &self.renewal {
            Some(rx) if *rx.borrow() == RenewalState::Expired => Some(LossReason::SessionExpired),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.loss().is_none()
    }

    /// Wait until the hold is lost or released
    pub async fn lost(&mut self) -> LossReason {
        loop {
            if let Some(reason) = self.loss() {
                return reason;
            }

            tokio::select! {
                changed = self.lost.changed() => {
                    if changed.is_err() {
                        // Every owner of the hold is gone
                        return self.loss().unwrap_or(LossReason::Released);
                    }
                }
                _ = renewal_changed(&mut self.renewal) => {}
            }
        }
    }
}

async fn renewal_changed(renewal: &mut Option<watch::Receiver<RenewalState>>) {
    match renewal {
        Some(rx) => {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}
