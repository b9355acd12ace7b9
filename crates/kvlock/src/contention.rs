//! Contention handling shared by the lock and semaphore loops
//!
//! One acquisition attempt yields an [`Attempt`]; losing is never an error.
//! [`AcquireBudget`] bounds a try-once acquisition and the `cancellable`
//! helpers race every store call and wait against the caller's token.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use kvlock_common::{CoordinationStore, StoreResult};

use crate::error::{CoordinationError, Result};

/// Outcome of a single acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Attempt<T> {
    /// The hold was obtained (or reclaimed)
    Acquired(T),
    /// Someone else holds the key, or our CAS lost to a concurrent writer.
    /// Block until the watched index moves past `index`.
    Contended { index: u64 },
    /// The store refused the write without the key changing (lock-delay)
    Refused,
    /// Every semaphore slot is taken as of `index`
    Full { index: u64 },
}

/// Wall-clock budget for try-once acquisitions.
///
/// The clock starts before the first attempt. The first blocking cycle
/// always gets the full wait time; later cycles are cut to what is left of
/// the budget. Without try-once the budget never runs out.
#[derive(Debug)]
pub(crate) struct AcquireBudget {
    started: Instant,
    wait_time: Duration,
    limit: Option<Duration>,
    cycles: u32,
}

impl AcquireBudget {
    pub(crate) fn new(wait_time: Duration, limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            wait_time,
            limit: limit.map(|l| l.max(wait_time)),
            cycles: 0,
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether a try-once acquisition has spent its budget
    pub(crate) fn exhausted(&self) -> bool {
        match self.limit {
            Some(limit) => self.cycles > 0 && self.elapsed() >= limit,
            None => false,
        }
    }

    /// Fail with `MaxAttemptsReached` once the budget is spent
    pub(crate) fn check(&self, key: &str) -> Result<()> {
        if self.exhausted() {
            return Err(CoordinationError::MaxAttemptsReached {
                key: key.to_string(),
                elapsed: self.elapsed(),
            });
        }
        Ok(())
    }

    /// Bound for the next blocking cycle
    pub(crate) fn next_wait(&self) -> Duration {
        match self.limit {
            Some(limit) if self.cycles > 0 => {
                self.wait_time.min(limit.saturating_sub(self.elapsed()))
            }
            _ => self.wait_time,
        }
    }

    pub(crate) fn cycle_done(&mut self) {
        self.cycles = self.cycles.saturating_add(1);
    }
}

/// Run a store call, aborting with `Cancelled` as soon as `cancel` fires
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, call: F) -> Result<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CoordinationError::Cancelled),
        result = call => result.map_err(CoordinationError::from),
    }
}

/// Sleep for `pause` unless cancelled first
pub(crate) async fn pause(cancel: &CancellationToken, pause: Duration) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CoordinationError::Cancelled),
        _ = tokio::time::sleep(pause) => Ok(()),
    }
}

/// Handle one non-acquired attempt: block, back off, or give up.
///
/// `watch` is the key or prefix blocked on when contended, `retry_time`
/// the back-off used when the store refused without a change.
pub(crate) async fn wait_out<T>(
    store: &dyn CoordinationStore,
    attempt: &Attempt<T>,
    watch: &str,
    retry_time: Duration,
    budget: &mut AcquireBudget,
    cancel: &CancellationToken,
) -> Result<()> {
    budget.check(watch)?;
    let bound = budget.next_wait();

    match attempt {
        Attempt::Acquired(_) => return Ok(()),
        Attempt::Contended { index } | Attempt::Full { index } => {
            debug!(
                "Waiting on '{}' past index {} for up to {:?}",
                watch, index, bound
            );
            let moved_to =
                cancellable(cancel, store.blocking_read(watch, *index, bound)).await?;
            debug!("Wait on '{}' returned at index {}", watch, moved_to);
        }
        Attempt::Refused => {
            let backoff = retry_time.min(bound);
            debug!("Acquisition of '{}' refused, retrying in {:?}", watch, backoff);
            pause(cancel, backoff).await?;
        }
    }

    budget.cycle_done();
    Ok(())
}
