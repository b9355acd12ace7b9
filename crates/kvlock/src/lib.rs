//! Distributed lock and semaphore coordinators
//!
//! Client-side implementation of the Consul lock and semaphore recipes on
//! top of any store implementing [`kvlock_common::CoordinationStore`]:
//! - `lock`: mutual exclusion over one key held by a session
//! - `semaphore`: up to N holders over a key prefix with a shared manifest
//! - `renewal`: background session TTL renewal
//! - `monitor`: background watch flipping `is_held()` when a hold is lost
//!
//! ```ignore
//! let store = kvlock_memstore::MemStore::shared();
//! let lock = LockCoordinator::new(store, LockOptions::new("service/leader"))?;
//! let cancel = CancellationToken::new();
//! let mut lease = lock.acquire(&cancel).await?;
//! // ... lead until `lease.lost()` resolves or we release
//! lock.release(&cancel).await?;
//! ```

pub mod config;
mod contention;
pub mod error;
mod hold;
pub mod lock;
pub mod manifest;
pub mod monitor;
pub mod renewal;
pub mod semaphore;
mod session;

pub use config::{
    LOCK_FLAG_VALUE, LockOptions, SEMAPHORE_FLAG_VALUE, SEMAPHORE_LOCK_SUFFIX, SemaphoreOptions,
};
pub use error::{CoordinationError, ErrorKind, Result};
pub use hold::{HoldWatch, LockState};
pub use lock::{LockCoordinator, LockLease};
pub use manifest::SemaphoreManifest;
pub use monitor::LossReason;
pub use renewal::{RenewalState, SessionRenewalLoop};
pub use semaphore::{SemaphoreCoordinator, SemaphoreLease};

pub use kvlock_common::{
    BlockingWaiter, CoordinationStore, KeyValueGateway, SessionGateway, StoreError,
};
pub use tokio_util::sync::CancellationToken;
