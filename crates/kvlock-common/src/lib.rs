//! Shared contracts for kvlock
//!
//! This crate defines the three collaborators the coordination layer is
//! built on, so backends and coordinators only depend on the traits:
//! - `KeyValueGateway`: index-stamped get / CAS / delete / list
//! - `SessionGateway`: session create / renew / destroy / info
//! - `BlockingWaiter`: change-index based long-poll reads
//!
//! Plus the value types crossing those seams and the `StoreError` they return.

pub mod error;
pub mod gateway;
pub mod model;
pub mod utils;

pub use error::{StoreError, StoreResult};
pub use gateway::{BlockingWaiter, CoordinationStore, KeyValueGateway, SessionGateway};
pub use model::{KvPair, KvWrite, SessionBehavior, SessionInfo, SessionRequest};
pub use utils::{duration_str, format_duration, parse_duration};
