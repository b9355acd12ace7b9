//! Lock and semaphore options
//!
//! Options are explicit structs handed to the coordinator at construction.
//! They deserialize from the Consul field names (`Key`, `SessionTTL`,
//! `LockWaitTime`, ...) with durations written as `"15s"`, `"500ms"`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use kvlock_common::{SessionBehavior, duration_str};

use crate::error::{CoordinationError, Result};

// ============================================================================
// Defaults
// ============================================================================

/// Flag value marking a key as a lock key
pub const LOCK_FLAG_VALUE: u64 = 0x2ddccbc058a50c18;

/// Flag value marking a key as part of a semaphore
pub const SEMAPHORE_FLAG_VALUE: u64 = 0xe0f69a2baa414de0;

/// Name of the manifest sub-key under a semaphore prefix
pub const SEMAPHORE_LOCK_SUFFIX: &str = ".lock";

pub const DEFAULT_LOCK_SESSION_NAME: &str = "Consul API Lock";
pub const DEFAULT_SEMAPHORE_SESSION_NAME: &str = "Consul API Semaphore";
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(15);
pub const DEFAULT_LOCK_DELAY: Duration = Duration::from_secs(15);
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(15);
pub const DEFAULT_LOCK_RETRY_TIME: Duration = Duration::from_secs(5);
pub const DEFAULT_MONITOR_RETRY_TIME: Duration = Duration::from_secs(2);

/// Longest session TTL the store accepts
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Lock Options
// ============================================================================

/// Options for a `LockCoordinator`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Key to lock (e.g., "service/leader")
    #[serde(rename = "Key")]
    pub key: String,

    /// Value written with the lock
    #[serde(rename = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Existing session to use; never renewed or destroyed by the coordinator
    #[serde(rename = "Session", skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,

    #[serde(rename = "SessionName")]
    pub session_name: String,

    #[serde(rename = "SessionTTL", with = "duration_str")]
    pub session_ttl: Duration,

    /// Time before a key released by session invalidation can be re-acquired
    #[serde(rename = "LockDelay", with = "duration_str")]
    pub lock_delay: Duration,

    /// Upper bound of a single blocking wait
    #[serde(rename = "LockWaitTime", with = "duration_str")]
    pub lock_wait_time: Duration,

    /// Give up instead of waiting forever
    #[serde(rename = "LockTryOnce")]
    pub lock_try_once: bool,

    /// Total time budget for a try-once acquisition (defaults to the wait time)
    #[serde(
        rename = "LockTryOnceBudget",
        with = "duration_str::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub lock_try_once_budget: Option<Duration>,

    /// Pause after the store refuses an acquisition without the key changing
    #[serde(rename = "LockRetryTime", with = "duration_str")]
    pub lock_retry_time: Duration,

    /// Transport errors tolerated by the hold monitor
    #[serde(rename = "MonitorRetries")]
    pub monitor_retries: u32,

    #[serde(rename = "MonitorRetryTime", with = "duration_str")]
    pub monitor_retry_time: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            key: String::new(),
            value: None,
            session: None,
            session_name: DEFAULT_LOCK_SESSION_NAME.to_string(),
            session_ttl: DEFAULT_SESSION_TTL,
            lock_delay: DEFAULT_LOCK_DELAY,
            lock_wait_time: DEFAULT_WAIT_TIME,
            lock_try_once: false,
            lock_try_once_budget: None,
            lock_retry_time: DEFAULT_LOCK_RETRY_TIME,
            monitor_retries: 0,
            monitor_retry_time: DEFAULT_MONITOR_RETRY_TIME,
        }
    }
}

impl LockOptions {
    /// Options for `key` with every other field defaulted
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Use an existing session instead of creating one per acquisition
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_lock_delay(mut self, delay: Duration) -> Self {
        self.lock_delay = delay;
        self
    }

    pub fn with_wait_time(mut self, wait: Duration) -> Self {
        self.lock_wait_time = wait;
        self
    }

    /// Give up after roughly `budget` instead of waiting forever
    pub fn with_try_once(mut self, budget: Option<Duration>) -> Self {
        self.lock_try_once = true;
        self.lock_try_once_budget = budget;
        self
    }

    pub fn with_retry_time(mut self, retry: Duration) -> Self {
        self.lock_retry_time = retry;
        self
    }

    pub fn with_monitor_retries(mut self, retries: u32, every: Duration) -> Self {
        self.monitor_retries = retries;
        self.monitor_retry_time = every;
        self
    }

    /// Try-once budget in effect, `None` when waiting forever
    pub fn try_once_budget(&self) -> Option<Duration> {
        self.lock_try_once
            .then(|| self.lock_try_once_budget.unwrap_or(self.lock_wait_time))
    }

    /// Session request used when the coordinator creates its own session
    pub(crate) fn session_request(&self) -> kvlock_common::SessionRequest {
        kvlock_common::SessionRequest::new(self.session_name.clone(), self.session_ttl)
            .with_behavior(SessionBehavior::Release)
            .with_lock_delay(self.lock_delay)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(invalid("lock key must not be empty"));
        }
        validate_common(
            self.session.as_deref(),
            self.session_ttl,
            self.lock_wait_time,
            self.lock_try_once_budget,
            self.monitor_retry_time,
        )?;
        if self.lock_retry_time.is_zero() {
            return Err(invalid("lock retry time must be greater than zero"));
        }
        Ok(())
    }
}

// ============================================================================
// Semaphore Options
// ============================================================================

/// Options for a `SemaphoreCoordinator`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemaphoreOptions {
    /// Key prefix owned by the semaphore
    #[serde(rename = "Prefix")]
    pub prefix: String,

    /// Maximum number of concurrent holders
    #[serde(rename = "Limit")]
    pub limit: u32,

    /// Value written into the contender key
    #[serde(rename = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(rename = "Session", skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,

    #[serde(rename = "SessionName")]
    pub session_name: String,

    #[serde(rename = "SessionTTL", with = "duration_str")]
    pub session_ttl: Duration,

    #[serde(rename = "SemaphoreWaitTime", with = "duration_str")]
    pub semaphore_wait_time: Duration,

    #[serde(rename = "SemaphoreTryOnce")]
    pub semaphore_try_once: bool,

    #[serde(
        rename = "SemaphoreTryOnceBudget",
        with = "duration_str::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub semaphore_try_once_budget: Option<Duration>,

    #[serde(rename = "MonitorRetries")]
    pub monitor_retries: u32,

    #[serde(rename = "MonitorRetryTime", with = "duration_str")]
    pub monitor_retry_time: Duration,
}

impl Default for SemaphoreOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            limit: 1,
            value: None,
            session: None,
            session_name: DEFAULT_SEMAPHORE_SESSION_NAME.to_string(),
            session_ttl: DEFAULT_SESSION_TTL,
            semaphore_wait_time: DEFAULT_WAIT_TIME,
            semaphore_try_once: false,
            semaphore_try_once_budget: None,
            monitor_retries: 0,
            monitor_retry_time: DEFAULT_MONITOR_RETRY_TIME,
        }
    }
}

impl SemaphoreOptions {
    pub fn new(prefix: impl Into<String>, limit: u32) -> Self {
        Self {
            prefix: prefix.into(),
            limit,
            ..Default::default()
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_wait_time(mut self, wait: Duration) -> Self {
        self.semaphore_wait_time = wait;
        self
    }

    pub fn with_try_once(mut self, budget: Option<Duration>) -> Self {
        self.semaphore_try_once = true;
        self.semaphore_try_once_budget = budget;
        self
    }

    pub fn with_monitor_retries(mut self, retries: u32, every: Duration) -> Self {
        self.monitor_retries = retries;
        self.monitor_retry_time = every;
        self
    }

    pub fn try_once_budget(&self) -> Option<Duration> {
        self.semaphore_try_once.then(|| {
            self.semaphore_try_once_budget
                .unwrap_or(self.semaphore_wait_time)
        })
    }

    /// Prefix without a trailing slash
    pub(crate) fn base_prefix(&self) -> &str {
        self.prefix.trim_end_matches('/')
    }

    /// Key of the manifest (`<prefix>/.lock`)
    pub fn lock_key(&self) -> String {
        format!("{}/{}", self.base_prefix(), SEMAPHORE_LOCK_SUFFIX)
    }

    /// Key of the contender flag for `session_id` (`<prefix>/<session>`)
    pub fn contender_key(&self, session_id: &str) -> String {
        format!("{}/{}", self.base_prefix(), session_id)
    }

    /// Prefix listed and watched during acquisition (`<prefix>/`)
    pub(crate) fn watch_prefix(&self) -> String {
        format!("{}/", self.base_prefix())
    }

    /// Contender sessions are deleted with their keys on invalidation
    pub(crate) fn session_request(&self) -> kvlock_common::SessionRequest {
        kvlock_common::SessionRequest::new(self.session_name.clone(), self.session_ttl)
            .with_behavior(SessionBehavior::Delete)
            .with_lock_delay(Duration::ZERO)
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(CoordinationError::InvalidLimit(self.limit));
        }
        if self.base_prefix().trim().is_empty() {
            return Err(invalid("semaphore prefix must not be empty"));
        }
        validate_common(
            self.session.as_deref(),
            self.session_ttl,
            self.semaphore_wait_time,
            self.semaphore_try_once_budget,
            self.monitor_retry_time,
        )
    }
}

fn invalid(msg: impl Into<String>) -> CoordinationError {
    CoordinationError::InvalidConfig(msg.into())
}

fn validate_common(
    session: Option<&str>,
    ttl: Duration,
    wait: Duration,
    budget: Option<Duration>,
    monitor_retry_time: Duration,
) -> Result<()> {
    if session.is_some_and(|s| s.trim().is_empty()) {
        return Err(invalid("session must not be empty when set"));
    }
    if ttl.is_zero() || ttl > MAX_SESSION_TTL {
        return Err(invalid(format!(
            "session TTL must be within (0s, {}]",
            kvlock_common::format_duration(MAX_SESSION_TTL)
        )));
    }
    if wait.is_zero() {
        return Err(invalid("wait time must be greater than zero"));
    }
    if let Some(budget) = budget
        && budget < wait
    {
        return Err(invalid(format!(
            "try-once budget {} is shorter than the wait time {}",
            kvlock_common::format_duration(budget),
            kvlock_common::format_duration(wait)
        )));
    }
    if monitor_retry_time.is_zero() {
        return Err(invalid("monitor retry time must be greater than zero"));
    }
    Ok(())
}
