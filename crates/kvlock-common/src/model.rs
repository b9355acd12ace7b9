//! Value types crossing the store seams
//!
//! Field names follow the Consul wire shape (`Key`, `ModifyIndex`, `Session`, ...)
//! so a transport adapter can (de)serialize them directly.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

use crate::utils::duration_str;

// ============================================================================
// KV Models
// ============================================================================

/// An index-stamped key/value entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    #[serde(rename = "Key")]
    pub key: String,

    #[serde(rename = "CreateIndex")]
    pub create_index: u64,

    #[serde(rename = "ModifyIndex")]
    pub modify_index: u64,

    /// Number of times the key has been acquired by a session
    #[serde(rename = "LockIndex")]
    pub lock_index: u64,

    #[serde(rename = "Flags")]
    pub flags: u64,

    #[serde(rename = "Value", with = "base64_bytes", default)]
    pub value: Vec<u8>,

    #[serde(rename = "Session", skip_serializing_if = "Option::is_none", default)]
    pub session: Option<String>,
}

impl KvPair {
    /// Whether the key is currently held by the given session
    pub fn is_held_by(&self, session_id: &str) -> bool {
        self.session.as_deref() == Some(session_id)
    }

    /// Decode the value as UTF-8
    pub fn decoded_value(&self) -> Option<String> {
        String::from_utf8(self.value.clone()).ok()
    }
}

/// A conditional write.
///
/// `session: Some(id)` acquires the key for that session, `None` leaves the
/// key unheld (clearing any previous holder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvWrite {
    pub key: String,
    pub value: Vec<u8>,
    pub flags: u64,
    pub session: Option<String>,
}

impl KvWrite {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            flags: 0,
            session: None,
        }
    }

    pub fn with_flags(mut self, flags: u64) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_session(mut self, session: Option<String>) -> Self {
        self.session = session;
        self
    }
}

// ============================================================================
// Session Models
// ============================================================================

/// What happens to keys held by a session when it is invalidated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBehavior {
    /// Clear the `Session` field, keep the key
    #[default]
    Release,
    /// Delete the key
    Delete,
}

impl std::fmt::Display for SessionBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionBehavior::Release => write!(f, "release"),
            SessionBehavior::Delete => write!(f, "delete"),
        }
    }
}

/// Session create request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "TTL", with = "duration_str")]
    pub ttl: Duration,

    #[serde(rename = "Behavior", default)]
    pub behavior: SessionBehavior,

    #[serde(rename = "LockDelay", with = "duration_str")]
    pub lock_delay: Duration,
}

impl SessionRequest {
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ttl,
            behavior: SessionBehavior::Release,
            lock_delay: Duration::from_secs(15),
        }
    }

    pub fn with_behavior(mut self, behavior: SessionBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_lock_delay(mut self, lock_delay: Duration) -> Self {
        self.lock_delay = lock_delay;
        self
    }
}

/// A live session as reported by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "TTL", with = "duration_str")]
    pub ttl: Duration,

    #[serde(rename = "Behavior")]
    pub behavior: SessionBehavior,

    #[serde(rename = "LockDelay", with = "duration_str")]
    pub lock_delay: Duration,

    #[serde(rename = "CreateIndex")]
    pub create_index: u64,
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            None => Ok(Vec::new()),
            Some(s) => BASE64.decode(s).map_err(serde::de::Error::custom),
        }
    }
}
