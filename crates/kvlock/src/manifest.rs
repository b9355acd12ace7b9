//! Semaphore manifest
//!
//! Stored under `<prefix>/.lock` as `{"Limit":N,"Holders":{"<session>":true}}`.
//! The manifest is only ever changed through CAS on its modify index, so
//! `holders.len() <= limit` holds for every written version.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct ManifestWire {
    #[serde(rename = "Limit")]
    limit: u32,

    #[serde(rename = "Holders", default)]
    holders: BTreeMap<String, bool>,
}

/// Decoded semaphore manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreManifest {
    limit: u32,
    holders: BTreeSet<String>,
}

impl SemaphoreManifest {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            holders: BTreeSet::new(),
        }
    }

    /// Decode the manifest stored at `key`
    pub fn decode(key: &str, raw: &[u8]) -> Result<Self> {
        let wire: ManifestWire =
            serde_json::from_slice(raw).map_err(|e| CoordinationError::CorruptedData {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        if wire.limit == 0 {
            return Err(CoordinationError::CorruptedData {
                key: key.to_string(),
                reason: "limit is zero".to_string(),
            });
        }

        Ok(Self {
            limit: wire.limit,
            holders: wire
                .holders
                .into_iter()
                .filter_map(|(session, held)| held.then_some(session))
                .collect(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = ManifestWire {
            limit: self.limit,
            holders: self.holders.iter().map(|s| (s.clone(), true)).collect(),
        };
        serde_json::to_vec(&wire).map_err(|e| CoordinationError::CorruptedData {
            key: String::new(),
            reason: e.to_string(),
        })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn holders(&self) -> impl Iterator<Item = &str> {
        self.holders.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.holders.len() >= self.limit as usize
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.holders.contains(session_id)
    }

    /// Add a holder; `false` when full or already present
    pub fn add(&mut self, session_id: &str) -> bool {
        if self.is_full() {
            return false;
        }
        self.holders.insert(session_id.to_string())
    }

    pub fn remove(&mut self, session_id: &str) -> bool {
        self.holders.remove(session_id)
    }

    /// Drop holders whose contender key is gone.
    ///
    /// Returns the number of holders removed.
    pub fn prune(&mut self, live: &HashSet<String>) -> usize {
        let before = self.holders.len();
        self.holders.retain(|session| live.contains(session));
        before - self.holders.len()
    }
}
