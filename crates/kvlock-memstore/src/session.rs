//! In-memory session table
//!
//! Sessions are leases: each carries a TTL measured from its last renewal.
//! Expiry is lazy (checked on access) plus whatever the owning store's
//! reaper sweeps. Invalidating the keys a session held is the store's job.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info};

use kvlock_common::{SessionInfo, SessionRequest};

#[derive(Clone)]
struct StoredSession {
    info: SessionInfo,
    last_renewed: Instant,
}

impl StoredSession {
    fn is_expired(&self) -> bool {
        self.last_renewed.elapsed() > self.info.ttl
    }
}

/// Session table with TTL-based expiry
pub struct MemSessionService {
    sessions: DashMap<String, StoredSession>,
    node_name: String,
}

impl MemSessionService {
    pub fn new() -> Self {
        let node_name = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "kvlock-node".to_string());

        Self {
            sessions: DashMap::new(),
            node_name,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Create a new session stamped with `create_index`
    pub fn create(&self, req: SessionRequest, create_index: u64) -> SessionInfo {
        let session_id = uuid::Uuid::new_v4().to_string();
        let name = if req.name.is_empty() {
            format!("session@{}", self.node_name)
        } else {
            req.name
        };

        let info = SessionInfo {
            id: session_id.clone(),
            name,
            ttl: req.ttl,
            behavior: req.behavior,
            lock_delay: req.lock_delay,
            create_index,
        };

        self.sessions.insert(
            session_id.clone(),
            StoredSession {
                info: info.clone(),
                last_renewed: Instant::now(),
            },
        );
        debug!("Created session '{}' (ttl={:?})", session_id, info.ttl);

        info
    }

    /// Get session info; `None` if unknown or expired.
    ///
    /// Expired sessions are left in place so the store can invalidate
    /// the keys they hold before removing them.
    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        let stored = self.sessions.get(session_id)?;
        if stored.is_expired() {
            return None;
        }
        Some(stored.info.clone())
    }

    /// Whether the session exists and has not expired
    pub fn is_live(&self, session_id: &str) -> bool {
        self.get(session_id).is_some()
    }

    /// Reset the TTL clock; `None` if unknown or expired
    pub fn renew(&self, session_id: &str) -> Option<Duration> {
        let mut stored = self.sessions.get_mut(session_id)?;
        if stored.is_expired() {
            return None;
        }
        stored.last_renewed = Instant::now();
        Some(stored.info.ttl)
    }

    /// Remove a session, returning it if it existed (expired or not)
    pub fn remove(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.remove(session_id).map(|(_, stored)| stored.info)
    }

    /// IDs of sessions whose TTL has run out
    pub fn expired_ids(&self) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        if !expired.is_empty() {
            info!("Found {} expired sessions", expired.len());
        }
        expired
    }

    /// Number of live sessions
    pub fn live_count(&self) -> usize {
        self.sessions.iter().filter(|e| !e.is_expired()).count()
    }
}

impl Default for MemSessionService {
    fn default() -> Self {
        Self::new()
    }
}
