// In-memory KV table with a global modify index
// Writes are stamped from one monotonically increasing counter and every
// change is published on a watch channel so blocking reads wake on change.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::debug;

use kvlock_common::{KvPair, KvWrite, SessionBehavior};

/// Outcome of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Written(u64),
    /// Index mismatch, or key missing for a non-zero index
    StaleIndex,
    /// Key is held by a different session
    Held,
    /// Key is inside a lock-delay window
    LockDelayed,
}

/// KV table service
pub struct MemKvService {
    /// key -> entry
    store: DashMap<String, KvPair>,
    /// key -> index of the delete that removed it
    tombstones: DashMap<String, u64>,
    /// key -> end of the lock-delay window
    lock_delays: DashMap<String, Instant>,
    /// Global index counter
    index: AtomicU64,
    changes: watch::Sender<u64>,
}

impl MemKvService {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(1);
        Self {
            store: DashMap::new(),
            tombstones: DashMap::new(),
            lock_delays: DashMap::new(),
            index: AtomicU64::new(1),
            changes,
        }
    }

    /// Get the next index
    pub fn next_index(&self) -> u64 {
        self.index.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Latest index handed out
    pub fn current_index(&self) -> u64 {
        self.index.load(Ordering::SeqCst)
    }

    /// Receiver notified with the new index after every change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn publish(&self, index: u64) {
        self.changes.send_replace(index);
    }

    /// Get a single key
    pub fn get(&self, key: &str) -> Option<KvPair> {
        self.store.get(key).map(|entry| entry.value().clone())
    }

    /// Get keys with prefix, sorted by key
    pub fn list(&self, prefix: &str) -> Vec<KvPair> {
        let mut pairs: Vec<KvPair> = self
            .store
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.value().clone())
            .collect();
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        pairs
    }

    /// Highest index of any write or delete at `key_or_prefix`.
    ///
    /// A path ending in `/` is watched as a prefix, anything else as a
    /// single key.
    pub fn watch_index(&self, key_or_prefix: &str) -> u64 {
        if key_or_prefix.ends_with('/') {
            self.prefix_index(key_or_prefix)
        } else {
            self.key_index(key_or_prefix)
        }
    }

    /// Highest index of a write or delete of exactly `key`
    pub fn key_index(&self, key: &str) -> u64 {
        let live = self
            .store
            .get(key)
            .map(|entry| entry.modify_index)
            .unwrap_or(0);
        let deleted = self
            .tombstones
            .get(key)
            .map(|entry| *entry.value())
            .unwrap_or(0);
        live.max(deleted)
    }

    /// Highest index of any write or delete under `prefix`
    pub fn prefix_index(&self, prefix: &str) -> u64 {
        let live = self
            .store
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.modify_index)
            .max()
            .unwrap_or(0);
        let deleted = self
            .tombstones
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| *entry.value())
            .max()
            .unwrap_or(0);
        live.max(deleted)
    }

    fn lock_delayed(&self, key: &str) -> bool {
        let until = self.lock_delays.get(key).map(|entry| *entry.value());
        match until {
            Some(until) if until > Instant::now() => true,
            Some(_) => {
                self.lock_delays.remove(key);
                false
            }
            None => false,
        }
    }

    /// Check-and-set: only write if the key's modify index matches.
    ///
    /// Callers must have verified that `write.session`, if any, is live.
    pub fn cas(&self, write: KvWrite, expected_index: u64) -> CasOutcome {
        let acquiring = write.session.clone();
        let delayed = acquiring.is_some() && self.lock_delayed(&write.key);

        let outcome = match self.store.entry(write.key.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                if expected_index == 0 || existing.modify_index != expected_index {
                    CasOutcome::StaleIndex
                } else if let (Some(holder), Some(me)) = (&existing.session, &acquiring)
                    && holder != me
                {
                    CasOutcome::Held
                } else if delayed && existing.session != acquiring {
                    CasOutcome::LockDelayed
                } else {
                    let index = self.next_index();
                    if existing.session.is_none() && acquiring.is_some() {
                        existing.lock_index += 1;
                    }
                    existing.modify_index = index;
                    existing.value = write.value;
                    existing.flags = write.flags;
                    existing.session = acquiring;
                    CasOutcome::Written(index)
                }
            }
            Entry::Vacant(vacant) => {
                if expected_index != 0 {
                    CasOutcome::StaleIndex
                } else if delayed {
                    CasOutcome::LockDelayed
                } else {
                    let index = self.next_index();
                    let lock_index = u64::from(acquiring.is_some());
                    vacant.insert(KvPair {
                        key: write.key.clone(),
                        create_index: index,
                        modify_index: index,
                        lock_index,
                        flags: write.flags,
                        value: write.value,
                        session: acquiring,
                    });
                    CasOutcome::Written(index)
                }
            }
        };

        if let CasOutcome::Written(index) = outcome {
            self.tombstones.remove(&write.key);
            self.publish(index);
        }
        outcome
    }

    /// Unconditional put (no session)
    pub fn put(&self, key: &str, value: &[u8], flags: u64) -> KvPair {
        let index = self.next_index();
        let pair = {
            let mut entry = self.store.entry(key.to_string()).or_insert_with(|| KvPair {
                key: key.to_string(),
                create_index: index,
                modify_index: index,
                lock_index: 0,
                flags,
                value: Vec::new(),
                session: None,
            });
            entry.modify_index = index;
            entry.value = value.to_vec();
            entry.flags = flags;
            entry.clone()
        };
        self.tombstones.remove(key);
        self.publish(index);
        pair
    }

    /// Delete a key
    pub fn delete(&self, key: &str) -> bool {
        if self.store.remove(key).is_none() {
            return false;
        }
        let index = self.next_index();
        self.tombstones.insert(key.to_string(), index);
        self.publish(index);
        true
    }

    /// Delete a key only if its modify index matches
    pub fn delete_cas(&self, key: &str, expected_index: u64) -> bool {
        let removed = self
            .store
            .remove_if(key, |_, pair| pair.modify_index == expected_index)
            .is_some();
        if removed {
            let index = self.next_index();
            self.tombstones.insert(key.to_string(), index);
            self.publish(index);
        }
        removed
    }

    /// Apply a session invalidation to every key it holds.
    ///
    /// Held keys are released or deleted according to `behavior`, and a
    /// non-zero `lock_delay` blocks re-acquisition of those keys.
    /// Returns the number of keys affected.
    pub fn invalidate_session(
        &self,
        session_id: &str,
        behavior: SessionBehavior,
        lock_delay: Duration,
    ) -> usize {
        let held: Vec<String> = self
            .store
            .iter()
            .filter(|entry| entry.session.as_deref() == Some(session_id))
            .map(|entry| entry.key().clone())
            .collect();

        if held.is_empty() {
            return 0;
        }

        if !lock_delay.is_zero() {
            let until = Instant::now() + lock_delay;
            for key in &held {
                self.lock_delays.insert(key.clone(), until);
            }
        }

        let mut last_index = 0;
        for key in &held {
            let index = self.next_index();
            match behavior {
                SessionBehavior::Release => {
                    if let Some(mut pair) = self.store.get_mut(key) {
                        pair.session = None;
                        pair.modify_index = index;
                    }
                }
                SessionBehavior::Delete => {
                    self.store.remove(key);
                    self.tombstones.insert(key.clone(), index);
                }
            }
            last_index = index;
        }
        debug!(
            "Invalidated session '{}': {} keys ({})",
            session_id,
            held.len(),
            behavior
        );

        self.publish(last_index);
        held.len()
    }
}

impl Default for MemKvService {
    fn default() -> Self {
        Self::new()
    }
}
