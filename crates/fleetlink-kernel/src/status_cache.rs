//! [`StatusCache`] – suppresses redundant device status updates.
//!
//! A status update for a key is let through when
//!
//! 1. the key has never been seen,
//! 2. the status differs from the cached one, or
//! 3. the heartbeat interval has elapsed since the last accepted update.
//!
//! Entries not observed for longer than the TTL are purged by
//! [`StatusCache::purge_expired`], which [`StatusCache::spawn_sweeper`] runs
//! on a timer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct CacheEntry<S> {
    status: S,
    /// Last observation, accepted or not.
    last_updated: Instant,
    /// Last accepted update.
    last_sent: Instant,
    update_count: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// StatusCache
// ────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```
/// use fleetlink_kernel::status_cache::StatusCache;
///
/// let cache = StatusCache::new();
/// assert!(cache.check_and_update("agv-01", "DRIVING"));
/// assert!(!cache.check_and_update("agv-01", "DRIVING"));
/// assert!(cache.check_and_update("agv-01", "IDLE"));
/// ```
pub struct StatusCache<S> {
    entries: RwLock<HashMap<String, CacheEntry<S>>>,
    heartbeat: Duration,
    ttl: Duration,
}

impl<S: PartialEq + Clone> StatusCache<S> {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_HEARTBEAT, DEFAULT_TTL)
    }

    pub fn with_config(heartbeat: Duration, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            heartbeat,
            ttl,
        }
    }

    /// Whether `status` should be forwarded for `key`.  Read-only.
    pub fn should_update(&self, key: &str, status: &S) -> bool {
        match self.read().get(key) {
            None => true,
            Some(entry) => self.accepts(entry, status),
        }
    }

    /// Record `status` as the last accepted update for `key`.
    pub fn update(&self, key: &str, status: S) {
        let now = Instant::now();
        let mut entries = self.write();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.status = status;
                entry.last_updated = now;
                entry.last_sent = now;
                entry.update_count += 1;
            }
            None => {
                entries.insert(
                    key.to_string(),
                    CacheEntry {
                        status,
                        last_updated: now,
                        last_sent: now,
                        update_count: 1,
                    },
                );
            }
        }
    }

    /// [`should_update`](Self::should_update) and
    /// [`update`](Self::update) as one critical section.  Rejected
    /// observations still refresh the entry's TTL.
    pub fn check_and_update(&self, key: &str, status: S) -> bool {
        self.check_and_update_with(key, status, || true)
    }

    /// Like [`check_and_update`](Self::check_and_update), but an accepted
    /// status is only recorded when `admit` also agrees.  `admit` runs under
    /// the key's write lock and is not called for rejected statuses.  A
    /// status turned away by `admit` stays unrecorded, so the next
    /// observation of it is accepted again.
    pub fn check_and_update_with(&self, key: &str, status: S, admit: impl FnOnce() -> bool) -> bool {
        let now = Instant::now();
        let mut entries = self.write();
        let accepted = entries
            .get(key)
            .is_none_or(|entry| self.accepts(entry, &status));
        if !accepted || !admit() {
            if let Some(entry) = entries.get_mut(key) {
                entry.last_updated = now;
            }
            return false;
        }
        match entries.get_mut(key) {
            Some(entry) => {
                entry.status = status;
                entry.last_updated = now;
                entry.last_sent = now;
                entry.update_count += 1;
            }
            None => {
                entries.insert(
                    key.to_string(),
                    CacheEntry {
                        status,
                        last_updated: now,
                        last_sent: now,
                        update_count: 1,
                    },
                );
            }
        }
        true
    }

    pub fn get(&self, key: &str) -> Option<S> {
        self.read().get(key).map(|e| e.status.clone())
    }

    /// Number of accepted updates recorded for `key`.
    pub fn update_count(&self, key: &str) -> Option<u64> {
        self.read().get(key).map(|e| e.update_count)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop entries not observed within the TTL.  Returns how many were
    /// removed.
    ///
    /// Candidates are collected under the read lock; the write lock is only
    /// taken to remove them, re-checking each one.
    pub fn purge_expired(&self) -> usize {
        let expired: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, e)| e.last_updated.elapsed() > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let mut entries = self.write();
        let mut purged = 0;
        for key in expired {
            if entries
                .get(&key)
                .is_some_and(|e| e.last_updated.elapsed() > self.ttl)
            {
                entries.remove(&key);
                purged += 1;
            }
        }
        purged
    }

    fn accepts(&self, entry: &CacheEntry<S>, status: &S) -> bool {
        entry.status != *status || entry.last_sent.elapsed() > self.heartbeat
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry<S>>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry<S>>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S> StatusCache<S>
where
    S: PartialEq + Clone + Send + Sync + 'static,
{
    /// Run [`purge_expired`](Self::purge_expired) every `interval` until the
    /// returned handle is aborted.  A zero interval is treated as one
    /// millisecond.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = self.purge_expired();
                if purged > 0 {
                    info!(purged, remaining = self.len(), "status cache purged expired entries");
                } else {
                    debug!(entries = self.len(), "status cache sweep found nothing to purge");
                }
            }
        })
    }
}

impl<S: PartialEq + Clone> Default for StatusCache<S> {
    fn default() -> Self {
        Self::new()
    }
}
