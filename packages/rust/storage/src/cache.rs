//! In-process TTL cache with lazy expiry.
//!
//! Entries are immutable and shared behind `Arc`; a `put` swaps the whole
//! entry, so readers holding an old `Arc` keep a consistent snapshot.
//! Expired entries behave as absent and are purged on access.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

/// A cached value with its write time and lifetime.
#[derive(Debug)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub written_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.written_at) >= self.ttl
    }

    /// Remaining lifetime, zero once expired.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.ttl.saturating_sub(now.duration_since(self.written_at))
    }
}

/// Keyed TTL store shared across sessions.
#[derive(Debug)]
pub struct CacheStore<V> {
    entries: RwLock<HashMap<String, Arc<CacheEntry<V>>>>,
}

impl<V> Default for CacheStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CacheStore<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a live entry. An expired entry is purged and reported absent.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        let now = Instant::now();
        let entry = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries.get(key).cloned()?
        };

        if !entry.is_expired(now) {
            return Some(entry);
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        // Only purge the entry we saw; a concurrent put may have replaced it.
        if entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &entry))
        {
            entries.remove(key);
            tracing::debug!(key, "cache entry expired");
        }
        None
    }

    /// Insert or atomically replace the entry for `key`.
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration) -> Arc<CacheEntry<V>> {
        let key = key.into();
        let entry = Arc::new(CacheEntry {
            key: key.clone(),
            value,
            written_at: Instant::now(),
            ttl,
        });
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, Arc::clone(&entry));
        entry
    }

    /// Remove the entry for `key`. Returns whether one was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key).is_some()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> CacheStore<V> {
    /// Clone of the live value for `key`.
    pub fn get_value(&self, key: &str) -> Option<V> {
        self.get(key).map(|entry| entry.value.clone())
    }
}
