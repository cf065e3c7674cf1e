//! TTL-bound key/value cache.
//!
//! Holds serialized read projections and refresh guard markers. Expiry is
//! checked on access, so an expired key behaves exactly like a missing one.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::trace;

/// A key/value store with per-key TTL and an atomic conditional set.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a live value.
    async fn get(&self, key: &str) -> Option<String>;

    /// Set a value, replacing any previous one.
    async fn set(&self, key: &str, payload: String, ttl: Duration);

    /// Set a value only if the key is absent or expired. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, payload: String, ttl: Duration) -> bool;

    /// Delete keys, returning how many live keys were removed.
    async fn delete(&self, keys: &[String]) -> usize;

    /// Remaining lifetime of a live key.
    async fn ttl(&self, key: &str) -> Option<Duration>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(payload: String, ttl: Duration) -> Self {
        Self {
            payload,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process [`CacheStore`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until touched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_if_expired(&self, key: &str, now: Instant) {
        if self.entries.remove_if(key, |_, e| !e.is_live(now)).is_some() {
            trace!(key, "evicted expired cache entry");
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.payload.clone());

        if hit.is_none() {
            self.evict_if_expired(key, now);
        }
        hit
    }

    async fn set(&self, key: &str, payload: String, ttl: Duration) {
        self.entries
            .insert(key.to_string(), CacheEntry::new(payload, ttl));
    }

    async fn set_if_absent(&self, key: &str, payload: String, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(CacheEntry::new(payload, ttl));
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(payload, ttl));
                true
            }
        }
    }

    async fn delete(&self, keys: &[String]) -> usize {
        let now = Instant::now();
        keys.iter()
            .filter_map(|key| self.entries.remove(key))
            .filter(|(_, e)| e.is_live(now))
            .count()
    }

    async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.expires_at - now)
    }
}
