//! TTL cache with copy-on-write payloads.
//!
//! Payloads are stored behind [`Arc`] and replaced wholesale on insert, so a reader that
//! copied a value out keeps a consistent snapshot even if the entry is refreshed while it
//! is still computing. Stale entries are kept so callers can fall back to them when the
//! upstream is failing.

use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::{hash::Hash, sync::Arc, time::Duration};
use tokio::time::Instant;

/// Cached payload plus the instant it was stored.
#[derive(Debug)]
pub struct CacheEntry<V> {
    value: Arc<V>,
    stored_at: Instant,
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            stored_at: self.stored_at,
        }
    }
}

impl<V> CacheEntry<V> {
    fn new(value: Arc<V>) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
        }
    }

    pub fn value(&self) -> Arc<V> {
        Arc::clone(&self.value)
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.stored_at)
    }

    /// Valid while `now - stored_at < ttl`.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

/// Keyed cache whose entries expire after a fixed TTL but are never evicted implicitly.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<FnvHashMap<K, CacheEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(FnvHashMap::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Entry for `key` if present, regardless of age.
    pub fn entry(&self, key: &K) -> Option<CacheEntry<V>> {
        self.entries.read().get(key).cloned()
    }

    /// Value for `key` only while it is within TTL.
    pub fn get_fresh(&self, key: &K) -> Option<Arc<V>> {
        self.entry(key)
            .filter(|entry| entry.is_fresh(self.ttl))
            .map(|entry| entry.value())
    }

    /// Last stored value for `key`, even if expired.
    pub fn get_stale(&self, key: &K) -> Option<Arc<V>> {
        self.entry(key).map(|entry| entry.value())
    }

    /// Replace the value for `key` and return the shared payload.
    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.entries
            .write()
            .insert(key, CacheEntry::new(Arc::clone(&value)));
        value
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.entries.write().remove(key).map(|entry| entry.value)
    }

    /// Drop every entry whose key fails `keep`.
    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) {
        self.entries.write().retain(|key, _| keep(key));
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
