//! Short-term caches with expiry
//!
//! A single mutex guards each cache. Expired entries are purged only when
//! an insert finds the map full; there is no background sweeper.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::error::lock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("entry not found")]
    NotFound,

    #[error("cache full")]
    Full,
}

/// Get/Set/Del/Clean over a keyed cache
pub trait Cache<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Result<V, CacheError>;
    fn set(&self, key: K, value: V) -> Result<(), CacheError>;
    fn del(&self, key: &K);
    /// Drop every entry
    fn clean(&self);
}

/// What `set` does when the cache is full of live entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFull {
    EvictOldest,
    Reject,
}

struct Entry<V> {
    value: V,
    inserted: Instant,
    expires: Instant,
}

/// Capacity-bounded cache whose entries expire after a fixed TTL
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    capacity: usize,
    ttl: Duration,
    on_full: OnFull,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration, on_full: OnFull) -> Self {
        TtlCache { entries: Mutex::new(HashMap::new()), capacity: capacity.max(1), ttl, on_full }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<K, V> Cache<K, V> for TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Result<V, CacheError> {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(entry) if entry.expires > Instant::now() => Ok(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                Err(CacheError::NotFound)
            }
            None => Err(CacheError::NotFound),
        }
    }

    /// Set: 𝒦 × 𝒱 → {ok, Full}
    ///
    /// 1. Replacing an existing key never needs room
    /// 2. At capacity, purge expired entries
    /// 3. Still full: evict the oldest insert, or reject
    fn set(&self, key: K, value: V) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);

        // 1. Replace
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            // 2. Purge
            entries.retain(|_, e| e.expires > now);

            // 3. Policy
            if entries.len() >= self.capacity {
                match self.on_full {
                    OnFull::Reject => return Err(CacheError::Full),
                    OnFull::EvictOldest => {
                        let oldest = entries.iter().min_by_key(|(_, e)| e.inserted).map(|(k, _)| k.clone());
                        if let Some(oldest) = oldest {
                            entries.remove(&oldest);
                        }
                    }
                }
            }
        }
        entries.insert(key, Entry { value, inserted: now, expires: now + self.ttl });
        Ok(())
    }

    fn del(&self, key: &K) {
        lock(&self.entries).remove(key);
    }

    fn clean(&self) {
        lock(&self.entries).clear();
    }
}
