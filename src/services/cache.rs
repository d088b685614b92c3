use dashmap::DashMap;
use std::time::{Duration, Instant};

/// A thread-safe cache with TTL support, keyed by upper-cased symbol.
pub struct QuoteCache<V> {
    data: DashMap<String, CacheEntry<V>>,
    ttl: Duration,
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V: Clone> QuoteCache<V> {
    /// Create a new cache with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            data: DashMap::new(),
            ttl,
        }
    }

    fn key(symbol: &str) -> String {
        symbol.trim().to_uppercase()
    }

    /// Get a value from the cache.
    pub fn get(&self, symbol: &str) -> Option<V> {
        let key = Self::key(symbol);
        let entry = self.data.get(&key)?;
        if entry.expires_at > Instant::now() {
            Some(entry.value.clone())
        } else {
            drop(entry);
            self.data.remove(&key);
            None
        }
    }

    /// Set a value in the cache.
    pub fn set(&self, symbol: &str, value: V) {
        self.data.insert(
            Self::key(symbol),
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Remove all expired entries from the cache.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.data.retain(|_, entry| entry.expires_at > now);
    }
}
