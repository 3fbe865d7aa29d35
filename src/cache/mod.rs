//! Key-value cache abstraction.
//!
//! The engine only needs get/set/delete with an optional TTL: the CHECK
//! pre-flight stashes resolved connect parameters here and CONNECT picks
//! them up. [`MemoryCache`] is the process-local implementation; entries
//! expire lazily on read and through [`MemoryCache::cleanup_expired`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

/// Abstract key-value cache with string values
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    /// Store a value; `ttl = None` keeps it until deleted
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>);

    /// Remove a value, returning whether it existed
    async fn delete(&self, key: &str) -> bool;
}

/// Cache hit/miss counters
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheMetrics {
    /// Get the hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

/// A cached value with its expiry
#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| Instant::now() >= expires_at)
            .unwrap_or(false)
    }
}

/// In-process cache over a concurrent map
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    metrics: CacheMetrics,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.entries.len());
        self.metrics
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        self.entries.insert(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into(), None).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert!(cache.delete("k").await);
        assert!(!cache.delete("k").await);
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into(), Some(Duration::ZERO)).await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.is_empty());
        assert_eq!(cache.metrics().misses.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let cache = MemoryCache::new();
        cache.set("a", "1".into(), Some(Duration::ZERO)).await;
        cache.set("b", "2".into(), None).await;
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
