use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tidytask_core::CacheConfig;
use tracing::debug;

/// Urgency level reported for items without a due timestamp.
pub const NORMAL_LEVEL: &str = "normal";

/// Cached urgency entry.
#[derive(Debug, Clone)]
struct CacheEntry {
    level: String,
    stored_at: Instant,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    access_times: HashMap<String, Instant>,
    hits: u64,
    misses: u64,
}

/// Read-only cache statistics snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct UrgencyCacheStats {
    pub size: usize,
    pub max_size: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Bounded, time-expiring memoization of urgency levels derived from due
/// timestamps.
///
/// Keys coarsen the due timestamp down to a configurable bucket (one
/// minute by default) so that lookups within the same bucket share one
/// entry. Entries expire after the configured TTL and are evicted on
/// read; inserts at capacity evict the entry with the oldest access
/// time. A miss is a valid outcome, never an error.
///
/// Cheap to clone; clones share the same underlying storage.
#[derive(Clone)]
pub struct UrgencyCache {
    config: CacheConfig,
    inner: Arc<Mutex<CacheInner>>,
}

impl UrgencyCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(CacheInner::default())),
        }
    }

    /// Derive the cache key for a due timestamp.
    ///
    /// The due timestamp is rounded down to the configured bucket; the
    /// optional completion timestamp is appended at full precision.
    fn cache_key(&self, due: DateTime<Utc>, completed_at: Option<DateTime<Utc>>) -> String {
        let granularity = self.config.key_granularity_secs.max(1) as i64;
        let bucket = due.timestamp().div_euclid(granularity);

        match completed_at {
            Some(completed) => format!("due_{}_completed_{}", bucket, completed.timestamp_millis()),
            None => format!("due_{}", bucket),
        }
    }

    /// Look up the urgency level for a due timestamp.
    ///
    /// Items without a due timestamp are always `normal`; that fast path
    /// never touches storage and is not counted as a hit. An expired
    /// entry is evicted here and counted as a miss.
    pub fn get(
        &self,
        due: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Option<String> {
        let due = match due {
            Some(due) => due,
            None => return Some(NORMAL_LEVEL.to_string()),
        };

        let key = self.cache_key(due, completed_at);
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get(&key) {
            if entry.stored_at.elapsed() < self.config.ttl() {
                let level = entry.level.clone();
                inner.access_times.insert(key, Instant::now());
                inner.hits += 1;
                return Some(level);
            }
            inner.entries.remove(&key);
            inner.access_times.remove(&key);
        }

        inner.misses += 1;
        None
    }

    /// Store the urgency level for a due timestamp.
    ///
    /// No-op when the due timestamp is absent. At capacity, the entry
    /// with the oldest access time is evicted before inserting.
    pub fn set(
        &self,
        due: Option<DateTime<Utc>>,
        level: impl Into<String>,
        completed_at: Option<DateTime<Utc>>,
    ) {
        let due = match due {
            Some(due) => due,
            None => return,
        };

        let key = self.cache_key(due, completed_at);
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.entries.len() >= self.config.max_size {
            Self::evict_oldest(&mut inner);
        }

        inner.entries.insert(
            key.clone(),
            CacheEntry {
                level: level.into(),
                stored_at: now,
            },
        );
        inner.access_times.insert(key, now);
    }

    /// Memoization wrapper: return the cached level or compute and store it.
    pub fn get_or_compute<F>(
        &self,
        due: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        compute: F,
    ) -> String
    where
        F: FnOnce() -> String,
    {
        if let Some(level) = self.get(due, completed_at) {
            return level;
        }
        let level = compute();
        self.set(due, level.clone(), completed_at);
        level
    }

    /// Drop all entries and access-time records atomically.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.access_times.clear();
        debug!("urgency cache cleared");
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.config.ttl();
        let mut inner = self.inner.lock();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.stored_at.elapsed() >= ttl)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.entries.remove(key);
            inner.access_times.remove(key);
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "purged expired urgency entries");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only snapshot, no side effects.
    pub fn stats(&self) -> UrgencyCacheStats {
        let inner = self.inner.lock();
        let total = inner.hits + inner.misses;
        UrgencyCacheStats {
            size: inner.entries.len(),
            max_size: self.config.max_size,
            ttl_secs: self.config.ttl_secs,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
        }
    }

    fn evict_oldest(inner: &mut CacheInner) {
        let oldest = inner
            .access_times
            .iter()
            .min_by_key(|(_, accessed)| **accessed)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            inner.entries.remove(&key);
            inner.access_times.remove(&key);
            debug!(%key, "evicted least recently used urgency entry");
        }
    }
}
