/// Frequency-evicting result cache with a time-to-live.
///
/// Results are keyed by `(db, collection, query)`. The cache keeps the total
/// serialized size of its entries under a byte budget:
///
/// - on insert, the least frequently read entry is evicted (oldest first on
///   ties) until the new entry fits
/// - entries older than the TTL, measured from insertion, are purged after
///   every insert and are never returned by `get`
/// - an entry larger than the whole budget is not stored
///
/// # Example
///
/// ```ignore
/// use viewcache::cache::ResultCache;
/// use viewcache::config::CacheConfig;
/// use serde_json::json;
///
/// let cache: ResultCache<Vec<serde_json::Value>> = ResultCache::new(CacheConfig::default());
/// let query = json!([{"limit": {"limit": 5}}]);
/// cache.set(&query, "movies", "db", vec![json!({"_id": 1})])?;
/// assert!(cache.has(&query, "movies", "db"));
/// cache.invalidate_collection("movies", "db");
/// ```
use crate::config::CacheConfig;
use crate::error::CacheResult;
use crate::types::canonical_value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Key of one cached result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub db: String,
    pub collection: String,
    /// Canonical JSON of the normalized query.
    pub query: String,
}

impl CacheKey {
    /// Build a key. Numerically equal literals in `query` produce one key.
    pub fn new(query: &JsonValue, collection: &str, db: &str) -> Self {
        Self {
            db: db.to_string(),
            collection: collection.to_string(),
            query: canonical_value(query).to_string(),
        }
    }

    fn size(&self) -> usize {
        self.db.len() + self.collection.len() + self.query.len()
    }

    fn is_in(&self, collection: &str, db: &str) -> bool {
        self.collection == collection && self.db == db
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.db, self.collection, self.query)
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    result: V,
    size: usize,
    frequency: u64,
    inserted_at: DateTime<Utc>,
    sequence: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.inserted_at > ttl
    }
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    bytes_used: usize,
    next_sequence: u64,
}

impl<V> CacheState<V> {
    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.bytes_used = self.bytes_used.saturating_sub(entry.size);
        Some(entry)
    }

    /// Key of the least frequently read entry, oldest first on ties.
    fn eviction_candidate(&self) -> Option<CacheKey> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| (e.frequency, e.sequence))
            .map(|(k, _)| k.clone())
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub bytes_used: usize,
    pub max_bytes: usize,
}

impl CacheStats {
    /// Fraction of reads that hit, or 0 before any read.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Thread-safe result cache.
///
/// One mutex guards the entry map, so eviction, invalidation and insertion
/// never interleave. Counters are atomics readable without the lock.
#[derive(Debug)]
pub struct ResultCache<V> {
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
    counters: Counters,
}

impl<V> ResultCache<V>
where
    V: Serialize + Clone,
{
    /// Create an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                bytes_used: 0,
                next_sequence: 0,
            }),
            counters: Counters::default(),
        }
    }

    /// Create a cache with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// The cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether caching is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Look up a result, counting the read towards its frequency.
    ///
    /// An expired entry is removed and reported as a miss.
    pub fn get(&self, query: &JsonValue, collection: &str, db: &str) -> Option<V> {
        self.get_at(&CacheKey::new(query, collection, db), Utc::now())
    }

    fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<V> {
        if !self.config.enabled {
            return None;
        }
        let ttl = self.ttl();
        let mut state = self.lock();
        match state.entries.get_mut(key) {
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) if !entry.is_expired(ttl, now) => {
                entry.frequency += 1;
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.result.clone());
            }
            Some(_) => {}
        }
        state.remove(key);
        self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Whether a live entry exists. Does not touch its frequency.
    pub fn has(&self, query: &JsonValue, collection: &str, db: &str) -> bool {
        let key = CacheKey::new(query, collection, db);
        let ttl = self.ttl();
        let now = Utc::now();
        self.lock()
            .entries
            .get(&key)
            .is_some_and(|e| !e.is_expired(ttl, now))
    }

    /// Store a result. Returns whether it was stored.
    ///
    /// Fails only if the result cannot be serialized to measure its size.
    pub fn set(&self, query: &JsonValue, collection: &str, db: &str, result: V) -> CacheResult<bool> {
        self.set_at(CacheKey::new(query, collection, db), result, Utc::now())
    }

    fn set_at(&self, key: CacheKey, result: V, now: DateTime<Utc>) -> CacheResult<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        let size = serde_json::to_vec(&result)?.len() + key.size();
        if size > self.config.max_bytes {
            tracing::debug!(key = %key, size, budget = self.config.max_bytes, "result too large to cache");
            return Ok(false);
        }

        let mut state = self.lock();
        state.remove(&key);
        while state.bytes_used + size > self.config.max_bytes {
            let Some(victim) = state.eviction_candidate() else {
                break;
            };
            state.remove(&victim);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %victim, "evicted cache entry");
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.bytes_used += size;
        state.entries.insert(
            key,
            CacheEntry {
                result,
                size,
                frequency: 0,
                inserted_at: now,
                sequence,
            },
        );
        self.purge_locked(&mut state, now);
        Ok(true)
    }

    /// Remove every entry.
    pub fn invalidate_all(&self) -> usize {
        let mut state = self.lock();
        let removed = state.entries.len();
        state.entries.clear();
        state.bytes_used = 0;
        if removed > 0 {
            tracing::debug!(removed, "cache cleared");
        }
        removed
    }

    /// Remove every entry for one `(collection, db)`.
    pub fn invalidate_collection(&self, collection: &str, db: &str) -> usize {
        let mut state = self.lock();
        let keys: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|k| k.is_in(collection, db))
            .cloned()
            .collect();
        for key in &keys {
            state.remove(key);
        }
        if !keys.is_empty() {
            tracing::debug!(db, collection, removed = keys.len(), "cache entries invalidated");
        }
        keys.len()
    }

    /// Remove every entry for a whole database.
    pub fn invalidate_database(&self, db: &str) -> usize {
        let mut state = self.lock();
        let keys: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|k| k.db == db)
            .cloned()
            .collect();
        for key in &keys {
            state.remove(key);
        }
        keys.len()
    }

    /// Purge expired entries now. Hosts may call this from a timer.
    pub fn purge_expired(&self) -> usize {
        let mut state = self.lock();
        self.purge_locked(&mut state, Utc::now())
    }

    fn purge_locked(&self, state: &mut CacheState<V>, now: DateTime<Utc>) -> usize {
        let ttl = self.ttl();
        let expired: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(ttl, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        if !expired.is_empty() {
            self.counters
                .expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            tracing::debug!(expired = expired.len(), "purged expired cache entries");
        }
        expired.len()
    }

    /// Number of entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries: state.entries.len(),
            bytes_used: state.bytes_used,
            max_bytes: self.config.max_bytes,
        }
    }

    fn ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.ttl).unwrap_or(chrono::Duration::MAX)
    }

    /// Entries are derived data, so a panic while holding the lock cannot
    /// leave anything worse than a stale entry.
    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
