/// Configuration for the view cache engine.
///
/// Plain data with defaults and builder setters. Both structs are
/// serde-(de)serialisable so a host can load them from its own config file.
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default byte budget for cached results (64 MiB).
pub const DEFAULT_CACHE_BYTES: usize = 64 * 1024 * 1024;

/// Default time-to-live for cached results.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Result cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on the serialized size of all entries.
    pub max_bytes: usize,
    /// Age (since insertion) after which an entry is purged.
    pub ttl: Duration,
    /// When disabled, `set` is a no-op and every `get` misses.
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_CACHE_BYTES,
            ttl: DEFAULT_CACHE_TTL,
            enabled: true,
        }
    }
}

impl CacheConfig {
    /// Create a cache configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration that caches nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the byte budget.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Set the TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Enable or disable caching.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Result cache settings.
    pub cache: CacheConfig,
    /// Remember the last-seen version of each document in collections that
    /// have views, so updates and deletes without pre-images resolve.
    pub track_documents: bool,
    /// Key maintained values by accumulator content hash, rather than by
    /// output name, when rendering view rows for callers.
    pub use_field_hashes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            track_documents: true,
            use_field_hashes: true,
        }
    }
}

impl EngineConfig {
    /// Create an engine configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Enable or disable document tracking.
    pub fn with_track_documents(mut self, track: bool) -> Self {
        self.track_documents = track;
        self
    }

    /// Choose hash-keyed or name-keyed view rendering.
    pub fn with_field_hashes(mut self, enabled: bool) -> Self {
        self.use_field_hashes = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cache.max_bytes, 64 * 1024 * 1024);
        assert_eq!(config.cache.ttl, Duration::from_secs(300));
        assert!(config.cache.enabled);
        assert!(config.track_documents);
        assert!(config.use_field_hashes);
        assert!(!CacheConfig::disabled().enabled);
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::new()
            .with_cache(CacheConfig::new().with_max_bytes(1024).with_ttl(Duration::from_secs(5)))
            .with_track_documents(false)
            .with_field_hashes(false);
        assert_eq!(config.cache.max_bytes, 1024);
        assert_eq!(config.cache.ttl.as_secs(), 5);
        assert!(!config.track_documents);
        assert!(!config.use_field_hashes);
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_value(json!({"cache": {"max_bytes": 10}, "track_documents": false}))
                .unwrap();
        assert_eq!(config.cache.max_bytes, 10);
        assert_eq!(config.cache.ttl, DEFAULT_CACHE_TTL);
        assert!(!config.track_documents);
        assert!(config.use_field_hashes);
    }
}
