//! Cache statistics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Counters collected by the registry. Reset only when the cache is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Requests served from the cache.
    pub hits: u64,

    /// Requests that had to load.
    pub misses: u64,

    /// Largest total size the cache has held, in bytes.
    pub high_watermark: u64,

    /// Number of models currently cached.
    pub in_cache: usize,

    /// Number of models evicted to make room.
    pub cleared: u64,

    /// Configured storage budget in bytes.
    pub cache_size: u64,

    /// Largest size seen per cache key.
    pub loaded_model_sizes: BTreeMap<String, u64>,
}

impl CacheStats {
    /// Hit rate as a fraction in `[0.0, 1.0]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Refresh the gauges after an access to `key`.
    pub(crate) fn record_access(
        &mut self,
        key: &str,
        size: u64,
        total_bytes: u64,
        entries: usize,
        capacity: u64,
    ) {
        self.cache_size = capacity;
        self.high_watermark = self.high_watermark.max(total_bytes);
        self.in_cache = entries;
        let seen = self.loaded_model_sizes.entry(key.to_string()).or_insert(0);
        *seen = (*seen).max(size);
    }
}
