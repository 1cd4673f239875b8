//! Cache registry: the set of cached models and their LRU order.
//!
//! The registry:
//! - Maps cache keys to records and keeps them in least-recently-used order
//! - Loads models on a miss, evicting unlocked models first when the storage
//!   budget would be exceeded
//! - Memoizes provider metadata per base model path
//! - Counts locks on behalf of guards
//! - Collects [`CacheStats`]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::evictor::Evictor;
use crate::cache::record::{cache_key, CacheRecord, RecordId};
use crate::cache::stats::CacheStats;
use crate::cache::CacheError;
use crate::config::bytes_to_gb;
use crate::provider::{CachedModel, LoadError, LoadOptions, ModelProvider, ModelSource};

/// Result of [`CacheRegistry::get_or_load`].
pub struct Lookup<M: ?Sized> {
    pub key: String,
    pub id: RecordId,
    pub model: Arc<M>,
    pub size: u64,

    /// Whether the model was already cached.
    pub hit: bool,

    /// Number of models evicted to make room for it.
    pub evicted: usize,
}

/// Registry of cached models.
pub struct CacheRegistry<M: CachedModel + ?Sized> {
    /// All records indexed by key.
    entries: HashMap<String, CacheRecord<M>>,

    /// Keys ordered least recently used first.
    lru: VecDeque<String>,

    /// Provider metadata per base path. Never evicted.
    sources: HashMap<String, Arc<dyn ModelSource<M>>>,

    /// Storage budget in bytes.
    max_bytes: u64,

    evictor: Evictor,

    stats: Option<CacheStats>,
}

impl<M: CachedModel + ?Sized> CacheRegistry<M> {
    pub fn new(max_bytes: u64, evictor: Evictor, collect_stats: bool) -> Self {
        Self {
            entries: HashMap::new(),
            lru: VecDeque::new(),
            sources: HashMap::new(),
            max_bytes,
            evictor,
            stats: collect_stats.then(CacheStats::default),
        }
    }

    /// Return the cached model for `path[:submodel]`, loading it on a miss.
    ///
    /// A miss first makes room for the model's expected size, then loads it.
    /// If the load fails nothing is registered, although models evicted to
    /// make room stay evicted.
    pub fn get_or_load(
        &mut self,
        path: &Path,
        submodel: Option<&str>,
        provider: &dyn ModelProvider<M>,
        options: &LoadOptions,
    ) -> Result<Lookup<M>, CacheError> {
        if !path.exists() {
            return Err(CacheError::ModelNotFound(path.to_path_buf()));
        }

        let key = cache_key(path, submodel);

        if let Some(record) = self.entries.get(&key) {
            let id = record.id();
            let size = record.size();
            let model = Arc::clone(record.model());
            if let Some(stats) = self.stats.as_mut() {
                stats.hits += 1;
            }
            self.touch(&key);
            self.record_access(&key, size);
            return Ok(Lookup {
                key,
                id,
                model,
                size,
                hit: true,
                evicted: 0,
            });
        }

        info!(path = %path.display(), submodel, "Loading model");
        if let Some(stats) = self.stats.as_mut() {
            stats.misses += 1;
        }

        let load_err = |source| CacheError::Load {
            key: key.clone(),
            source,
        };

        let source = self.source(path, provider).map_err(load_err)?;
        let evicted = self.make_room(source.size(submodel));
        let loaded = source.load(submodel, options).map_err(load_err)?;
        debug!(
            key = %key,
            ram_gb = bytes_to_gb(loaded.size),
            "RAM used for load"
        );

        let record = CacheRecord::new(key.clone(), loaded.model, loaded.size);
        let id = record.id();
        let model = Arc::clone(record.model());
        self.entries.insert(key.clone(), record);
        self.lru.push_back(key.clone());
        self.record_access(&key, loaded.size);

        Ok(Lookup {
            key,
            id,
            model,
            size: loaded.size,
            hit: false,
            evicted,
        })
    }

    /// Evict least-recently-used models until `bytes_needed` more fit.
    ///
    /// Locked or externally referenced models are skipped. If the budget still
    /// cannot be met the cache goes over budget: this is an eviction target,
    /// not a hard cap. Returns the number of models evicted.
    pub fn make_room(&mut self, bytes_needed: u64) -> usize {
        let maximum = self.max_bytes;
        let current = self.cache_size();
        if current + bytes_needed <= maximum {
            return 0;
        }

        debug!(
            current_gb = bytes_to_gb(current),
            max_gb = bytes_to_gb(maximum),
            needed_gb = bytes_to_gb(bytes_needed),
            cached_models = self.entries.len(),
            "Max cache size exceeded"
        );

        let victims = self.evictor.select_victims(
            self.lru.iter().filter_map(|key| self.entries.get(key)),
            current + bytes_needed - maximum,
        );

        let mut remaining = current;
        for victim in &victims {
            debug!(
                key = %victim.key,
                freed_gb = bytes_to_gb(victim.size),
                "Unloading model"
            );
            // Dropping the record releases the cache's reference to the model.
            self.remove(&victim.key);
            remaining = remaining.saturating_sub(victim.size);
            if let Some(stats) = self.stats.as_mut() {
                stats.cleared += 1;
            }
        }

        if remaining + bytes_needed > maximum {
            warn!(
                cache_gb = bytes_to_gb(remaining + bytes_needed),
                max_gb = bytes_to_gb(maximum),
                "Remaining models are in use; proceeding over the cache budget"
            );
        }

        debug!(cached_models = self.entries.len(), "After unloading");
        victims.len()
    }

    /// Take a lock on the record `id` stored under `key`.
    pub fn lock(&mut self, key: &str, id: RecordId) -> Result<(), CacheError> {
        match self.entries.get_mut(key) {
            Some(record) if record.id() == id => {
                record.lock();
                Ok(())
            }
            _ => Err(CacheError::Untracked(key.to_string())),
        }
    }

    /// Release a lock taken with [`lock`](Self::lock).
    ///
    /// A no-op when the record was untracked in the meantime.
    ///
    /// # Panics
    ///
    /// Panics on an unlock without a matching lock.
    pub fn unlock(&mut self, key: &str, id: RecordId) {
        match self.entries.get_mut(key) {
            Some(record) if record.id() == id => record.unlock(),
            _ => debug!(key, "Unlock of untracked model ignored"),
        }
    }

    /// Forget a model regardless of its locks. Returns whether it was cached.
    pub fn untrack(&mut self, key: &str) -> bool {
        let removed = self.remove(key).is_some();
        if removed {
            debug!(key, "Untracked model");
        }
        removed
    }

    /// Total size of all cached models in bytes.
    pub fn cache_size(&self) -> u64 {
        self.entries.values().map(CacheRecord::size).sum()
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn get(&self, key: &str) -> Option<&CacheRecord<M>> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn lock_count(&self, key: &str) -> Option<usize> {
        self.entries.get(key).map(CacheRecord::locks)
    }

    /// Records in LRU order, least recently used first.
    pub fn records(&self) -> impl Iterator<Item = &CacheRecord<M>> + '_ {
        self.lru.iter().filter_map(|key| self.entries.get(key))
    }

    /// Keys in LRU order, least recently used first.
    pub fn lru_keys(&self) -> Vec<String> {
        self.lru.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> Option<&CacheStats> {
        self.stats.as_ref()
    }

    /// Memoized metadata for the base model at `path`.
    fn source(
        &mut self,
        path: &Path,
        provider: &dyn ModelProvider<M>,
    ) -> Result<Arc<dyn ModelSource<M>>, LoadError> {
        let base = cache_key(path, None);
        if let Some(source) = self.sources.get(&base) {
            return Ok(Arc::clone(source));
        }
        let source = provider.open(path)?;
        self.sources.insert(base, Arc::clone(&source));
        Ok(source)
    }

    /// Move `key` to the most-recently-used end.
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        self.lru.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) -> Option<CacheRecord<M>> {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        self.entries.remove(key)
    }

    fn record_access(&mut self, key: &str, size: u64) {
        let total = self.cache_size();
        let entries = self.entries.len();
        let capacity = self.max_bytes;
        if let Some(stats) = self.stats.as_mut() {
            stats.record_access(key, size, total, entries, capacity);
        }
    }
}
