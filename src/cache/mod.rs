//! Tiered model cache.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`record`]: CacheRecord, Tier, cache keys
//! - [`registry`]: LRU registry of cached models and the storage budget
//! - [`evictor`]: Victim selection for eviction and offload
//! - [`residency`]: Execution-tier placement under the VRAM reserve
//! - [`locker`]: Scoped model access (ModelLocker / ModelGuard)
//! - [`stats`]: Hit/miss statistics
//!
//! [`ModelCache`] ties them together behind one lock per cache instance.

pub mod evictor;
pub mod locker;
pub mod record;
pub mod registry;
pub mod residency;
pub mod stats;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::cache::evictor::Evictor;
use crate::cache::locker::ModelLocker;
use crate::cache::record::Tier;
use crate::cache::registry::CacheRegistry;
use crate::cache::residency::ResidencyManager;
use crate::cache::stats::CacheStats;
use crate::config::{bytes_to_gb, CacheConfig};
use crate::gpu::device::Device;
use crate::provider::{CachedModel, LoadError, LoadOptions, ModelProvider};
use crate::transfer::{TierTransfer, TransferError};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Model not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("Failed to load {key}: {source}")]
    Load {
        key: String,
        #[source]
        source: LoadError,
    },

    #[error("Failed to move {key}: {source}")]
    Transfer {
        key: String,
        #[source]
        source: TransferError,
    },

    #[error("Model {0} is no longer cached")]
    Untracked(String),
}

/// Point-in-time view of one cached model.
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub key: String,
    pub size: u64,
    pub locks: usize,
    pub device: Device,
    pub tier: Tier,

    /// Off the storage device (resident or elsewhere).
    pub loaded: bool,
}

/// Two-tier model cache.
///
/// Models are loaded into the storage tier on demand and kept under
/// `max_cache_size`; models in use are promoted into the execution tier, where
/// idle ones may linger up to `max_vram_cache_size`. All bookkeeping is
/// serialized through one lock, so concurrent requests for the same model load
/// it once.
pub struct ModelCache<M: CachedModel + ?Sized, T> {
    registry: Mutex<CacheRegistry<M>>,
    residency: ResidencyManager<T>,
    config: CacheConfig,
}

impl<M, T> ModelCache<M, T>
where
    M: CachedModel + ?Sized,
    T: TierTransfer<M>,
{
    pub fn new(config: CacheConfig, transfer: T) -> Self {
        let registry = CacheRegistry::new(
            config.max_cache_bytes(),
            Evictor::new(config.offload_order),
            config.collect_stats,
        );
        let residency = ResidencyManager::new(&config, transfer);
        debug!(
            max_cache_gb = config.max_cache_size,
            max_vram_gb = config.max_vram_cache_size,
            execution_device = %config.execution_device,
            storage_device = %config.storage_device,
            lazy_offloading = residency.lazy_offloading(),
            "Model cache created"
        );
        Self {
            registry: Mutex::new(registry),
            residency,
            config,
        }
    }

    /// Look up `path[:submodel]`, loading it into the storage tier on a miss.
    ///
    /// Nothing moves to the execution device until the returned locker is
    /// acquired. `gpu_load` chooses whether acquiring promotes the model.
    pub fn get(
        &self,
        path: impl AsRef<Path>,
        provider: &dyn ModelProvider<M>,
        submodel: Option<&str>,
        gpu_load: bool,
    ) -> Result<ModelLocker<'_, M, T>, CacheError> {
        let options = LoadOptions {
            precision: self.config.precision,
            sequential_offload: self.config.sequential_offload,
            device: self.config.storage_device.clone(),
        };

        let lookup = {
            let mut registry = self.registry();
            let lookup = registry.get_or_load(path.as_ref(), submodel, provider, &options)?;
            if lookup.evicted > 0 {
                // Hand VRAM held by evicted models back to the runtime.
                self.residency.transfer().empty_cache();
            }
            lookup
        };

        Ok(ModelLocker::new(self, lookup, gpu_load))
    }

    /// Forget a model regardless of its locks. Returns whether it was cached.
    ///
    /// `key` is the model's [`cache_key`](record::cache_key).
    pub fn untrack(&self, key: &str) -> bool {
        self.registry().untrack(key)
    }

    /// Total storage-tier bytes held.
    pub fn cache_size(&self) -> u64 {
        self.registry().cache_size()
    }

    pub fn cache_size_gb(&self) -> f64 {
        bytes_to_gb(self.cache_size())
    }

    /// Copy of the statistics, if collected.
    pub fn stats(&self) -> Option<CacheStats> {
        self.registry().stats().cloned()
    }

    /// Every cached model in LRU order, least recently used first.
    pub fn snapshot(&self) -> Vec<EntryInfo> {
        let registry = self.registry();
        registry
            .records()
            .map(|record| {
                let model: &M = record.model();
                EntryInfo {
                    key: record.key().to_string(),
                    size: record.size(),
                    locks: record.locks(),
                    device: model.device(),
                    tier: self.residency.tier_of(model),
                    loaded: self.residency.is_loaded(model),
                }
            })
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.registry().contains(key)
    }

    pub fn lock_count(&self, key: &str) -> Option<usize> {
        self.registry().lock_count(key)
    }

    pub fn lru_keys(&self) -> Vec<String> {
        self.registry().lru_keys()
    }

    pub fn transfer(&self) -> &T {
        self.residency.transfer()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// A panic in another thread never leaves the registry half-updated: every
    /// mutation is a single insert or remove, so the poisoned state is usable.
    pub(crate) fn registry(&self) -> MutexGuard<'_, CacheRegistry<M>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn residency(&self) -> &ResidencyManager<T> {
        &self.residency
    }

    pub(crate) fn log_memory_stats(&self, registry: &CacheRegistry<M>) {
        let mut loaded = 0;
        let mut locked = 0;
        for record in registry.records() {
            if self.residency.is_loaded::<M>(record.model()) {
                loaded += 1;
            }
            if record.locked() {
                locked += 1;
            }
        }
        debug!(
            vram_gb = bytes_to_gb(self.residency.transfer().memory_allocated()),
            ram_gb = bytes_to_gb(registry.cache_size()),
            cached_models = registry.len(),
            loaded_models = loaded,
            locked_models = locked,
            "Current VRAM/RAM usage"
        );
    }
}
