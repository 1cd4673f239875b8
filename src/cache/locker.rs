//! Scoped model access.
//!
//! [`ModelCache::get`] returns a [`ModelLocker`]; acquiring it yields a
//! [`ModelGuard`] that dereferences to the model. A guard acquired for the
//! execution device holds a lock that keeps the model from being evicted or
//! offloaded, and gives it back when the guard is dropped, on every exit path.
//!
//! ```no_run
//! # use model_cache_tier::cache::ModelCache;
//! # use model_cache_tier::config::CacheConfig;
//! # use model_cache_tier::gpu::device::Device;
//! # use model_cache_tier::provider::file::FileModelProvider;
//! # use model_cache_tier::transfer::simulated::{SimulatedModel, SimulatedTransfer};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache: ModelCache<SimulatedModel, _> =
//!     ModelCache::new(CacheConfig::default(), SimulatedTransfer::new(Device::cuda()));
//! let provider = FileModelProvider::new();
//! {
//!     let unet = cache.get("models/sd-1.5", &provider, Some("unet"), true)?.acquire()?;
//!     let vae = cache.get("models/sd-1.5", &provider, Some("vae"), true)?.acquire()?;
//!     println!("{} + {} bytes on the GPU", unet.size(), vae.size());
//! }
//! # Ok(())
//! # }
//! ```

use std::ops::Deref;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::record::RecordId;
use crate::cache::registry::Lookup;
use crate::cache::{CacheError, ModelCache};
use crate::provider::CachedModel;
use crate::transfer::TierTransfer;

/// A cached model that has not been acquired yet.
pub struct ModelLocker<'a, M, T>
where
    M: CachedModel + ?Sized,
    T: TierTransfer<M>,
{
    cache: &'a ModelCache<M, T>,
    key: String,
    id: RecordId,
    model: Arc<M>,
    size: u64,
    gpu_load: bool,
}

impl<'a, M, T> ModelLocker<'a, M, T>
where
    M: CachedModel + ?Sized,
    T: TierTransfer<M>,
{
    pub(crate) fn new(cache: &'a ModelCache<M, T>, lookup: Lookup<M>, gpu_load: bool) -> Self {
        Self {
            cache,
            key: lookup.key,
            id: lookup.id,
            model: lookup.model,
            size: lookup.size,
            gpu_load,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether acquiring moves the model onto the execution device.
    pub fn gpu_load(&self) -> bool {
        self.gpu_load
    }

    /// Acquire the model.
    ///
    /// For the execution device, the model is locked and then promoted; if the
    /// promotion fails the lock is released before the error is returned.
    /// Otherwise no lock is taken and the model is moved back to the storage
    /// device if nobody is using it there, on a best-effort basis.
    pub fn acquire(self) -> Result<ModelGuard<'a, M, T>, CacheError> {
        if !self.model.movable() {
            return Ok(self.into_guard(false));
        }

        let cache = self.cache;
        let residency = cache.residency();
        let mut registry = cache.registry();

        if !self.gpu_load {
            if let Some(record) = registry.get(&self.key).filter(|r| r.id() == self.id) {
                if let Err(e) = residency.demote_if_idle(record) {
                    warn!(key = %self.key, error = %e, "Could not move idle model to storage");
                }
            }
            drop(registry);
            return Ok(self.into_guard(false));
        }

        registry.lock(&self.key, self.id)?;
        let promoted = match registry.get(&self.key) {
            Some(record) => residency.promote(&*registry, record),
            None => Ok(()),
        };
        if let Err(source) = promoted {
            registry.unlock(&self.key, self.id);
            return Err(CacheError::Transfer {
                key: self.key.clone(),
                source,
            });
        }

        debug!(
            key = %self.key,
            device = %residency.execution_device(),
            "Locking model in execution device"
        );
        cache.log_memory_stats(&registry);
        drop(registry);
        Ok(self.into_guard(true))
    }

    fn into_guard(self, locked: bool) -> ModelGuard<'a, M, T> {
        ModelGuard {
            cache: self.cache,
            key: self.key,
            id: self.id,
            model: self.model,
            size: self.size,
            locked,
        }
    }
}

/// An acquired model. Releases its lock when dropped.
pub struct ModelGuard<'a, M, T>
where
    M: CachedModel + ?Sized,
    T: TierTransfer<M>,
{
    cache: &'a ModelCache<M, T>,
    key: String,
    id: RecordId,
    model: Arc<M>,
    size: u64,
    locked: bool,
}

impl<M, T> ModelGuard<'_, M, T>
where
    M: CachedModel + ?Sized,
    T: TierTransfer<M>,
{
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    /// Whether this guard holds a lock on the model.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Release the model now rather than at the end of the scope.
    pub fn release(self) {}

    fn release_lock(&mut self) {
        if !self.locked {
            return;
        }
        self.locked = false;

        let cache = self.cache;
        let residency = cache.residency();
        let mut registry = cache.registry();
        registry.unlock(&self.key, self.id);

        if !residency.lazy_offloading() {
            if let Err(e) = residency.offload_unlocked(&*registry, 0) {
                warn!(key = %self.key, error = %e, "Offload after release failed");
            }
            cache.log_memory_stats(&registry);
        }
    }
}

impl<M, T> Deref for ModelGuard<'_, M, T>
where
    M: CachedModel + ?Sized,
    T: TierTransfer<M>,
{
    type Target = M;

    fn deref(&self) -> &M {
        &self.model
    }
}

impl<M, T> Drop for ModelGuard<'_, M, T>
where
    M: CachedModel + ?Sized,
    T: TierTransfer<M>,
{
    fn drop(&mut self) {
        self.release_lock();
    }
}
