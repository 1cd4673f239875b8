//! Execution-tier residency.
//!
//! The residency manager keeps the models occupying the execution device
//! within the configured VRAM reserve. It moves models between the storage and
//! execution devices through a [`TierTransfer`] and always asks the model where
//! it currently lives rather than tracking a flag of its own.

use tracing::debug;

use crate::cache::evictor::Evictor;
use crate::cache::record::{CacheRecord, Tier};
use crate::cache::registry::CacheRegistry;
use crate::config::{bytes_to_gb, CacheConfig};
use crate::gpu::device::Device;
use crate::provider::CachedModel;
use crate::transfer::{TierTransfer, TransferError};

pub struct ResidencyManager<T> {
    transfer: T,
    execution_device: Device,
    storage_device: Device,

    /// VRAM idle models may keep occupying, in bytes.
    max_vram_bytes: u64,

    /// Offload when room is needed rather than on every release.
    lazy_offloading: bool,

    evictor: Evictor,
}

impl<T> ResidencyManager<T> {
    pub fn new(config: &CacheConfig, transfer: T) -> Self {
        Self {
            transfer,
            execution_device: config.execution_device.clone(),
            storage_device: config.storage_device.clone(),
            max_vram_bytes: config.max_vram_bytes(),
            lazy_offloading: config.effective_lazy_offloading(),
            evictor: Evictor::new(config.offload_order),
        }
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    pub fn execution_device(&self) -> &Device {
        &self.execution_device
    }

    pub fn storage_device(&self) -> &Device {
        &self.storage_device
    }

    pub fn max_vram_bytes(&self) -> u64 {
        self.max_vram_bytes
    }

    pub fn lazy_offloading(&self) -> bool {
        self.lazy_offloading
    }

    /// Whether the model is anywhere other than the storage device.
    pub fn is_loaded<M: CachedModel + ?Sized>(&self, model: &M) -> bool {
        model.movable() && model.device() != self.storage_device
    }

    /// Whether the model is on the execution device.
    pub fn is_resident<M: CachedModel + ?Sized>(&self, model: &M) -> bool {
        model.device() == self.execution_device
    }

    pub fn tier_of<M: CachedModel + ?Sized>(&self, model: &M) -> Tier {
        if self.is_resident(model) {
            Tier::Execution
        } else {
            Tier::Storage
        }
    }

    /// Move `record`'s model onto the execution device.
    ///
    /// A no-op for models that are already there or cannot move. With lazy
    /// offloading, unlocked residents are offloaded first. The caller is
    /// expected to hold a lock on `record` so it is not offloaded itself.
    pub fn promote<M>(
        &self,
        registry: &CacheRegistry<M>,
        record: &CacheRecord<M>,
    ) -> Result<(), TransferError>
    where
        M: CachedModel + ?Sized,
        T: TierTransfer<M>,
    {
        let model: &M = record.model();
        if !model.movable() || self.is_resident(model) {
            return Ok(());
        }

        if self.lazy_offloading {
            self.offload_unlocked(registry, record.size())?;
        }

        debug!(
            key = record.key(),
            device = %self.execution_device,
            "Moving model into execution device"
        );
        let before = self.transfer.memory_allocated();
        self.transfer.move_to(model, &self.execution_device)?;
        let used = self.transfer.memory_allocated().saturating_sub(before);
        debug!(
            key = record.key(),
            vram_gb = bytes_to_gb(used),
            "GPU VRAM used for load"
        );
        Ok(())
    }

    /// Offload unlocked models from the execution device until VRAM usage is
    /// back within the reserve. Returns the bytes freed.
    ///
    /// `size_needed` is the size of the model about to be promoted; it is only
    /// reported, the target is the reserve itself. The first transfer error
    /// stops the pass.
    pub fn offload_unlocked<M>(
        &self,
        registry: &CacheRegistry<M>,
        size_needed: u64,
    ) -> Result<u64, TransferError>
    where
        M: CachedModel + ?Sized,
        T: TierTransfer<M>,
    {
        let reserved = self.max_vram_bytes;
        let mut in_use = self.transfer.memory_allocated();
        debug!(
            vram_gb = bytes_to_gb(in_use),
            max_gb = bytes_to_gb(reserved),
            needed_gb = bytes_to_gb(size_needed),
            "VRAM used for models"
        );

        let mut freed = 0;
        let mut outcome = Ok(());
        for record in self.evictor.offload_candidates(registry.records()) {
            if in_use <= reserved {
                break;
            }
            let model: &M = record.model();
            if !self.is_loaded(model) {
                continue;
            }

            debug!(
                key = record.key(),
                from = %model.device(),
                to = %self.storage_device,
                "Offloading model"
            );
            let before = self.transfer.memory_allocated();
            if let Err(e) = self.transfer.move_to(model, &self.storage_device) {
                outcome = Err(e);
                break;
            }
            let released = before.saturating_sub(self.transfer.memory_allocated());
            in_use = in_use.saturating_sub(released);
            freed += released;
            debug!(
                freed_gb = bytes_to_gb(released),
                vram_gb = bytes_to_gb(in_use),
                "GPU VRAM freed"
            );
        }

        self.transfer.empty_cache();
        outcome.map(|()| freed)
    }

    /// Move an idle model back to the storage device. Returns whether it moved.
    ///
    /// Serves callers that do not need the execution device: if nobody holds
    /// the model there, its VRAM is handed back. Never touches locks.
    pub fn demote_if_idle<M>(&self, record: &CacheRecord<M>) -> Result<bool, TransferError>
    where
        M: CachedModel + ?Sized,
        T: TierTransfer<M>,
    {
        let model: &M = record.model();
        if record.locked() || !self.is_loaded(model) {
            return Ok(false);
        }

        debug!(
            key = record.key(),
            device = %self.storage_device,
            "Moving idle model to storage device"
        );
        let moved = self.transfer.move_to(model, &self.storage_device);
        self.transfer.empty_cache();
        moved.map(|()| true)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::{OffloadOrder, GIG};
    use crate::provider::fixed::FixedSizeProvider;
    use crate::provider::LoadOptions;
    use crate::transfer::simulated::{SimulatedModel, SimulatedTransfer};

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: CacheRegistry<SimulatedModel>,
        residency: ResidencyManager<SimulatedTransfer>,
        provider: FixedSizeProvider,
    }

    impl Fixture {
        fn new(config: CacheConfig) -> Self {
            Self {
                _dir: tempfile::tempdir().unwrap(),
                registry: CacheRegistry::new(config.max_cache_bytes(), Evictor::default(), false),
                residency: ResidencyManager::new(&config, SimulatedTransfer::new(Device::cuda())),
                provider: FixedSizeProvider::new(GIG),
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            let path = self._dir.path().join(name);
            std::fs::create_dir_all(&path).unwrap();
            path
        }

        /// Load `name` and return its key.
        fn load(&mut self, name: &str, size: u64) -> String {
            let path = self.path(name);
            let provider = self
                .provider
                .clone()
                .with_size(crate::cache::record::cache_key(&path, None), size);
            let options = LoadOptions {
                precision: Default::default(),
                sequential_offload: false,
                device: Device::cpu(),
            };
            self.registry
                .get_or_load(&path, None, &provider, &options)
                .unwrap()
                .key
        }

        fn promote(&self, key: &str) -> Result<(), TransferError> {
            let record = self.registry.get(key).unwrap();
            self.residency.promote(&self.registry, record)
        }

        fn device_of(&self, key: &str) -> Device {
            self.registry.get(key).unwrap().model().device()
        }
    }

    fn config(vram_gb: f64, lazy: bool) -> CacheConfig {
        CacheConfig {
            max_cache_size: 100.0,
            max_vram_cache_size: vram_gb,
            lazy_offloading: lazy,
            ..Default::default()
        }
    }

    #[test]
    fn test_promote_moves_model() {
        let mut fx = Fixture::new(config(4.0, true));
        let a = fx.load("a", GIG);

        fx.promote(&a).unwrap();
        assert_eq!(fx.device_of(&a), Device::cuda());
        assert_eq!(fx.residency.transfer().memory_allocated(), GIG);
    }

    #[test]
    fn test_promote_is_idempotent() {
        let mut fx = Fixture::new(config(4.0, true));
        let a = fx.load("a", GIG);

        fx.promote(&a).unwrap();
        fx.promote(&a).unwrap();
        assert_eq!(fx.residency.transfer().stats().total_h2d_transfers, 1);
    }

    #[test]
    fn test_lazy_promote_offloads_unlocked_first() {
        let mut fx = Fixture::new(config(2.0, true));
        let small = fx.load("small", GIG);
        let big = fx.load("big", 2 * GIG);
        let next = fx.load("next", GIG);

        fx.promote(&small).unwrap();
        fx.promote(&big).unwrap();
        assert_eq!(fx.residency.transfer().memory_allocated(), 3 * GIG);

        // Over the 2 GB reserve: the smallest unlocked resident goes first,
        // which is enough to get back within the reserve.
        fx.promote(&next).unwrap();
        assert_eq!(fx.device_of(&small), Device::cpu());
        assert_eq!(fx.device_of(&big), Device::cuda());
        assert_eq!(fx.device_of(&next), Device::cuda());
    }

    #[test]
    fn test_offload_skips_locked() {
        let mut fx = Fixture::new(config(0.5, true));
        let a = fx.load("a", GIG);
        fx.promote(&a).unwrap();

        let id = fx.registry.get(&a).unwrap().id();
        fx.registry.lock(&a, id).unwrap();
        let freed = fx.residency.offload_unlocked(&fx.registry, 0).unwrap();
        assert_eq!(freed, 0);
        assert_eq!(fx.device_of(&a), Device::cuda());

        fx.registry.unlock(&a, id);
        let freed = fx.residency.offload_unlocked(&fx.registry, 0).unwrap();
        assert_eq!(freed, GIG);
        assert_eq!(fx.device_of(&a), Device::cpu());
    }

    #[test]
    fn test_offload_largest_first() {
        let mut cfg = config(2.5, false);
        cfg.offload_order = OffloadOrder::LargestFirst;
        let mut fx = Fixture::new(cfg);
        let small = fx.load("small", GIG);
        let big = fx.load("big", 2 * GIG);
        fx.promote(&small).unwrap();
        fx.promote(&big).unwrap();

        fx.residency.offload_unlocked(&fx.registry, 0).unwrap();
        assert_eq!(fx.device_of(&big), Device::cpu());
        assert_eq!(fx.device_of(&small), Device::cuda());
    }

    #[test]
    fn test_offload_stops_on_transfer_error() {
        let mut fx = Fixture::new(config(0.0, false));
        let a = fx.load("a", GIG);
        fx.promote(&a).unwrap();

        fx.residency.transfer().fail_transfers(true);
        assert!(fx.residency.offload_unlocked(&fx.registry, 0).is_err());
        assert_eq!(fx.residency.transfer().stats().empty_cache_calls, 1);
    }

    #[test]
    fn test_demote_if_idle() {
        let mut fx = Fixture::new(config(4.0, true));
        let a = fx.load("a", GIG);
        fx.promote(&a).unwrap();

        let id = fx.registry.get(&a).unwrap().id();
        fx.registry.lock(&a, id).unwrap();
        assert!(!fx.residency.demote_if_idle(fx.registry.get(&a).unwrap()).unwrap());
        assert_eq!(fx.device_of(&a), Device::cuda());

        fx.registry.unlock(&a, id);
        assert!(fx.residency.demote_if_idle(fx.registry.get(&a).unwrap()).unwrap());
        assert_eq!(fx.device_of(&a), Device::cpu());
        assert_eq!(fx.registry.lock_count(&a), Some(0));
    }

    #[test]
    fn test_tier_of() {
        let mut fx = Fixture::new(config(4.0, true));
        let a = fx.load("a", GIG);
        let model = fx.registry.get(&a).unwrap().model().clone();
        assert_eq!(fx.residency.tier_of(model.as_ref()), Tier::Storage);
        fx.promote(&a).unwrap();
        assert_eq!(fx.residency.tier_of(model.as_ref()), Tier::Execution);
    }
}
