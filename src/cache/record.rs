//! Cache record types.
//!
//! A record is the registry's handle on one cached (sub-)model: the owning
//! reference to the model object, its storage-tier size, and the number of
//! guards currently holding it in use.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::provider::CachedModel;

/// Residency tier of a cached model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Scarce memory models are moved into while in use (VRAM).
    Execution,
    /// Bulk memory idle models are kept in (RAM).
    Storage,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Execution => write!(f, "VRAM"),
            Tier::Storage => write!(f, "RAM"),
        }
    }
}

/// Unique identifier for a cache record.
pub type RecordId = u64;

/// Global monotonic record ID counter.
static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(0);

/// Allocate a new unique record ID.
pub fn new_record_id() -> RecordId {
    NEXT_RECORD_ID.fetch_add(1, Ordering::Relaxed)
}

/// Cache key for a model path and optional sub-model.
///
/// The path is rendered with `/` separators so keys are stable across
/// platforms; the sub-model is appended after a colon.
pub fn cache_key(path: &Path, submodel: Option<&str>) -> String {
    let mut key = path.to_string_lossy().replace('\\', "/");
    if let Some(sub) = submodel {
        key.push(':');
        key.push_str(sub);
    }
    key
}

/// A single cached model.
pub struct CacheRecord<M: CachedModel + ?Sized> {
    id: RecordId,
    key: String,
    size: u64,
    model: Arc<M>,
    locks: usize,
}

impl<M: CachedModel + ?Sized> CacheRecord<M> {
    pub fn new(key: impl Into<String>, model: Arc<M>, size: u64) -> Self {
        Self {
            id: new_record_id(),
            key: key.into(),
            size,
            model,
            locks: 0,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Storage-tier size in bytes, as reported at load.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    pub fn locks(&self) -> usize {
        self.locks
    }

    pub fn locked(&self) -> bool {
        self.locks > 0
    }

    pub fn lock(&mut self) {
        self.locks += 1;
    }

    /// Drop one lock.
    ///
    /// # Panics
    ///
    /// Panics if the record is not locked: an unlock without a matching lock
    /// is a caller bug, never a recoverable condition.
    pub fn unlock(&mut self) {
        match self.locks.checked_sub(1) {
            Some(locks) => self.locks = locks,
            None => panic!("lock underflow on cache record {}", self.key),
        }
    }

    /// Strong references to the model beyond the record's own and the ones
    /// the model's runtime declares for itself.
    pub fn outside_refs(&self) -> usize {
        Arc::strong_count(&self.model).saturating_sub(1 + self.model.extra_refs())
    }

    /// Unlocked and referenced by nobody but the cache.
    pub fn evictable(&self) -> bool {
        !self.locked() && self.outside_refs() == 0
    }
}

impl<M: CachedModel + ?Sized> std::fmt::Debug for CacheRecord<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRecord")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("size", &self.size)
            .field("device", &self.model.device())
            .field("locks", &self.locks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::Device;
    use crate::transfer::simulated::SimulatedModel;

    fn record(size: u64) -> CacheRecord<SimulatedModel> {
        CacheRecord::new("m", Arc::new(SimulatedModel::new("m", size, Device::cpu())), size)
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key(Path::new("/models/sd-1.5"), None), "/models/sd-1.5");
        assert_eq!(
            cache_key(Path::new("/models/sd-1.5"), Some("unet")),
            "/models/sd-1.5:unet"
        );
    }

    #[test]
    fn test_record_ids_are_unique() {
        let a = record(1);
        let b = record(1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_lock_pairing() {
        let mut rec = record(10);
        rec.lock();
        rec.lock();
        assert_eq!(rec.locks(), 2);
        rec.unlock();
        rec.unlock();
        assert_eq!(rec.locks(), 0);
        assert!(!rec.locked());
    }

    #[test]
    #[should_panic(expected = "lock underflow")]
    fn test_unlock_underflow_panics() {
        let mut rec = record(10);
        rec.unlock();
    }

    #[test]
    fn test_outside_reference_blocks_eviction() {
        let rec = record(10);
        assert!(rec.evictable());

        let held = Arc::clone(rec.model());
        assert!(!rec.evictable());
        drop(held);
        assert!(rec.evictable());
    }

    #[test]
    fn test_runtime_refs_are_discounted() {
        let model = Arc::new(SimulatedModel::new("onnx", 10, Device::cpu()).with_extra_refs(1));
        let runtime_ref = Arc::clone(&model);
        let rec = CacheRecord::new("onnx", model, 10);
        assert!(rec.evictable());
        drop(runtime_ref);
    }
}
