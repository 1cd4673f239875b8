//! model-cache-tier: Tiered model cache for inference pipelines.
//!
//! Keeps large models resident in host RAM and moves them into GPU VRAM only
//! while they are in use, under two independent byte budgets:
//!   GPU VRAM (execution tier) ← promote / offload → Host RAM (storage tier)
//!
//! Models enter the storage tier on demand and leave it in LRU order. Callers
//! take a scoped guard on a model; a guarded model is never evicted or
//! offloaded.

pub mod cache;
pub mod config;
pub mod gpu;
pub mod provider;
pub mod transfer;

pub use cache::locker::{ModelGuard, ModelLocker};
pub use cache::stats::CacheStats;
pub use cache::{CacheError, EntryInfo, ModelCache};
pub use config::{CacheConfig, Config, OffloadOrder};
pub use gpu::device::Device;
pub use provider::{CachedModel, ModelProvider, ModelSource};
pub use transfer::TierTransfer;
