//! Model providers: the collaborators that build and load cached models.
//!
//! - [`file`]: sizes models from files and directories on disk
//! - [`fixed`]: fixed-size models with load counting, for tests and benches
//!
//! A provider is asked once per base path for a [`ModelSource`] (the memoized
//! metadata). The source reports the size of each sub-model and materializes it.

pub mod file;
pub mod fixed;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gpu::device::Device;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sub-model {submodel} not present in {}", path.display())]
    UnknownSubmodel { path: PathBuf, submodel: String },

    #[error("Model load failed: {0}")]
    Failed(String),
}

/// Numeric precision requested for loaded weights. Passed through to the
/// provider; the cache never interprets it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Float16,
    BFloat16,
    Float32,
}

/// Per-load options handed to [`ModelSource::load`].
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub precision: Precision,

    /// Load and unload each stage of a pipeline sequentially.
    pub sequential_offload: bool,

    /// Device the freshly loaded model should be placed on (the storage device).
    pub device: Device,
}

/// A model object held by the cache.
///
/// Residency is always asked of the model itself, since code outside the cache
/// can move it.
pub trait CachedModel: Send + Sync + 'static {
    /// Device the model's weights currently live on.
    fn device(&self) -> Device;

    /// Whether the model can be moved between devices at all. Models that
    /// cannot are handed out without locking or transfers.
    fn movable(&self) -> bool {
        true
    }

    /// Strong references the model's own runtime keeps to it. The cache only
    /// evicts a model when nobody else holds it, so these are discounted.
    fn extra_refs(&self) -> usize {
        0
    }
}

/// A materialized model and the bytes it occupies in the storage tier.
pub struct LoadedModel<M: ?Sized> {
    pub model: Arc<M>,
    pub size: u64,
}

/// Metadata for one base model path, shared by all of its sub-models.
pub trait ModelSource<M: ?Sized>: Send + Sync {
    /// Expected storage-tier size of the (sub-)model in bytes.
    fn size(&self, submodel: Option<&str>) -> u64;

    /// Materialize the (sub-)model.
    fn load(&self, submodel: Option<&str>, options: &LoadOptions)
        -> Result<LoadedModel<M>, LoadError>;
}

/// Factory for [`ModelSource`]s, one per model kind.
pub trait ModelProvider<M: ?Sized>: Send + Sync {
    fn open(&self, path: &Path) -> Result<Arc<dyn ModelSource<M>>, LoadError>;
}
