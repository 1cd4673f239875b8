//! Fixed-size provider.
//!
//! Produces [`SimulatedModel`]s whose sizes come from a table keyed by cache
//! key, falling back to a default. Counts opens and loads per key and can be
//! told to fail, which makes it the provider of choice for tests and benches.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::cache::record::cache_key;
use crate::provider::{LoadError, LoadOptions, LoadedModel, ModelProvider, ModelSource};
use crate::transfer::simulated::SimulatedModel;

#[derive(Default)]
struct Shared {
    default_size: u64,
    sizes: Mutex<HashMap<String, u64>>,
    immovable: Mutex<HashSet<String>>,
    extra_refs: AtomicUsize,
    fail_loads: AtomicBool,
    opens: AtomicUsize,
    loads: Mutex<HashMap<String, usize>>,
}

impl Shared {
    fn size_of(&self, key: &str) -> u64 {
        self.sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(self.default_size)
    }
}

/// Provider of fixed-size simulated models.
#[derive(Clone)]
pub struct FixedSizeProvider {
    shared: Arc<Shared>,
}

impl FixedSizeProvider {
    /// Every model is `default_size` bytes unless overridden with [`with_size`](Self::with_size).
    pub fn new(default_size: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                default_size,
                ..Default::default()
            }),
        }
    }

    /// Override the size of one cache key (`path[:submodel]`).
    pub fn with_size(self, key: impl Into<String>, size: u64) -> Self {
        self.shared
            .sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), size);
        self
    }

    /// Load the given cache key as a model without device placement.
    pub fn with_immovable(self, key: impl Into<String>) -> Self {
        self.shared
            .immovable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into());
        self
    }

    /// Every loaded model declares `extra_refs` runtime-held references.
    pub fn with_extra_refs(self, extra_refs: usize) -> Self {
        self.shared.extra_refs.store(extra_refs, Ordering::SeqCst);
        self
    }

    pub fn fail_loads(&self, fail: bool) {
        self.shared.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Number of times a base path was opened (metadata built).
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Number of successful loads of a cache key.
    pub fn load_count(&self, key: &str) -> usize {
        self.shared
            .loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_loads(&self) -> usize {
        self.shared
            .loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }
}

struct FixedSizeSource {
    path: PathBuf,
    shared: Arc<Shared>,
}

impl ModelSource<SimulatedModel> for FixedSizeSource {
    fn size(&self, submodel: Option<&str>) -> u64 {
        self.shared.size_of(&cache_key(&self.path, submodel))
    }

    fn load(
        &self,
        submodel: Option<&str>,
        options: &LoadOptions,
    ) -> Result<LoadedModel<SimulatedModel>, LoadError> {
        let key = cache_key(&self.path, submodel);
        if self.shared.fail_loads.load(Ordering::SeqCst) {
            return Err(LoadError::Failed(format!("could not materialize {key}")));
        }

        let size = self.shared.size_of(&key);
        let mut model = SimulatedModel::new(key.clone(), size, options.device.clone())
            .with_extra_refs(self.shared.extra_refs.load(Ordering::SeqCst));
        if self
            .shared
            .immovable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
        {
            model = model.immovable();
        }

        *self
            .shared
            .loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert(0) += 1;

        Ok(LoadedModel {
            model: Arc::new(model),
            size,
        })
    }
}

impl ModelProvider<SimulatedModel> for FixedSizeProvider {
    fn open(&self, path: &Path) -> Result<Arc<dyn ModelSource<SimulatedModel>>, LoadError> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FixedSizeSource {
            path: path.to_path_buf(),
            shared: Arc::clone(&self.shared),
        }))
    }
}
