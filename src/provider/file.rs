//! On-disk model provider.
//!
//! Sizes a model from its files: a single-file checkpoint is its file length,
//! a pipeline directory is the total of everything under it, and a sub-model is
//! the total of its sub-directory. The loaded object is a [`SimulatedModel`]
//! placed on the storage device, so the cache can plan residency for real model
//! layouts without reading any weights.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::provider::{LoadError, LoadOptions, LoadedModel, ModelProvider, ModelSource};
use crate::transfer::simulated::SimulatedModel;

/// Total bytes of a file, or of every file below a directory.
pub fn disk_usage(path: &Path) -> std::io::Result<u64> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }

    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        total += disk_usage(&entry?.path())?;
    }
    Ok(total)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileModelProvider;

impl FileModelProvider {
    pub fn new() -> Self {
        Self
    }
}

struct FileModelSource {
    path: PathBuf,
}

impl FileModelSource {
    fn target(&self, submodel: Option<&str>) -> PathBuf {
        match submodel {
            Some(sub) => self.path.join(sub),
            None => self.path.clone(),
        }
    }
}

impl ModelSource<SimulatedModel> for FileModelSource {
    fn size(&self, submodel: Option<&str>) -> u64 {
        let target = self.target(submodel);
        match disk_usage(&target) {
            Ok(size) => size,
            Err(e) => {
                warn!(path = %target.display(), error = %e, "Could not size model");
                0
            }
        }
    }

    fn load(
        &self,
        submodel: Option<&str>,
        options: &LoadOptions,
    ) -> Result<LoadedModel<SimulatedModel>, LoadError> {
        let target = self.target(submodel);
        if let Some(sub) = submodel {
            if !target.exists() {
                return Err(LoadError::UnknownSubmodel {
                    path: self.path.clone(),
                    submodel: sub.to_string(),
                });
            }
        }

        let size = disk_usage(&target)?;
        info!(
            path = %target.display(),
            size,
            precision = ?options.precision,
            device = %options.device,
            "Loaded model from disk"
        );

        Ok(LoadedModel {
            model: Arc::new(SimulatedModel::new(
                target.display().to_string(),
                size,
                options.device.clone(),
            )),
            size,
        })
    }
}

impl ModelProvider<SimulatedModel> for FileModelProvider {
    fn open(&self, path: &Path) -> Result<Arc<dyn ModelSource<SimulatedModel>>, LoadError> {
        // Surfaces permission problems before any budget is spent.
        std::fs::metadata(path)?;
        Ok(Arc::new(FileModelSource {
            path: path.to_path_buf(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::Device;
    use crate::provider::Precision;

    fn options() -> LoadOptions {
        LoadOptions {
            precision: Precision::Float16,
            sequential_offload: false,
            device: Device::cpu(),
        }
    }

    #[test]
    fn test_single_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("model.safetensors");
        std::fs::write(&file, vec![0u8; 1234]).unwrap();

        let source = FileModelProvider::new().open(&file).unwrap();
        assert_eq!(source.size(None), 1234);
        assert_eq!(source.load(None, &options()).unwrap().size, 1234);
    }

    #[test]
    fn test_pipeline_directory_submodels() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("unet")).unwrap();
        std::fs::create_dir_all(dir.path().join("vae")).unwrap();
        std::fs::write(dir.path().join("unet/weights.bin"), vec![0u8; 300]).unwrap();
        std::fs::write(dir.path().join("vae/weights.bin"), vec![0u8; 50]).unwrap();
        std::fs::write(dir.path().join("model_index.json"), b"{}").unwrap();

        let source = FileModelProvider::new().open(dir.path()).unwrap();
        assert_eq!(source.size(Some("unet")), 300);
        assert_eq!(source.size(Some("vae")), 50);
        assert_eq!(source.size(None), 352);

        let err = source.load(Some("scheduler"), &options()).err().unwrap();
        assert!(matches!(err, LoadError::UnknownSubmodel { .. }));
    }

    #[test]
    fn test_open_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileModelProvider::new().open(&dir.path().join("missing"));
        assert!(matches!(result, Err(LoadError::Io(_))));
    }
}
