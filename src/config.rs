//! Runtime configuration for model-cache-tier.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Budgets are expressed in GB (floating point) and converted to bytes with [`GIG`].

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::gpu::device::Device;
use crate::provider::Precision;

/// Bytes in one GB as the budgets count them.
pub const GIG: u64 = 1_073_741_824;

/// Default storage budget: roughly three fp16 diffusion pipelines.
pub const DEFAULT_MAX_CACHE_SIZE: f64 = 6.0;

/// Default VRAM kept for idle models between generations.
pub const DEFAULT_MAX_VRAM_CACHE_SIZE: f64 = 2.75;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "model-cache-tier",
    about = "Replay model requests against a tiered model cache"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Models to request, in order, as `path[:submodel]`.
    #[arg(required = true)]
    pub models: Vec<String>,

    /// Number of passes over the model list.
    #[arg(long, default_value_t = 1)]
    pub repeat: usize,

    /// Request models without loading them onto the execution device.
    #[arg(long)]
    pub cpu_only: bool,

    /// Print the final snapshot and stats as JSON.
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache configuration.
    pub cache: CacheConfig,

    /// Simulated device used by the CLI.
    pub simulation: SimulationConfig,
}

/// Order in which unlocked, VRAM-resident models are offloaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffloadOrder {
    /// Free many small occupants before one large one.
    #[default]
    SmallestFirst,
    /// Free the largest occupant first.
    LargestFirst,
}

/// Cache budgets and residency policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Storage-tier (RAM) budget in GB. An eviction target, not a hard cap.
    pub max_cache_size: f64,

    /// VRAM in GB that idle models may keep occupying.
    pub max_vram_cache_size: f64,

    /// Device models are moved to while in use.
    pub execution_device: Device,

    /// Device idle models are kept on.
    pub storage_device: Device,

    /// Precision for loaded models (passed to the provider).
    pub precision: Precision,

    /// Keep models in VRAM until another model needs the room.
    pub lazy_offloading: bool,

    /// Load pipeline stages one at a time (passed to the provider).
    pub sequential_offload: bool,

    /// Chunk size for model hashing elsewhere; not used by the cache.
    pub sha_chunksize: usize,

    /// Offload order under VRAM pressure.
    pub offload_order: OffloadOrder,

    /// Collect hit/miss statistics.
    pub collect_stats: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            max_vram_cache_size: DEFAULT_MAX_VRAM_CACHE_SIZE,
            execution_device: Device::cuda(),
            storage_device: Device::cpu(),
            precision: Precision::Float16,
            lazy_offloading: true,
            sequential_offload: false,
            sha_chunksize: 16 * 1024 * 1024,
            offload_order: OffloadOrder::SmallestFirst,
            collect_stats: true,
        }
    }
}

impl CacheConfig {
    /// Storage budget in bytes.
    pub fn max_cache_bytes(&self) -> u64 {
        gb_to_bytes(self.max_cache_size)
    }

    /// VRAM reserve in bytes.
    pub fn max_vram_bytes(&self) -> u64 {
        gb_to_bytes(self.max_vram_cache_size)
    }

    /// Lazy offloading only makes sense with a VRAM cache to be lazy about.
    pub fn effective_lazy_offloading(&self) -> bool {
        self.lazy_offloading && self.max_vram_cache_size > 0.0
    }
}

/// Simulated execution device for the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Physical device memory in GB (0 = unlimited).
    pub device_memory: f64,

    /// Extra VRAM per byte of weights once resident.
    pub layout_overhead: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            device_memory: 8.0,
            layout_overhead: 0.0,
        }
    }
}

impl SimulationConfig {
    pub fn device_memory_bytes(&self) -> Option<u64> {
        (self.device_memory > 0.0).then(|| gb_to_bytes(self.device_memory))
    }
}

/// Convert a GB figure to bytes, clamping negatives to zero.
pub fn gb_to_bytes(gb: f64) -> u64 {
    (gb.max(0.0) * GIG as f64) as u64
}

/// Convert bytes to GB for display.
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / GIG as f64
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
