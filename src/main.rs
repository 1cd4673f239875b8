//! model-cache-tier: replay model requests against a tiered model cache.
//!
//! Each request names a model on disk as `path[:submodel]`. The model is loaded
//! into the storage tier, acquired (promoted into the simulated execution
//! device unless `--cpu-only`), and released again, so a request list traces
//! how the two budgets behave for a real set of models.

use std::time::Instant;

use clap::Parser;
use serde::Serialize;
use tracing::{error, info};

use model_cache_tier::cache::{EntryInfo, ModelCache};
use model_cache_tier::config::{Cli, Config};
use model_cache_tier::provider::file::FileModelProvider;
use model_cache_tier::transfer::simulated::{SimulatedModel, SimulatedTransfer};
use model_cache_tier::transfer::TierTransfer;
use model_cache_tier::CacheStats;

#[derive(Serialize)]
struct Report {
    entries: Vec<EntryInfo>,
    stats: Option<CacheStats>,
    vram_bytes: u64,
    ram_bytes: u64,
}

/// Split `path[:submodel]`. A colon followed by a path separator belongs to the
/// path (`C:\models`), not to a sub-model.
fn parse_request(request: &str) -> (&str, Option<&str>) {
    match request.rsplit_once(':') {
        Some((path, sub)) if !path.is_empty() && !sub.is_empty() && !sub.contains(['/', '\\']) => {
            (path, Some(sub))
        }
        _ => (request, None),
    }
}

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "model_cache_tier=debug"
    } else {
        "model_cache_tier=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("model-cache-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;

    info!(
        max_cache_gb = config.cache.max_cache_size,
        max_vram_gb = config.cache.max_vram_cache_size,
        execution_device = %config.cache.execution_device,
        storage_device = %config.cache.storage_device,
        lazy_offloading = config.cache.effective_lazy_offloading(),
        "Configuration loaded"
    );

    // Simulated execution device.
    let mut transfer = SimulatedTransfer::new(config.cache.execution_device.clone())
        .with_layout_overhead(config.simulation.layout_overhead);
    if let Some(capacity) = config.simulation.device_memory_bytes() {
        transfer = transfer.with_capacity(capacity);
    }

    let cache: ModelCache<SimulatedModel, SimulatedTransfer> =
        ModelCache::new(config.cache.clone(), transfer);
    let provider = FileModelProvider::new();
    let gpu_load = !cli.cpu_only;

    let start = Instant::now();
    let mut failures = 0usize;
    for pass in 0..cli.repeat {
        for request in &cli.models {
            let (path, submodel) = parse_request(request);
            let acquired = cache
                .get(path, &provider, submodel, gpu_load)
                .and_then(|locker| locker.acquire());
            match acquired {
                Ok(guard) => info!(
                    pass,
                    key = guard.key(),
                    size = guard.size(),
                    locked = guard.is_locked(),
                    "Model acquired"
                ),
                Err(e) => {
                    failures += 1;
                    error!(pass, request = %request, error = %e, "Request failed");
                }
            }
        }
    }

    let report = Report {
        entries: cache.snapshot(),
        stats: cache.stats(),
        vram_bytes: cache.transfer().memory_allocated(),
        ram_bytes: cache.cache_size(),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for entry in &report.entries {
            info!(
                key = %entry.key,
                size = entry.size,
                device = %entry.device,
                tier = %entry.tier,
                "Cached model"
            );
        }
        if let Some(stats) = &report.stats {
            info!(
                hits = stats.hits,
                misses = stats.misses,
                hit_rate = stats.hit_rate(),
                cleared = stats.cleared,
                high_watermark = stats.high_watermark,
                "Cache stats"
            );
        }
        info!(
            vram_bytes = report.vram_bytes,
            ram_bytes = report.ram_bytes,
            elapsed_ms = start.elapsed().as_millis() as u64,
            failures,
            "Done"
        );
    }

    if failures > 0 {
        anyhow::bail!("{failures} request(s) failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        assert_eq!(parse_request("models/sd"), ("models/sd", None));
        assert_eq!(parse_request("models/sd:vae"), ("models/sd", Some("vae")));
        assert_eq!(parse_request(r"C:\models\sd"), (r"C:\models\sd", None));
        assert_eq!(parse_request(r"C:\models\sd:unet"), (r"C:\models\sd", Some("unet")));
        assert_eq!(parse_request("models/sd:"), ("models/sd:", None));
    }
}
