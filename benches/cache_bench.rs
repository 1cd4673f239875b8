//! Benchmarks for the model cache.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use model_cache_tier::cache::evictor::Evictor;
use model_cache_tier::cache::record::{cache_key, CacheRecord};
use model_cache_tier::cache::ModelCache;
use model_cache_tier::config::{CacheConfig, OffloadOrder, GIG};
use model_cache_tier::gpu::device::Device;
use model_cache_tier::provider::fixed::FixedSizeProvider;
use model_cache_tier::transfer::simulated::{SimulatedModel, SimulatedTransfer};

fn make_cache(max_gb: f64, vram_gb: f64) -> ModelCache<SimulatedModel, SimulatedTransfer> {
    let config = CacheConfig {
        max_cache_size: max_gb,
        max_vram_cache_size: vram_gb,
        ..Default::default()
    };
    ModelCache::new(config, SimulatedTransfer::new(Device::cuda()))
}

fn bench_hit_path(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let provider = FixedSizeProvider::new(GIG);
    let cache = make_cache(64.0, 8.0);
    for i in 0..32 {
        let sub = format!("m{i}");
        cache.get(dir.path(), &provider, Some(&sub), false).unwrap();
    }

    c.bench_function("get_hit_acquire_release", |b| {
        b.iter(|| {
            let guard = cache
                .get(dir.path(), &provider, black_box(Some("m16")), true)
                .unwrap()
                .acquire()
                .unwrap();
            black_box(guard.size());
        })
    });
}

fn bench_eviction_churn(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let provider = FixedSizeProvider::new(GIG);
    let cache = make_cache(4.0, 2.0);
    let subs: Vec<String> = (0..16).map(|i| format!("m{i}")).collect();

    // Every request misses: four models fit, sixteen rotate through.
    c.bench_function("get_miss_with_eviction", |b| {
        let mut next = 0;
        b.iter(|| {
            let sub = &subs[next % subs.len()];
            next += 1;
            let guard = cache
                .get(dir.path(), &provider, Some(sub), true)
                .unwrap()
                .acquire()
                .unwrap();
            black_box(guard.key().len());
        })
    });
}

fn bench_offload_ordering(c: &mut Criterion) {
    let records: Vec<CacheRecord<SimulatedModel>> = (0..10_000u64)
        .map(|i| {
            let key = cache_key(std::path::Path::new("/models"), Some(&format!("m{i}")));
            let size = (i * 7919) % 4096 + 1;
            CacheRecord::new(
                key.clone(),
                Arc::new(SimulatedModel::new(key, size, Device::cuda())),
                size,
            )
        })
        .collect();

    for order in [OffloadOrder::SmallestFirst, OffloadOrder::LargestFirst] {
        let evictor = Evictor::new(order);
        c.bench_function(&format!("offload_candidates_10k_{order:?}"), |b| {
            b.iter(|| black_box(evictor.offload_candidates(black_box(records.iter()))).len())
        });
    }

    let evictor = Evictor::default();
    c.bench_function("select_victims_10k", |b| {
        b.iter(|| black_box(evictor.select_victims(black_box(records.iter()), 1 << 20)))
    });
}

criterion_group!(
    benches,
    bench_hit_path,
    bench_eviction_churn,
    bench_offload_ordering,
);
criterion_main!(benches);
