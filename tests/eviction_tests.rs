//! Integration tests for the eviction policy.

use std::sync::Arc;

use model_cache_tier::cache::evictor::Evictor;
use model_cache_tier::cache::record::CacheRecord;
use model_cache_tier::config::OffloadOrder;
use model_cache_tier::gpu::device::Device;
use model_cache_tier::transfer::simulated::SimulatedModel;

fn make_test_record(key: &str, size: u64) -> CacheRecord<SimulatedModel> {
    CacheRecord::new(
        key,
        Arc::new(SimulatedModel::new(key, size, Device::cpu())),
        size,
    )
}

#[test]
fn test_victims_cover_requested_bytes() {
    let evictor = Evictor::default();
    let records = vec![
        make_test_record("a", 1),
        make_test_record("b", 2),
        make_test_record("c", 4),
        make_test_record("d", 8),
    ];

    let victims = evictor.select_victims(records.iter(), 3);
    let freed: u64 = victims.iter().map(|v| v.size).sum();
    assert_eq!(victims.len(), 2);
    assert_eq!(freed, 3);
}

#[test]
fn test_recency_beats_size() {
    let evictor = Evictor::default();
    // Least recently used first: the big model goes even though a smaller one
    // would have been enough.
    let records = vec![make_test_record("big", 10), make_test_record("small", 1)];

    let victims = evictor.select_victims(records.iter(), 1);
    assert_eq!(victims.len(), 1);
    assert_eq!(victims[0].key, "big");
}

#[test]
fn test_externally_held_model_skipped() {
    let evictor = Evictor::default();
    let records = vec![make_test_record("held", 5), make_test_record("free", 5)];
    let _handle = Arc::clone(records[0].model());

    let victims = evictor.select_victims(records.iter(), 10);
    assert_eq!(victims.len(), 1);
    assert_eq!(victims[0].key, "free");
}

#[test]
fn test_runtime_references_discounted() {
    let evictor = Evictor::default();
    let model = Arc::new(SimulatedModel::new("pipe", 5, Device::cpu()).with_extra_refs(1));
    let runtime_ref = Arc::clone(&model);
    let records = vec![CacheRecord::new("pipe", model, 5)];

    let victims = evictor.select_victims(records.iter(), 5);
    assert_eq!(victims.len(), 1);
    drop(runtime_ref);
}

#[test]
fn test_not_enough_evictable_bytes() {
    let evictor = Evictor::default();
    let mut records = vec![make_test_record("a", 4), make_test_record("b", 4)];
    records[1].lock();

    let victims = evictor.select_victims(records.iter(), 100);
    assert_eq!(victims.len(), 1);
    assert_eq!(victims[0].key, "a");
}

#[test]
fn test_offload_ties_keep_lru_order() {
    let records = vec![
        make_test_record("x", 2),
        make_test_record("y", 1),
        make_test_record("z", 2),
    ];

    for (order, expected) in [
        (OffloadOrder::SmallestFirst, ["y", "x", "z"]),
        (OffloadOrder::LargestFirst, ["x", "z", "y"]),
    ] {
        let keys: Vec<_> = Evictor::new(order)
            .offload_candidates(records.iter())
            .into_iter()
            .map(|r| r.key())
            .collect();
        assert_eq!(keys, expected, "{order:?}");
    }
}
