//! Victim selection.
//!
//! Two independent policies:
//! - storage-tier eviction walks records in LRU order and takes the first
//!   evictable ones until enough bytes are covered;
//! - execution-tier offload orders candidates by size ([`OffloadOrder`]),
//!   ignoring recency.
//!
//! Neither policy ever selects a locked record.

use tracing::debug;

use crate::cache::record::CacheRecord;
use crate::config::OffloadOrder;
use crate::provider::CachedModel;

/// A record chosen for eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub key: String,
    pub size: u64,
}

/// The eviction policy engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct Evictor {
    offload_order: OffloadOrder,
}

impl Evictor {
    pub fn new(offload_order: OffloadOrder) -> Self {
        Self { offload_order }
    }

    pub fn offload_order(&self) -> OffloadOrder {
        self.offload_order
    }

    /// Select records to evict until at least `bytes_to_free` are covered.
    ///
    /// `records` must be in LRU order (least recently used first). Locked
    /// records and records referenced outside the cache are skipped. May
    /// return fewer bytes than asked for when too few records are evictable.
    pub fn select_victims<'a, M>(
        &self,
        records: impl Iterator<Item = &'a CacheRecord<M>>,
        bytes_to_free: u64,
    ) -> Vec<EvictionCandidate>
    where
        M: CachedModel + ?Sized + 'a,
    {
        let mut victims = Vec::new();
        let mut freed = 0u64;

        for record in records {
            if freed >= bytes_to_free {
                break;
            }
            if !record.evictable() {
                debug!(
                    key = record.key(),
                    locks = record.locks(),
                    outside_refs = record.outside_refs(),
                    "Skipping in-use model"
                );
                continue;
            }
            freed += record.size();
            victims.push(EvictionCandidate {
                key: record.key().to_string(),
                size: record.size(),
            });
        }

        victims
    }

    /// Order records for execution-tier offload.
    ///
    /// Locked records are dropped here; whether a record is actually resident
    /// is for the caller to ask the model. Equal sizes keep their input order.
    pub fn offload_candidates<'a, M>(
        &self,
        records: impl Iterator<Item = &'a CacheRecord<M>>,
    ) -> Vec<&'a CacheRecord<M>>
    where
        M: CachedModel + ?Sized + 'a,
    {
        let mut candidates: Vec<_> = records.filter(|r| !r.locked()).collect();
        match self.offload_order {
            OffloadOrder::SmallestFirst => candidates.sort_by_key(|r| r.size()),
            OffloadOrder::LargestFirst => {
                candidates.sort_by_key(|r| std::cmp::Reverse(r.size()))
            }
        }
        candidates
    }
}
