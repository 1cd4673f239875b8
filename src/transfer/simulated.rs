//! Simulated execution device.
//!
//! Tracks allocated bytes the way a CUDA caching allocator reports them, so the
//! cache's budget logic can be exercised without a GPU. Moving a
//! [`SimulatedModel`] onto the execution device allocates its footprint (size
//! plus a configurable layout overhead); moving it off, or dropping it while
//! resident, frees the same amount.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::gpu::device::Device;
use crate::provider::CachedModel;
use crate::transfer::{TierTransfer, TransferError};

/// Bytes a resident model holds on an execution device's allocator.
#[derive(Debug)]
struct Allocation {
    counter: Arc<AtomicU64>,
    bytes: u64,
}

impl Allocation {
    fn release(self) {
        self.counter.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

/// A model whose only state is its size and current device.
#[derive(Debug)]
pub struct SimulatedModel {
    name: String,
    size: u64,
    device: Mutex<Device>,
    allocation: Mutex<Option<Allocation>>,
    movable: bool,
    extra_refs: usize,
}

impl SimulatedModel {
    pub fn new(name: impl Into<String>, size: u64, device: Device) -> Self {
        Self {
            name: name.into(),
            size,
            device: Mutex::new(device),
            allocation: Mutex::new(None),
            movable: true,
            extra_refs: 0,
        }
    }

    /// A model without device placement (e.g. a tokenizer).
    pub fn immovable(mut self) -> Self {
        self.movable = false;
        self
    }

    /// Declare references held by the model's own runtime.
    pub fn with_extra_refs(mut self, extra_refs: usize) -> Self {
        self.extra_refs = extra_refs;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn place_on(&self, device: Device) {
        *self.device.lock().unwrap_or_else(PoisonError::into_inner) = device;
    }

    fn allocation(&self) -> std::sync::MutexGuard<'_, Option<Allocation>> {
        self.allocation.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SimulatedModel {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation().take() {
            allocation.release();
        }
    }
}

impl CachedModel for SimulatedModel {
    fn device(&self) -> Device {
        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn movable(&self) -> bool {
        self.movable
    }

    fn extra_refs(&self) -> usize {
        self.extra_refs
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    pub total_d2h_bytes: u64,
    pub total_h2d_bytes: u64,
    pub total_d2h_transfers: u64,
    pub total_h2d_transfers: u64,
    pub empty_cache_calls: u64,
}

/// Simulated execution device and transfer engine.
pub struct SimulatedTransfer {
    /// Device that counts towards `memory_allocated`.
    execution_device: Device,

    /// Physical memory of the device, if bounded.
    capacity: Option<u64>,

    /// Extra bytes per byte of weights once resident (tensor layout, padding).
    layout_overhead: f64,

    allocated: Arc<AtomicU64>,
    fail_transfers: AtomicBool,
    stats: Mutex<TransferStats>,
}

impl SimulatedTransfer {
    pub fn new(execution_device: Device) -> Self {
        Self {
            execution_device,
            capacity: None,
            layout_overhead: 0.0,
            allocated: Arc::new(AtomicU64::new(0)),
            fail_transfers: AtomicBool::new(false),
            stats: Mutex::new(TransferStats::default()),
        }
    }

    /// Bound the device memory; promotions beyond it fail with out-of-memory.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn with_layout_overhead(mut self, fraction: f64) -> Self {
        self.layout_overhead = fraction.max(0.0);
        self
    }

    /// Make every subsequent transfer fail until switched off again.
    pub fn fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bytes a model of `size` occupies once on the execution device.
    pub fn footprint(&self, size: u64) -> u64 {
        size + (size as f64 * self.layout_overhead) as u64
    }
}

impl TierTransfer<SimulatedModel> for SimulatedTransfer {
    fn move_to(&self, model: &SimulatedModel, device: &Device) -> Result<(), TransferError> {
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(TransferError::Failed(format!(
                "simulated failure moving {} to {device}",
                model.name
            )));
        }

        let from = model.device();
        if from == *device {
            return Ok(());
        }

        let footprint = self.footprint(model.size);
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);

        if *device == self.execution_device {
            let allocated = self.allocated.load(Ordering::SeqCst);
            if let Some(capacity) = self.capacity {
                if allocated + footprint > capacity {
                    return Err(TransferError::OutOfMemory {
                        device: device.clone(),
                        needed: footprint,
                        available: capacity.saturating_sub(allocated),
                    });
                }
            }
            self.allocated.fetch_add(footprint, Ordering::SeqCst);
            *model.allocation() = Some(Allocation {
                counter: Arc::clone(&self.allocated),
                bytes: footprint,
            });
            stats.total_h2d_bytes += model.size;
            stats.total_h2d_transfers += 1;
        } else if from == self.execution_device {
            if let Some(allocation) = model.allocation().take() {
                allocation.release();
            }
            stats.total_d2h_bytes += model.size;
            stats.total_d2h_transfers += 1;
        }

        debug!(
            model = %model.name,
            from = %from,
            to = %device,
            size = model.size,
            "Simulated transfer"
        );
        model.place_on(device.clone());
        Ok(())
    }

    fn memory_allocated(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst)
    }

    fn empty_cache(&self) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .empty_cache_calls += 1;
    }
}
