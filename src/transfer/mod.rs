//! Data transfer between tiers.
//!
//! - [`simulated`]: in-process stand-in for a GPU, with transfer statistics
//!
//! The cache moves models through a [`TierTransfer`] and never touches device
//! memory directly.

pub mod simulated;

use thiserror::Error;

use crate::gpu::device::Device;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Out of memory on {device}: need {needed} bytes, have {available}")]
    OutOfMemory {
        device: Device,
        needed: u64,
        available: u64,
    },

    #[error("Device {0} not available")]
    DeviceUnavailable(Device),

    #[error("Transfer failed: {0}")]
    Failed(String),
}

/// The tier-transfer primitive and the execution-device memory meter.
///
/// Calls are synchronous and uncancellable; a caller that needs a timeout must
/// wrap the cache externally.
pub trait TierTransfer<M: ?Sized>: Send + Sync {
    /// Move `model`'s weights onto `device`.
    fn move_to(&self, model: &M, device: &Device) -> Result<(), TransferError>;

    /// Bytes currently allocated on the execution device.
    fn memory_allocated(&self) -> u64;

    /// Ask the runtime to hand freed device memory back immediately.
    fn empty_cache(&self) {}
}
