//! Vulkan compute backend.
//!
//! Thin wrappers over `ash` that own GPU objects and run every transfer and
//! dispatch to completion before returning.

mod buffer;
mod device;
mod instance;
mod program;
mod stats;

#[cfg(test)]
pub(crate) mod testing;

use std::panic::Location;

use ash::vk;

pub use buffer::Buffer;
pub use device::{Device, device_type_name};
pub use instance::Instance;
pub use program::{
    InitializedProgram, MAX_WORKGROUP_MEMORY_SLOTS, PUSH_CONSTANT_SIZE_BYTES, Program,
};
pub use stats::{ShaderStatistics, StatisticFormat};

use super::{KernelError, MemoryTypeError};

/// Error type for GPU operations.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("Failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("No Vulkan device found")]
    NoDevice,

    #[error("Device index {index} out of range ({count} devices)")]
    DeviceIndex { index: usize, count: usize },

    #[error("Device has no queue family supporting compute")]
    NoComputeQueue,

    #[error("{call} failed with {result} at {location}")]
    Driver {
        call: &'static str,
        result: vk::Result,
        location: &'static Location<'static>,
    },

    #[error("Fence wait timed out after {timeout_ns} ns")]
    FenceTimeout { timeout_ns: u64 },

    #[error(transparent)]
    MemoryType(#[from] MemoryTypeError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("Access of {len} bytes at offset {offset} exceeds buffer size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("Fill offset {offset} is not a multiple of 4")]
    Misaligned { offset: u64 },

    #[error("Copy source and destination overlap within the same buffer")]
    OverlappingCopy,

    #[error("A previous dispatch timed out and is still running")]
    DispatchPending,

    #[error("Compute queue does not support timestamp queries")]
    TimestampsUnsupported,

    #[error("Workgroup-memory slot {slot} is out of range (max {max} slots)")]
    WorkgroupMemorySlot { slot: u32, max: u32 },

    #[error("Entry point contains an interior NUL byte")]
    InvalidEntryPoint(#[from] std::ffi::NulError),
}

impl GpuError {
    /// Wrap a failed driver call made before a [`Device`] exists, logging it
    /// with the caller's location.
    #[track_caller]
    pub(crate) fn driver(call: &'static str, result: vk::Result) -> Self {
        let location = Location::caller();
        log::error!("{} failed with {} at {}", call, result, location);
        GpuError::Driver {
            call,
            result,
            location,
        }
    }
}
