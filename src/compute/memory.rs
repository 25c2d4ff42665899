//! Memory-type selection against a physical device's memory-type table.

use ash::vk;

/// Failure to find a memory type compatible with an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryTypeError {
    #[error("No memory type matches requirement bits {type_bits:#b} with flags {required:?}")]
    NoCompatibleType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },
}

/// Pick the first memory type allowed by `type_bits` whose property flags
/// contain every flag in `required`.
///
/// `type_bits` is the `memory_type_bits` field of `vk::MemoryRequirements`:
/// bit `i` set means type `i` may back the resource. The scan runs in table
/// order, so the platform's own ordering (fastest types first) decides ties.
pub fn select_memory_type(
    memory_types: &[vk::MemoryType],
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, MemoryTypeError> {
    memory_types
        .iter()
        .enumerate()
        .take(32)
        .find(|(i, ty)| type_bits & (1u32 << i) != 0 && ty.property_flags.contains(required))
        .map(|(i, _)| i as u32)
        .ok_or(MemoryTypeError::NoCompatibleType {
            type_bits,
            required,
        })
}

/// Property flags used for host-mapped buffers and staging allocations.
pub const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Property flags used for device-local buffers.
pub const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
