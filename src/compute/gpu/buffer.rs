//! GPU buffers and the synchronous transfer protocol.
//!
//! Host-visible buffers are mapped directly. Device-local buffers move data
//! through a temporary host-visible staging allocation and a one-shot copy
//! command. Every operation blocks until the queue is idle.

use std::sync::{Mutex, PoisonError};

use ash::vk;
use bytemuck::Pod;

use super::{Device, GpuError};
use crate::compute::memory::{DEVICE_LOCAL, HOST_VISIBLE};

/// The driver rejects zero-sized buffers, so empty buffers get this many bytes.
const MIN_ALLOCATION: u64 = 4;

/// One buffer object and the memory bound to it, freed together.
struct Allocation<'d> {
    device: &'d Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
}

impl<'d> Allocation<'d> {
    #[track_caller]
    fn new(
        device: &'d Device,
        size: u64,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Self, GpuError> {
        let raw = device.handle();
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // Handles start null so a partial failure frees only what exists.
        let mut allocation = Self {
            device,
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
        };
        // SAFETY: buffer_info is fully initialised.
        allocation.buffer =
            device.check("vkCreateBuffer", unsafe { raw.create_buffer(&buffer_info, None) })?;

        // SAFETY: the buffer was just created on this device.
        let requirements = unsafe { raw.get_buffer_memory_requirements(allocation.buffer) };
        let memory_type = device.select_memory(requirements.memory_type_bits, flags)?;
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        // SAFETY: memory_type comes from this device's table.
        allocation.memory = device.check("vkAllocateMemory", unsafe {
            raw.allocate_memory(&allocate_info, None)
        })?;
        // SAFETY: fresh memory of at least requirements.size bytes, offset 0.
        device.check("vkBindBufferMemory", unsafe {
            raw.bind_buffer_memory(allocation.buffer, allocation.memory, 0)
        })?;

        Ok(allocation)
    }

    /// Copy `data` into host-visible memory at `offset`.
    #[track_caller]
    fn write(&self, offset: u64, data: &[u8]) -> Result<(), GpuError> {
        let raw = self.device.handle();
        let len = data.len() as u64;
        // SAFETY: the caller checked the range; memory is host-visible and coherent.
        unsafe {
            let mapped = self.device.check(
                "vkMapMemory",
                raw.map_memory(self.memory, offset, len, vk::MemoryMapFlags::empty()),
            )?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.cast::<u8>(), data.len());
            raw.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Copy host-visible memory at `offset` into `out`.
    #[track_caller]
    fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), GpuError> {
        let raw = self.device.handle();
        let len = out.len() as u64;
        // SAFETY: the caller checked the range; memory is host-visible and coherent.
        unsafe {
            let mapped = self.device.check(
                "vkMapMemory",
                raw.map_memory(self.memory, offset, len, vk::MemoryMapFlags::empty()),
            )?;
            std::ptr::copy_nonoverlapping(mapped.cast::<u8>(), out.as_mut_ptr(), out.len());
            raw.unmap_memory(self.memory);
        }
        Ok(())
    }
}

impl Drop for Allocation<'_> {
    fn drop(&mut self) {
        let raw = self.device.handle();
        // SAFETY: all transfers wait for queue idle, so nothing is in flight.
        unsafe {
            raw.destroy_buffer(self.buffer, None);
            raw.free_memory(self.memory, None);
        }
    }
}

/// Command pool and buffer reserved for a buffer's copy and fill commands.
struct TransferCommands {
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
}

/// A fixed-size region of GPU memory.
///
/// The buffer is untyped; `store`/`load` move raw bytes and the `*_slice`
/// helpers view them as any [`Pod`] type. Programs borrow buffers, so a
/// buffer always outlives every program bound to it.
pub struct Buffer<'d> {
    // Declared first so the pool is destroyed before the allocation.
    commands: Mutex<TransferCommands>,
    allocation: Allocation<'d>,
    size: u64,
    device_local: bool,
}

impl std::fmt::Debug for Buffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size)
            .field("device_local", &self.device_local)
            .finish_non_exhaustive()
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        let commands = self
            .commands
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        // SAFETY: one-shot commands complete before the lock is released.
        unsafe {
            self.allocation
                .device
                .handle()
                .destroy_command_pool(commands.pool, None)
        };
    }
}

impl<'d> Buffer<'d> {
    /// Allocate a buffer of `size` bytes.
    ///
    /// `device_local` selects device-local memory, which the host cannot map;
    /// otherwise the memory is host-visible and coherent.
    #[track_caller]
    pub fn new(device: &'d Device, size: u64, device_local: bool) -> Result<Self, GpuError> {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;
        let flags = if device_local { DEVICE_LOCAL } else { HOST_VISIBLE };
        let allocation = Allocation::new(device, size.max(MIN_ALLOCATION), usage, flags)?;

        let raw = device.handle();
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(device.compute_family());
        // SAFETY: the compute family exists on this device.
        let pool =
            device.check("vkCreateCommandPool", unsafe { raw.create_command_pool(&pool_info, None) })?;
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: pool was just created.
        let allocated = device.check("vkAllocateCommandBuffers", unsafe {
            raw.allocate_command_buffers(&allocate_info)
        });
        let command_buffer = match allocated {
            Ok(buffers) => buffers[0],
            Err(e) => {
                // SAFETY: nothing was allocated from the pool.
                unsafe { raw.destroy_command_pool(pool, None) };
                return Err(e);
            }
        };

        log::debug!(
            "Allocated {} buffer of {} bytes",
            if device_local { "device-local" } else { "host-visible" },
            size
        );

        Ok(Self {
            commands: Mutex::new(TransferCommands {
                pool,
                command_buffer,
            }),
            allocation,
            size,
            device_local,
        })
    }

    /// Size in bytes, as requested at construction.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_device_local(&self) -> bool {
        self.device_local
    }

    pub fn device(&self) -> &'d Device {
        self.allocation.device
    }

    pub(crate) fn handle(&self) -> vk::Buffer {
        self.allocation.buffer
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), GpuError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(GpuError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    /// Record commands into the private command buffer, submit them and wait
    /// for the queue to drain. The pool is reset on every path out, so a
    /// failed recording never leaves the command buffer half-built.
    #[track_caller]
    fn one_shot(
        &self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer) -> Result<(), GpuError>,
    ) -> Result<(), GpuError> {
        let device = self.allocation.device;
        let raw = device.handle();
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        let command_buffer = commands.command_buffer;

        let submitted = record_transfer(device, command_buffer, record)
            .and_then(|()| device.submit_and_wait_idle(command_buffer));
        // SAFETY: the queue is idle (or the submit never happened).
        let reset = device.check("vkResetCommandPool", unsafe {
            raw.reset_command_pool(commands.pool, vk::CommandPoolResetFlags::empty())
        });
        submitted.and(reset)
    }

    /// Write `data` at byte `offset`.
    #[track_caller]
    pub fn store(&self, data: &[u8], offset: u64) -> Result<(), GpuError> {
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        self.check_range(offset, len)?;

        if !self.device_local {
            return self.allocation.write(offset, data);
        }

        let staging = Allocation::new(
            self.allocation.device,
            len,
            vk::BufferUsageFlags::TRANSFER_SRC,
            HOST_VISIBLE,
        )?;
        staging.write(0, data)?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: offset,
            size: len,
        };
        let target = self.allocation.buffer;
        self.one_shot(|raw, command_buffer| {
            // SAFETY: both buffers are live and the region is in range.
            unsafe { raw.cmd_copy_buffer(command_buffer, staging.buffer, target, &[region]) };
            Ok(())
        })
    }

    /// Read `out.len()` bytes starting at byte `offset`.
    #[track_caller]
    pub fn load(&self, out: &mut [u8], offset: u64) -> Result<(), GpuError> {
        if out.is_empty() {
            return Ok(());
        }
        let len = out.len() as u64;
        self.check_range(offset, len)?;

        if !self.device_local {
            return self.allocation.read(offset, out);
        }

        let staging = Allocation::new(
            self.allocation.device,
            len,
            vk::BufferUsageFlags::TRANSFER_DST,
            HOST_VISIBLE,
        )?;
        let region = vk::BufferCopy {
            src_offset: offset,
            dst_offset: 0,
            size: len,
        };
        let source = self.allocation.buffer;
        self.one_shot(|raw, command_buffer| {
            // SAFETY: both buffers are live and the region is in range.
            unsafe { raw.cmd_copy_buffer(command_buffer, source, staging.buffer, &[region]) };
            Ok(())
        })?;
        staging.read(0, out)
    }

    /// Copy `len` bytes from this buffer at `src_offset` into `dst` at
    /// `dst_offset`, entirely on the device.
    #[track_caller]
    pub fn copy(
        &self,
        dst: &Buffer<'_>,
        len: u64,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<(), GpuError> {
        if len == 0 {
            return Ok(());
        }
        self.check_range(src_offset, len)?;
        dst.check_range(dst_offset, len)?;
        if self.handle() == dst.handle()
            && src_offset < dst_offset + len
            && dst_offset < src_offset + len
        {
            return Err(GpuError::OverlappingCopy);
        }

        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size: len,
        };
        let (source, target) = (self.allocation.buffer, dst.allocation.buffer);
        self.one_shot(|raw, command_buffer| {
            // SAFETY: both buffers are live and the regions are in range.
            unsafe { raw.cmd_copy_buffer(command_buffer, source, target, &[region]) };
            Ok(())
        })
    }

    /// Set every 32-bit word from byte `offset` to the end of the buffer to
    /// `word`. A trailing partial word is left untouched.
    #[track_caller]
    pub fn fill(&self, word: u32, offset: u64) -> Result<(), GpuError> {
        if offset % 4 != 0 {
            return Err(GpuError::Misaligned { offset });
        }
        if offset > self.size {
            return Err(GpuError::OutOfBounds {
                offset,
                len: 0,
                size: self.size,
            });
        }
        let len = (self.size - offset) & !3;
        if len == 0 {
            return Ok(());
        }

        let target = self.allocation.buffer;
        self.one_shot(|raw, command_buffer| {
            // SAFETY: offset and len are 4-byte multiples inside the buffer.
            unsafe { raw.cmd_fill_buffer(command_buffer, target, offset, len, word) };
            Ok(())
        })
    }

    /// Zero the whole buffer.
    #[track_caller]
    pub fn clear(&self) -> Result<(), GpuError> {
        self.fill(0, 0)
    }

    /// Write a slice of plain-old-data values at byte `offset`.
    #[track_caller]
    pub fn store_slice<T: Pod>(&self, values: &[T], offset: u64) -> Result<(), GpuError> {
        self.store(bytemuck::cast_slice(values), offset)
    }

    /// Fill `out` with values read from byte `offset`.
    #[track_caller]
    pub fn load_slice<T: Pod>(&self, out: &mut [T], offset: u64) -> Result<(), GpuError> {
        self.load(bytemuck::cast_slice_mut(out), offset)
    }

    /// Read `count` values starting at byte `offset`.
    #[track_caller]
    pub fn load_vec<T: Pod>(&self, count: usize, offset: u64) -> Result<Vec<T>, GpuError> {
        let mut values = vec![T::zeroed(); count];
        self.load_slice(&mut values, offset)?;
        Ok(values)
    }

    /// Free the memory, buffer object and command pool.
    pub fn teardown(self) {
        drop(self);
    }
}

/// Begin `command_buffer`, let `record` fill it, make transfer writes
/// visible to host reads, and end it.
#[track_caller]
fn record_transfer(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    record: impl FnOnce(&ash::Device, vk::CommandBuffer) -> Result<(), GpuError>,
) -> Result<(), GpuError> {
    let raw = device.handle();
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    // SAFETY: the pool was reset after the previous submission completed.
    device.check("vkBeginCommandBuffer", unsafe {
        raw.begin_command_buffer(command_buffer, &begin_info)
    })?;
    record(raw, command_buffer)?;

    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ);
    // SAFETY: the command buffer is recording.
    unsafe {
        raw.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        )
    };
    device.check("vkEndCommandBuffer", unsafe {
        raw.end_command_buffer(command_buffer)
    })
}
