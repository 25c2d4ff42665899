//! Compute pipelines and the dispatch protocol.
//!
//! A [`Program`] collects the dispatch configuration. [`Program::initialize`]
//! consumes it and builds every pipeline object, yielding an
//! [`InitializedProgram`] that can be run any number of times.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::path::Path;

use ash::vk;

use super::{Buffer, Device, GpuError, ShaderStatistics, stats};
use crate::compute::KernelBinary;

/// Size of the push-constant range every pipeline layout declares. The
/// range is zero-filled on each run.
pub const PUSH_CONSTANT_SIZE_BYTES: u32 = 20;

/// Specialization constant ids below this are reserved for the workgroup
/// dimensions; workgroup-memory slot `k` maps to id `FIRST_MEMORY_SLOT_ID + k`.
const FIRST_MEMORY_SLOT_ID: u32 = 3;

/// Workgroup-memory slots are numbered `0..MAX_WORKGROUP_MEMORY_SLOTS`.
pub const MAX_WORKGROUP_MEMORY_SLOTS: u32 = 64;

struct ShaderModule<'a> {
    device: &'a Device,
    handle: vk::ShaderModule,
}

impl<'a> ShaderModule<'a> {
    #[track_caller]
    fn new(device: &'a Device, kernel: &KernelBinary) -> Result<Self, GpuError> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(kernel.words());
        // SAFETY: the kernel is a non-empty word sequence; the driver validates it.
        let handle = device.check("vkCreateShaderModule", unsafe {
            device.handle().create_shader_module(&create_info, None)
        })?;
        Ok(Self { device, handle })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        // SAFETY: pipelines built from the module do not reference it afterwards.
        unsafe { self.device.handle().destroy_shader_module(self.handle, None) };
    }
}

/// A compute kernel bound to an ordered list of buffers, not yet compiled
/// into a pipeline.
///
/// Buffer `i` is bound to descriptor binding `i` of set 0.
pub struct Program<'a> {
    device: &'a Device,
    shader: ShaderModule<'a>,
    buffers: Vec<&'a Buffer<'a>>,
    workgroups: u32,
    workgroup_size: u32,
    workgroup_memory: BTreeMap<u32, u32>,
    require_full_subgroups: bool,
}

impl<'a> Program<'a> {
    #[track_caller]
    pub fn new(
        device: &'a Device,
        kernel: &KernelBinary,
        buffers: &[&'a Buffer<'a>],
    ) -> Result<Self, GpuError> {
        Ok(Self {
            device,
            shader: ShaderModule::new(device, kernel)?,
            buffers: buffers.to_vec(),
            workgroups: 1,
            workgroup_size: 1,
            workgroup_memory: BTreeMap::new(),
            require_full_subgroups: false,
        })
    }

    /// Load a SPIR-V file and build a program from it.
    #[track_caller]
    pub fn from_file(
        device: &'a Device,
        path: impl AsRef<Path>,
        buffers: &[&'a Buffer<'a>],
    ) -> Result<Self, GpuError> {
        let kernel = KernelBinary::from_file(path)?;
        Self::new(device, &kernel, buffers)
    }

    /// Number of workgroups dispatched along x.
    pub fn set_workgroups(&mut self, workgroups: u32) -> &mut Self {
        self.workgroups = workgroups;
        self
    }

    /// Workgroup size, passed as specialization constant 0.
    pub fn set_workgroup_size(&mut self, workgroup_size: u32) -> &mut Self {
        self.workgroup_size = workgroup_size;
        self
    }

    /// Length of workgroup-memory slot `index`, passed as specialization
    /// constant `3 + index`.
    pub fn set_workgroup_memory_length(&mut self, index: u32, length: u32) -> &mut Self {
        self.workgroup_memory.insert(index, length);
        self
    }

    /// Require full subgroups in the compute stage. Ignored with a warning on
    /// devices that cannot honour it.
    pub fn set_require_full_subgroups(&mut self, require: bool) -> &mut Self {
        self.require_full_subgroups = require;
        self
    }

    /// Build the descriptor bindings and the compute pipeline for
    /// `entry_point`.
    #[track_caller]
    pub fn initialize(self, entry_point: &str) -> Result<InitializedProgram<'a>, GpuError> {
        let entry_point = CString::new(entry_point)?;
        let device = self.device;
        let raw = device.handle();

        let mut program = InitializedProgram {
            device,
            buffers: self.buffers,
            workgroups: self.workgroups,
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set: vk::DescriptorSet::null(),
            pipeline: vk::Pipeline::null(),
            fence: vk::Fence::null(),
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            timestamp_pool: vk::QueryPool::null(),
            in_flight: false,
        };

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..program.buffers.len())
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        // SAFETY: every create call below only references live objects and
        // stack data that outlives the call.
        program.descriptor_set_layout = device.check("vkCreateDescriptorSetLayout", unsafe {
            raw.create_descriptor_set_layout(&layout_info, None)
        })?;

        let set_layouts = [program.descriptor_set_layout];
        let push_constants = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(PUSH_CONSTANT_SIZE_BYTES)];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constants);
        program.pipeline_layout = device.check("vkCreatePipelineLayout", unsafe {
            raw.create_pipeline_layout(&pipeline_layout_info, None)
        })?;

        // A pool with no descriptors is invalid, so bufferless kernels get no set.
        if !program.buffers.is_empty() {
            let pool_sizes = [vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: program.buffers.len() as u32,
            }];
            let pool_info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(1)
                .pool_sizes(&pool_sizes);
            program.descriptor_pool = device.check("vkCreateDescriptorPool", unsafe {
                raw.create_descriptor_pool(&pool_info, None)
            })?;

            let allocate_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(program.descriptor_pool)
                .set_layouts(&set_layouts);
            program.descriptor_set = device.check("vkAllocateDescriptorSets", unsafe {
                raw.allocate_descriptor_sets(&allocate_info)
            })?[0];

            let buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = program
                .buffers
                .iter()
                .map(|buffer| {
                    [vk::DescriptorBufferInfo::default()
                        .buffer(buffer.handle())
                        .offset(0)
                        .range(vk::WHOLE_SIZE)]
                })
                .collect();
            let writes: Vec<vk::WriteDescriptorSet> = buffer_infos
                .iter()
                .enumerate()
                .map(|(binding, info)| {
                    vk::WriteDescriptorSet::default()
                        .dst_set(program.descriptor_set)
                        .dst_binding(binding as u32)
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .buffer_info(info)
                })
                .collect();
            unsafe { raw.update_descriptor_sets(&writes, &[]) };
        }

        let (map_entries, constants) =
            specialization_data(self.workgroup_size, &self.workgroup_memory)?;
        let specialization = vk::SpecializationInfo::default()
            .map_entries(&map_entries)
            .data(bytemuck::cast_slice(&constants));

        let mut stage_flags = vk::PipelineShaderStageCreateFlags::empty();
        if self.require_full_subgroups {
            if device.supports_full_subgroups() {
                stage_flags |= vk::PipelineShaderStageCreateFlags::REQUIRE_FULL_SUBGROUPS;
            } else {
                log::warn!(
                    "{}: full subgroups requested but not supported; ignoring",
                    device.name()
                );
            }
        }
        let mut pipeline_flags = vk::PipelineCreateFlags::empty();
        if device.supports_executable_statistics() {
            pipeline_flags |= vk::PipelineCreateFlags::CAPTURE_STATISTICS_KHR;
        }

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .flags(stage_flags)
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(self.shader.handle)
            .name(&entry_point)
            .specialization_info(&specialization);
        let pipeline_info = [vk::ComputePipelineCreateInfo::default()
            .flags(pipeline_flags)
            .stage(stage)
            .layout(program.pipeline_layout)];
        let pipelines = unsafe {
            raw.create_compute_pipelines(vk::PipelineCache::null(), &pipeline_info, None)
        }
        .map_err(|(_, result)| result);
        program.pipeline = device.check("vkCreateComputePipelines", pipelines)?[0];
        // The shader module is no longer needed once the pipeline exists.
        drop(self.shader);

        program.fence = device.check("vkCreateFence", unsafe {
            raw.create_fence(&vk::FenceCreateInfo::default(), None)
        })?;

        let command_pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.compute_family());
        program.command_pool = device.check("vkCreateCommandPool", unsafe {
            raw.create_command_pool(&command_pool_info, None)
        })?;
        let command_buffer_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(program.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        program.command_buffer = device.check("vkAllocateCommandBuffers", unsafe {
            raw.allocate_command_buffers(&command_buffer_info)
        })?[0];

        if device.supports_dispatch_timing() {
            let query_info = vk::QueryPoolCreateInfo::default()
                .query_type(vk::QueryType::TIMESTAMP)
                .query_count(2);
            program.timestamp_pool = device.check("vkCreateQueryPool", unsafe {
                raw.create_query_pool(&query_info, None)
            })?;
        }

        log::debug!(
            "{}: initialized program '{}' with {} buffers, {} workgroups of size {}",
            device.name(),
            entry_point.to_string_lossy(),
            program.buffers.len(),
            program.workgroups,
            self.workgroup_size
        );
        Ok(program)
    }
}

fn map_entry(constant_id: u32) -> Option<vk::SpecializationMapEntry> {
    Some(vk::SpecializationMapEntry {
        constant_id,
        offset: constant_id.checked_mul(4)?,
        size: std::mem::size_of::<u32>(),
    })
}

/// Specialization map entries and their packed data block.
///
/// Ids 0..3 are the workgroup dimensions `(workgroup_size, 1, 1)`. Each
/// configured memory slot `k` becomes id `3 + k` at byte offset `(3 + k) * 4`;
/// unconfigured slots below the highest one stay zero in the data block.
/// Slots at or above [`MAX_WORKGROUP_MEMORY_SLOTS`] are rejected.
fn specialization_data(
    workgroup_size: u32,
    workgroup_memory: &BTreeMap<u32, u32>,
) -> Result<(Vec<vk::SpecializationMapEntry>, Vec<u32>), GpuError> {
    let slots = match workgroup_memory.keys().next_back() {
        Some(&highest) if highest >= MAX_WORKGROUP_MEMORY_SLOTS => {
            return Err(GpuError::WorkgroupMemorySlot {
                slot: highest,
                max: MAX_WORKGROUP_MEMORY_SLOTS,
            });
        }
        Some(&highest) => highest as usize + 1,
        None => 0,
    };
    let mut data = vec![0u32; FIRST_MEMORY_SLOT_ID as usize + slots];
    data[..3].copy_from_slice(&[workgroup_size, 1, 1]);

    let mut entries: Vec<_> = (0..FIRST_MEMORY_SLOT_ID).filter_map(map_entry).collect();
    for (&slot, &length) in workgroup_memory {
        let entry = FIRST_MEMORY_SLOT_ID
            .checked_add(slot)
            .and_then(map_entry)
            .ok_or(GpuError::WorkgroupMemorySlot {
                slot,
                max: MAX_WORKGROUP_MEMORY_SLOTS,
            })?;
        data[entry.constant_id as usize] = length;
        entries.push(entry);
    }
    Ok((entries, data))
}

/// Elapsed nanoseconds between two raw timestamps.
fn elapsed_ns(start: u64, end: u64, valid_bits: u32, period: f32) -> f64 {
    let mask = if valid_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << valid_bits) - 1
    };
    (end.wrapping_sub(start) & mask) as f64 * f64::from(period)
}

/// A compiled program, ready to dispatch.
///
/// Dropping it (or calling [`teardown`](Self::teardown)) destroys every
/// pipeline object. The bound buffers are only borrowed.
pub struct InitializedProgram<'a> {
    device: &'a Device,
    buffers: Vec<&'a Buffer<'a>>,
    workgroups: u32,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    pipeline: vk::Pipeline,
    fence: vk::Fence,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    timestamp_pool: vk::QueryPool,
    /// A submission timed out and may still be executing.
    in_flight: bool,
}

impl Drop for InitializedProgram<'_> {
    fn drop(&mut self) {
        let raw = self.device.handle();
        if self.in_flight {
            log::warn!(
                "{}: waiting for a timed-out dispatch before teardown",
                self.device.name()
            );
            // SAFETY: the fence belongs to this program and is still alive.
            if let Err(e) = unsafe { raw.wait_for_fences(&[self.fence], true, u64::MAX) } {
                log::error!("{}: vkWaitForFences failed with {}", self.device.name(), e);
                let _ = self.device.wait_idle();
            }
        }
        // SAFETY: no submission is pending past this point. Handles left null
        // by a failed initialize are ignored by the driver.
        unsafe {
            raw.destroy_query_pool(self.timestamp_pool, None);
            raw.destroy_command_pool(self.command_pool, None);
            raw.destroy_fence(self.fence, None);
            raw.destroy_pipeline(self.pipeline, None);
            raw.destroy_descriptor_pool(self.descriptor_pool, None);
            raw.destroy_pipeline_layout(self.pipeline_layout, None);
            raw.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

impl<'a> InitializedProgram<'a> {
    pub fn buffers(&self) -> &[&'a Buffer<'a>] {
        &self.buffers
    }

    pub fn workgroups(&self) -> u32 {
        self.workgroups
    }

    /// Whether a timed-out dispatch may still be executing.
    pub fn is_pending(&self) -> bool {
        self.in_flight
    }

    /// Block until a timed-out dispatch has finished. Returns immediately
    /// when nothing is pending.
    #[track_caller]
    pub fn wait(&mut self) -> Result<(), GpuError> {
        if !self.in_flight {
            return Ok(());
        }
        let raw = self.device.handle();
        // SAFETY: the fence is live; it was signalled or is about to be.
        unsafe {
            self.device.check(
                "vkWaitForFences",
                raw.wait_for_fences(&[self.fence], true, u64::MAX),
            )?;
            self.device
                .check("vkResetFences", raw.reset_fences(&[self.fence]))?;
        }
        self.in_flight = false;
        Ok(())
    }

    /// Clear the in-flight state if the timed-out submission has since
    /// signalled its fence.
    #[track_caller]
    fn settle(&mut self) -> Result<(), GpuError> {
        if !self.in_flight {
            return Ok(());
        }
        let raw = self.device.handle();
        // SAFETY: the fence is live.
        let signalled = self.device.check("vkGetFenceStatus", unsafe {
            raw.get_fence_status(self.fence)
        })?;
        if !signalled {
            return Err(GpuError::DispatchPending);
        }
        // SAFETY: the fence is signalled and no submission uses it.
        self.device.check("vkResetFences", unsafe {
            raw.reset_fences(&[self.fence])
        })?;
        self.in_flight = false;
        Ok(())
    }

    fn record_barrier(&self, raw: &ash::Device) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ);
        // SAFETY: called while the command buffer is recording.
        unsafe {
            raw.cmd_pipeline_barrier(
                self.command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            )
        };
    }

    fn record_timestamp(&self, raw: &ash::Device, query: u32) {
        // SAFETY: called while recording; the pool has two slots.
        unsafe {
            raw.cmd_write_timestamp(
                self.command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                self.timestamp_pool,
                query,
            )
        };
    }

    /// Record the dispatch, optionally bracketed by timestamps, then submit
    /// and wait on the fence.
    #[track_caller]
    fn dispatch(&mut self, timed: bool) -> Result<(), GpuError> {
        self.settle()?;
        let device = self.device;
        let raw = device.handle();
        let command_buffer = self.command_buffer;

        // SAFETY: the previous submission finished before its fence was reset.
        unsafe {
            device.check(
                "vkBeginCommandBuffer",
                raw.begin_command_buffer(command_buffer, &vk::CommandBufferBeginInfo::default()),
            )?;
            if timed {
                raw.cmd_reset_query_pool(command_buffer, self.timestamp_pool, 0, 2);
            }
            raw.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            if self.descriptor_set != vk::DescriptorSet::null() {
                raw.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::COMPUTE,
                    self.pipeline_layout,
                    0,
                    &[self.descriptor_set],
                    &[],
                );
            }
            raw.cmd_push_constants(
                command_buffer,
                self.pipeline_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                &[0u8; PUSH_CONSTANT_SIZE_BYTES as usize],
            );
        }

        self.record_barrier(raw);
        if timed {
            self.record_timestamp(raw, 0);
        }
        // SAFETY: recording, pipeline bound.
        unsafe { raw.cmd_dispatch(command_buffer, self.workgroups, 1, 1) };
        self.record_barrier(raw);
        if timed {
            self.record_timestamp(raw, 1);
        }

        // SAFETY: recording began above.
        device.check("vkEndCommandBuffer", unsafe {
            raw.end_command_buffer(command_buffer)
        })?;
        let result = device.submit_and_wait_fence(command_buffer, self.fence);
        if let Err(GpuError::FenceTimeout { .. }) = result {
            self.in_flight = true;
        }
        result
    }

    /// Dispatch once and block until the kernel has finished.
    #[track_caller]
    pub fn run(&mut self) -> Result<(), GpuError> {
        self.dispatch(false)
    }

    /// Dispatch once and return the GPU time spent in the dispatch, in
    /// nanoseconds.
    #[track_caller]
    pub fn run_with_dispatch_timing(&mut self) -> Result<f64, GpuError> {
        if self.timestamp_pool == vk::QueryPool::null() {
            return Err(GpuError::TimestampsUnsupported);
        }
        self.dispatch(true)?;

        let mut timestamps = [0u64; 2];
        // SAFETY: both queries were written by the completed submission.
        self.device.check("vkGetQueryPoolResults", unsafe {
            self.device.handle().get_query_pool_results(
                self.timestamp_pool,
                0,
                &mut timestamps,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        })?;

        Ok(elapsed_ns(
            timestamps[0],
            timestamps[1],
            self.device.timestamp_valid_bits(),
            self.device.timestamp_period(),
        ))
    }

    /// Register-usage and executable statistics for the compiled kernel.
    #[track_caller]
    pub fn shader_stats(&self) -> Result<Vec<ShaderStatistics>, GpuError> {
        stats::query(self.device, self.pipeline)
    }

    /// Destroy the pipeline objects. The buffers stay alive.
    pub fn teardown(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::gpu::testing::{
        BUSY_WGSL, VECTOR_ADD_WGSL, busy_expected, specialized_kernel, test_device,
        test_device_with, wgsl_kernel,
    };
    use crate::schema::DeviceConfig;

    #[test]
    fn test_specialization_defaults() {
        let (entries, data) = specialization_data(64, &BTreeMap::new()).unwrap();
        assert_eq!(data, vec![64, 1, 1]);
        assert_eq!(entries.len(), 3);
        for (id, entry) in entries.iter().enumerate() {
            assert_eq!(entry.constant_id, id as u32);
            assert_eq!(entry.offset, id as u32 * 4);
            assert_eq!(entry.size, 4);
        }
    }

    #[test]
    fn test_specialization_sparse_memory_slots() {
        let memory = BTreeMap::from([(0, 128), (2, 512)]);
        let (entries, data) = specialization_data(32, &memory).unwrap();

        assert_eq!(data, vec![32, 1, 1, 128, 0, 512]);
        let ids: Vec<u32> = entries.iter().map(|e| e.constant_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 5]);
        assert_eq!(entries[4].offset, 20);
    }

    #[test]
    fn test_specialization_rejects_out_of_range_slots() {
        let last = MAX_WORKGROUP_MEMORY_SLOTS - 1;
        let (entries, data) = specialization_data(1, &BTreeMap::from([(last, 8)])).unwrap();
        assert_eq!(data.len(), 3 + MAX_WORKGROUP_MEMORY_SLOTS as usize);
        assert_eq!(entries.last().unwrap().offset, (3 + last) * 4);

        for slot in [MAX_WORKGROUP_MEMORY_SLOTS, 1 << 30, u32::MAX - 2, u32::MAX] {
            assert!(matches!(
                specialization_data(1, &BTreeMap::from([(0, 16), (slot, 64)])),
                Err(GpuError::WorkgroupMemorySlot { slot: s, .. }) if s == slot
            ));
        }
    }

    #[test]
    fn test_elapsed_masks_valid_bits() {
        assert_eq!(elapsed_ns(100, 350, 64, 1.0), 250.0);
        assert_eq!(elapsed_ns(10, 20, 64, 2.5), 25.0);
        // A 36-bit counter that wrapped between the two samples.
        let start = (1u64 << 36) - 5;
        assert_eq!(elapsed_ns(start, 3, 36, 1.0), 8.0);
        assert_eq!(elapsed_ns(7, 7, 32, 1.0), 0.0);
    }

    #[test]
    fn test_vector_add_end_to_end() {
        let Some(device) = test_device() else {
            return;
        };
        let kernel = wgsl_kernel(VECTOR_ADD_WGSL);

        for device_local in [false, true] {
            let a = Buffer::new(&device, 16, device_local).unwrap();
            let b = Buffer::new(&device, 16, device_local).unwrap();
            let c = Buffer::new(&device, 16, device_local).unwrap();
            a.store_slice(&[0u32, 1, 2, 3], 0).unwrap();
            b.store_slice(&[1u32, 2, 3, 4], 0).unwrap();
            c.clear().unwrap();

            let mut program = Program::new(&device, &kernel, &[&a, &b, &c]).unwrap();
            program.set_workgroups(4).set_workgroup_size(1);
            let mut program = program.initialize("main").unwrap();
            program.run().unwrap();

            let result: Vec<u32> = c.load_vec(4, 0).unwrap();
            assert_eq!(result, vec![1, 3, 5, 7], "device_local = {}", device_local);

            program.teardown();
        }
    }

    #[test]
    fn test_dispatch_is_deterministic() {
        let Some(device) = test_device() else {
            return;
        };
        let kernel = wgsl_kernel(BUSY_WGSL);
        let out = Buffer::new(&device, 4 * 64 * 4, false).unwrap();
        let mut program = Program::new(&device, &kernel, &[&out]).unwrap();
        program.set_workgroups(4);
        let mut program = program.initialize("main").unwrap();

        program.run().unwrap();
        let first: Vec<u32> = out.load_vec(256, 0).unwrap();
        assert_eq!(first[0], busy_expected(0));
        assert_eq!(first[255], busy_expected(255));
        for _ in 0..3 {
            out.clear().unwrap();
            program.run().unwrap();
            let again: Vec<u32> = out.load_vec(256, 0).unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_dispatch_timing_grows_with_workload() {
        let Some(device) = test_device() else {
            return;
        };
        if !device.supports_dispatch_timing() {
            eprintln!("Skipping timing test: no timestamp support");
            return;
        }
        let kernel = wgsl_kernel(BUSY_WGSL);
        let out = Buffer::new(&device, 256 * 64 * 4, true).unwrap();

        let average = |workgroups: u32| {
            let mut program = Program::new(&device, &kernel, &[&out]).unwrap();
            program.set_workgroups(workgroups);
            let mut program = program.initialize("main").unwrap();
            program.run().unwrap();
            let runs = 10;
            let mut total = 0.0;
            for _ in 0..runs {
                let elapsed = program.run_with_dispatch_timing().unwrap();
                assert!(elapsed >= 0.0);
                total += elapsed;
            }
            total / runs as f64
        };

        let small = average(1);
        let large = average(256);
        assert!(
            large >= small,
            "256 workgroups averaged {} ns, 1 workgroup {} ns",
            large,
            small
        );
    }

    #[test]
    fn test_kernel_sees_workgroup_size_and_memory_length() {
        let Some(device) = test_device() else {
            return;
        };
        let kernel = specialized_kernel();
        let out = Buffer::new(&device, 8 * 4, false).unwrap();

        let run = |workgroups: u32, size: u32, memory: Option<u32>| -> Vec<u32> {
            out.clear().unwrap();
            let mut program = Program::new(&device, &kernel, &[&out]).unwrap();
            program.set_workgroups(workgroups).set_workgroup_size(size);
            if let Some(length) = memory {
                program.set_workgroup_memory_length(0, length);
            }
            let mut program = program.initialize("main").unwrap();
            program.run().unwrap();
            out.load_vec(8, 0).unwrap()
        };

        // Unset slot 0 keeps the kernel's default array length of 1.
        let packed = (4 << 16) | 1;
        assert_eq!(run(1, 4, None), vec![packed, packed, packed, packed, 0, 0, 0, 0]);

        let packed = (2 << 16) | 7;
        assert_eq!(run(1, 2, Some(7)), vec![packed, packed, 0, 0, 0, 0, 0, 0]);

        let packed = (3 << 16) | 32;
        assert_eq!(run(2, 3, Some(32)), [vec![packed; 6], vec![0; 2]].concat());
    }

    #[test]
    fn test_timed_out_dispatch_refuses_reuse_until_finished() {
        let Some(device) = test_device_with(DeviceConfig {
            fence_timeout_ns: 0,
            ..DeviceConfig::default()
        }) else {
            return;
        };
        let kernel = wgsl_kernel(BUSY_WGSL);
        let workgroups = 1024;
        let out = Buffer::new(&device, u64::from(workgroups) * 64 * 4, false).unwrap();
        let mut program = Program::new(&device, &kernel, &[&out]).unwrap();
        program.set_workgroups(workgroups);
        let mut program = program.initialize("main").unwrap();

        match program.run() {
            Ok(()) => {
                eprintln!("Skipping timeout test: dispatch finished within a zero timeout");
                return;
            }
            Err(GpuError::FenceTimeout { timeout_ns }) => assert_eq!(timeout_ns, 0),
            Err(e) => panic!("unexpected error: {}", e),
        }
        assert!(program.is_pending());

        // Either the first submission is still running, or it finished and a
        // second one was submitted in its place.
        match program.run() {
            Ok(()) | Err(GpuError::DispatchPending) | Err(GpuError::FenceTimeout { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }

        program.wait().unwrap();
        assert!(!program.is_pending());
        let words: Vec<u32> = out.load_vec(64 * workgroups as usize, 0).unwrap();
        assert_eq!(words[0], busy_expected(0));
        assert_eq!(words[words.len() - 1], busy_expected(words.len() as u32 - 1));
        program.wait().unwrap();
    }

    #[test]
    fn test_drop_waits_for_timed_out_dispatch() {
        let Some(device) = test_device_with(DeviceConfig {
            fence_timeout_ns: 0,
            ..DeviceConfig::default()
        }) else {
            return;
        };
        let kernel = wgsl_kernel(BUSY_WGSL);
        let out = Buffer::new(&device, 1024 * 64 * 4, false).unwrap();
        let mut program = Program::new(&device, &kernel, &[&out]).unwrap();
        program.set_workgroups(1024);
        let mut program = program.initialize("main").unwrap();

        let timed_out = matches!(program.run(), Err(GpuError::FenceTimeout { .. }));
        assert_eq!(program.is_pending(), timed_out);
        program.teardown();

        // The dispatch completed before teardown returned.
        let words: Vec<u32> = out.load_vec(4, 1023 * 64 * 4).unwrap();
        assert_eq!(words[3], busy_expected(1023 * 64 + 3));
    }

    #[test]
    fn test_bufferless_kernel_runs() {
        let Some(device) = test_device() else {
            return;
        };
        let kernel = wgsl_kernel("@compute @workgroup_size(1) fn main() {}");
        let program = Program::new(&device, &kernel, &[]).unwrap();
        let mut program = program.initialize("main").unwrap();
        program.run().unwrap();
        assert!(program.buffers().is_empty());
    }

    #[test]
    fn test_program_from_file_and_stats() {
        let Some(device) = test_device() else {
            return;
        };
        let kernel = wgsl_kernel(VECTOR_ADD_WGSL);
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), bytemuck::cast_slice::<u32, u8>(kernel.words())).unwrap();

        let buffers: Vec<Buffer> = (0..3).map(|_| Buffer::new(&device, 16, false).unwrap()).collect();
        let refs: Vec<&Buffer> = buffers.iter().collect();
        let mut program = Program::from_file(&device, file.path(), &refs).unwrap();
        program.set_workgroup_memory_length(0, 64);
        let program = program.initialize("main").unwrap();

        let stats = program.shader_stats().unwrap();
        if !device.supports_shader_info() && !device.supports_executable_statistics() {
            assert!(stats.is_empty());
        }
    }

    #[test]
    fn test_invalid_entry_point_rejected() {
        let Some(device) = test_device() else {
            return;
        };
        let kernel = wgsl_kernel(VECTOR_ADD_WGSL);
        let program = Program::new(&device, &kernel, &[]).unwrap();
        assert!(matches!(
            program.initialize("ma\0in"),
            Err(GpuError::InvalidEntryPoint(_))
        ));
    }

    #[test]
    fn test_missing_kernel_file() {
        let Some(device) = test_device() else {
            return;
        };
        let result = Program::from_file(&device, "/nonexistent/kernel.spv", &[]);
        assert!(matches!(result, Err(GpuError::Kernel(_))));
    }
}
