//! Logical device bound to a single compute queue.

use std::ffi::{CStr, c_char};
use std::panic::Location;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::prelude::VkResult;
use ash::vk;

use super::GpuError;
use super::instance::InstanceShared;
use crate::compute::memory::{MemoryTypeError, select_memory_type};
use crate::schema::{DeviceConfig, FailurePolicy};

/// A logical Vulkan device with one compute queue.
///
/// The compute queue is shared by every buffer transfer and program dispatch
/// on this device. It sits behind a mutex so submissions from different
/// threads are serialized; the protocol itself is single-shot and blocking.
pub struct Device {
    instance: Arc<InstanceShared>,
    physical_device: vk::PhysicalDevice,
    handle: ash::Device,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    name: String,
    compute_family: u32,
    timestamp_valid_bits: u32,
    compute_queue: Mutex<vk::Queue>,
    shader_info: Option<ash::amd::shader_info::Device>,
    executable_properties: Option<ash::khr::pipeline_executable_properties::Device>,
    full_subgroups: bool,
    config: DeviceConfig,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("compute_family", &self.compute_family)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::debug!("Destroying device {}", self.name);
        // SAFETY: buffers and programs borrow the device, so none remain.
        unsafe {
            let _ = self.handle.device_wait_idle();
            self.handle.destroy_device(None);
        }
    }
}

/// First queue family with at least one queue that supports compute.
fn compute_family_index(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|family| {
            family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::COMPUTE)
        })
        .map(|index| index as u32)
}

impl Device {
    pub(crate) fn new(
        instance: &Arc<InstanceShared>,
        physical_device: vk::PhysicalDevice,
        config: DeviceConfig,
    ) -> Result<Self, GpuError> {
        let raw_instance = &instance.handle;

        // SAFETY: physical_device was enumerated from this instance.
        let (properties, memory_properties, families) = unsafe {
            (
                raw_instance.get_physical_device_properties(physical_device),
                raw_instance.get_physical_device_memory_properties(physical_device),
                raw_instance.get_physical_device_queue_family_properties(physical_device),
            )
        };
        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let compute_family = compute_family_index(&families).ok_or(GpuError::NoComputeQueue)?;
        let timestamp_valid_bits = families[compute_family as usize].timestamp_valid_bits;

        // SAFETY: physical_device was enumerated from this instance.
        let extensions =
            unsafe { raw_instance.enumerate_device_extension_properties(physical_device) }
                .map_err(|e| GpuError::driver("vkEnumerateDeviceExtensionProperties", e))?;
        let has_extension = |wanted: &CStr| {
            extensions
                .iter()
                .any(|ext| ext.extension_name_as_c_str() == Ok(wanted))
        };
        let has_shader_info = has_extension(ash::amd::shader_info::NAME);
        let has_executable_properties =
            has_extension(ash::khr::pipeline_executable_properties::NAME);
        let is_1_3 = properties.api_version >= vk::API_VERSION_1_3;

        let mut executable_query = vk::PhysicalDevicePipelineExecutablePropertiesFeaturesKHR::default();
        let mut vulkan13_query = vk::PhysicalDeviceVulkan13Features::default();
        let mut base_features = {
            let mut query = vk::PhysicalDeviceFeatures2::default();
            if has_executable_properties {
                query = query.push_next(&mut executable_query);
            }
            if is_1_3 {
                query = query.push_next(&mut vulkan13_query);
            }
            // SAFETY: the chain only holds structs the device understands.
            unsafe { raw_instance.get_physical_device_features2(physical_device, &mut query) };
            query.features
        };
        base_features.robust_buffer_access = vk::FALSE;
        let executable_info =
            has_executable_properties && executable_query.pipeline_executable_info == vk::TRUE;
        let full_subgroups = is_1_3 && vulkan13_query.compute_full_subgroups == vk::TRUE;

        let mut enabled_extensions: Vec<*const c_char> = Vec::new();
        if executable_info {
            enabled_extensions.push(ash::khr::pipeline_executable_properties::NAME.as_ptr());
        }
        if has_shader_info {
            enabled_extensions.push(ash::amd::shader_info::NAME.as_ptr());
        }

        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(compute_family)
            .queue_priorities(&priorities)];
        let mut executable_enable =
            vk::PhysicalDevicePipelineExecutablePropertiesFeaturesKHR::default()
                .pipeline_executable_info(true);
        let mut vulkan13_enable =
            vk::PhysicalDeviceVulkan13Features::default().compute_full_subgroups(true);

        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&enabled_extensions)
            .enabled_features(&base_features);
        if executable_info {
            create_info = create_info.push_next(&mut executable_enable);
        }
        if full_subgroups {
            create_info = create_info.push_next(&mut vulkan13_enable);
        }

        // SAFETY: create_info and everything it points to outlive the call.
        let handle = unsafe { raw_instance.create_device(physical_device, &create_info, None) }
            .map_err(|e| GpuError::driver("vkCreateDevice", e))?;
        // SAFETY: queue 0 of compute_family was requested above.
        let compute_queue = unsafe { handle.get_device_queue(compute_family, 0) };

        let shader_info =
            has_shader_info.then(|| ash::amd::shader_info::Device::new(raw_instance, &handle));
        let executable_properties = executable_info
            .then(|| ash::khr::pipeline_executable_properties::Device::new(raw_instance, &handle));

        if config.log_device_info {
            log::info!(
                "Using device {} ({}), API {}.{}.{}, compute family {}, \
                 timestamp period {} ns, register stats: {}, executable stats: {}",
                name,
                device_type_name(properties.device_type),
                vk::api_version_major(properties.api_version),
                vk::api_version_minor(properties.api_version),
                vk::api_version_patch(properties.api_version),
                compute_family,
                properties.limits.timestamp_period,
                has_shader_info,
                executable_info,
            );
        } else {
            log::debug!("Created device {} (compute family {})", name, compute_family);
        }

        Ok(Self {
            instance: Arc::clone(instance),
            physical_device,
            handle,
            properties,
            memory_properties,
            name,
            compute_family,
            timestamp_valid_bits,
            compute_queue: Mutex::new(compute_queue),
            shader_info,
            executable_properties,
            full_subgroups,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Queue family of the compute queue. Fixed for the device's lifetime.
    pub fn compute_family(&self) -> u32 {
        self.compute_family
    }

    /// Nanoseconds per timestamp tick.
    pub fn timestamp_period(&self) -> f32 {
        self.properties.limits.timestamp_period
    }

    /// Number of meaningful bits in a compute-queue timestamp (0 = no timestamps).
    pub fn timestamp_valid_bits(&self) -> u32 {
        self.timestamp_valid_bits
    }

    pub fn supports_dispatch_timing(&self) -> bool {
        self.timestamp_valid_bits > 0
    }

    /// Whether vendor register-usage statistics are available.
    pub fn supports_shader_info(&self) -> bool {
        self.shader_info.is_some()
    }

    /// Whether portable pipeline-executable statistics are enabled.
    pub fn supports_executable_statistics(&self) -> bool {
        self.executable_properties.is_some()
    }

    /// Whether pipelines may require full subgroups.
    pub fn supports_full_subgroups(&self) -> bool {
        self.full_subgroups
    }

    /// The physical device's memory-type table.
    pub fn memory_types(&self) -> &[vk::MemoryType] {
        let count = self.memory_properties.memory_type_count as usize;
        &self.memory_properties.memory_types[..count]
    }

    /// Index of the first memory type allowed by `type_bits` that has all of
    /// `flags`.
    pub fn select_memory(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32, MemoryTypeError> {
        select_memory_type(self.memory_types(), type_bits, flags)
    }

    /// Subgroup size reported by the physical device.
    pub fn subgroup_size(&self) -> u32 {
        let mut subgroup = vk::PhysicalDeviceSubgroupProperties::default();
        let mut properties = vk::PhysicalDeviceProperties2::default().push_next(&mut subgroup);
        // SAFETY: physical_device belongs to the instance kept alive by self.
        unsafe {
            self.instance
                .handle
                .get_physical_device_properties2(self.physical_device, &mut properties)
        };
        subgroup.subgroup_size
    }

    /// Destroy the device. Every buffer and program must already be gone,
    /// which the borrow checker guarantees.
    pub fn teardown(self) {
        drop(self);
    }

    pub(crate) fn handle(&self) -> &ash::Device {
        &self.handle
    }

    pub(crate) fn shader_info_loader(&self) -> Option<&ash::amd::shader_info::Device> {
        self.shader_info.as_ref()
    }

    pub(crate) fn executable_properties_loader(
        &self,
    ) -> Option<&ash::khr::pipeline_executable_properties::Device> {
        self.executable_properties.as_ref()
    }

    /// Check a driver call's result against the device's failure policy.
    #[track_caller]
    pub(crate) fn check<T>(&self, call: &'static str, result: VkResult<T>) -> Result<T, GpuError> {
        let location = Location::caller();
        result.map_err(|code| self.driver_failure(call, code, location))
    }

    fn driver_failure(
        &self,
        call: &'static str,
        result: vk::Result,
        location: &'static Location<'static>,
    ) -> GpuError {
        log::error!(
            "{}: {} failed with {} at {}",
            self.name,
            call,
            result,
            location
        );
        if self.config.failure_policy == FailurePolicy::Abort {
            std::process::exit(1);
        }
        GpuError::Driver {
            call,
            result,
            location,
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, vk::Queue> {
        self.compute_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the device has no pending work.
    pub(crate) fn wait_idle(&self) -> Result<(), GpuError> {
        let _queue = self.lock_queue();
        // SAFETY: the only queue is held by the lock for the whole wait.
        self.check("vkDeviceWaitIdle", unsafe { self.handle.device_wait_idle() })
    }

    /// Submit one command buffer and block until the queue is idle.
    #[track_caller]
    pub(crate) fn submit_and_wait_idle(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), GpuError> {
        let queue = self.lock_queue();
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
        // SAFETY: the queue is externally synchronized by the lock.
        unsafe {
            self.check(
                "vkQueueSubmit",
                self.handle.queue_submit(*queue, &[submit], vk::Fence::null()),
            )?;
            self.check("vkQueueWaitIdle", self.handle.queue_wait_idle(*queue))
        }
    }

    /// Submit one command buffer signalling `fence`, wait for the fence, then
    /// reset it.
    #[track_caller]
    pub(crate) fn submit_and_wait_fence(
        &self,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> Result<(), GpuError> {
        let queue = self.lock_queue();
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
        let timeout_ns = self.config.fence_timeout_ns;
        // SAFETY: the queue is externally synchronized by the lock; the fence
        // is unsignalled because every wait below ends with a reset.
        unsafe {
            self.check(
                "vkQueueSubmit",
                self.handle.queue_submit(*queue, &[submit], fence),
            )?;
            match self.handle.wait_for_fences(&[fence], true, timeout_ns) {
                Err(vk::Result::TIMEOUT) => {
                    log::error!("{}: dispatch still running after {} ns", self.name, timeout_ns);
                    return Err(GpuError::FenceTimeout { timeout_ns });
                }
                result => self.check("vkWaitForFences", result)?,
            }
            self.check("vkResetFences", self.handle.reset_fences(&[fence]))
        }
    }
}

/// Human-readable name of a physical device type.
pub fn device_type_name(device_type: vk::PhysicalDeviceType) -> &'static str {
    match device_type {
        vk::PhysicalDeviceType::OTHER => "other",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated GPU",
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete GPU",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual GPU",
        vk::PhysicalDeviceType::CPU => "CPU",
        _ => "unknown",
    }
}
