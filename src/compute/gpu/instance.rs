//! Vulkan instance and physical-device enumeration.

use std::ffi::{CStr, c_char, c_void};
use std::sync::Arc;

use ash::vk;

use super::{Device, GpuError};
use crate::schema::{DeviceConfig, InstanceConfig};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const APPLICATION_NAME: &CStr = c"compute-harness";

/// Instance state shared with every device created from it.
pub(crate) struct InstanceShared {
    // Keeps the loader library mapped for the lifetime of the handles below.
    _entry: ash::Entry,
    pub(crate) handle: ash::Instance,
    debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        log::debug!("Destroying Vulkan instance");
        // SAFETY: every device holds an Arc to this state, so none remain.
        unsafe {
            if let Some((loader, messenger)) = self.debug_messenger.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.handle.destroy_instance(None);
        }
    }
}

/// Entry point to the Vulkan API: loads the driver and enumerates devices.
pub struct Instance {
    shared: Arc<InstanceShared>,
}

impl Instance {
    /// Load the Vulkan loader and create an instance.
    pub fn new(config: InstanceConfig) -> Result<Self, GpuError> {
        // SAFETY: the loaded library is kept alive in `InstanceShared`.
        let entry = unsafe { ash::Entry::load() }?;

        let validation = config.enable_validation_layers && has_validation_layer(&entry)?;
        if config.enable_validation_layers && !validation {
            log::warn!(
                "Validation requested but {:?} is not installed; continuing without it",
                VALIDATION_LAYER
            );
        }

        let mut layers: Vec<*const c_char> = Vec::new();
        let mut extensions: Vec<*const c_char> = Vec::new();
        if validation {
            layers.push(VALIDATION_LAYER.as_ptr());
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        #[allow(unused_mut)]
        let mut flags = vk::InstanceCreateFlags::empty();
        #[cfg(target_os = "macos")]
        {
            extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        // 1.0 loaders reject any newer apiVersion.
        // SAFETY: plain global query.
        let loader_version = unsafe { entry.try_enumerate_instance_version() }
            .map_err(|e| GpuError::driver("vkEnumerateInstanceVersion", e))?
            .unwrap_or(vk::API_VERSION_1_0);
        let api_version = loader_version.min(vk::API_VERSION_1_3);

        let app_info = vk::ApplicationInfo::default()
            .application_name(APPLICATION_NAME)
            .engine_name(APPLICATION_NAME)
            .api_version(api_version);
        let create_info = vk::InstanceCreateInfo::default()
            .flags(flags)
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);

        // SAFETY: create_info and everything it points to outlive the call.
        let handle = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| GpuError::driver("vkCreateInstance", e))?;
        log::debug!(
            "Created Vulkan instance (API {}.{}, validation: {})",
            vk::api_version_major(api_version),
            vk::api_version_minor(api_version),
            validation
        );

        let debug_messenger = if validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &handle);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(forward_validation_message));
            // SAFETY: the messenger is destroyed before the instance.
            match unsafe { loader.create_debug_utils_messenger(&messenger_info, None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    log::warn!("Could not install validation message callback: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            shared: Arc::new(InstanceShared {
                _entry: entry,
                handle,
                debug_messenger,
            }),
        })
    }

    /// All physical devices visible to this instance.
    pub fn physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>, GpuError> {
        // SAFETY: the instance handle is valid while `self` lives.
        unsafe { self.shared.handle.enumerate_physical_devices() }
            .map_err(|e| GpuError::driver("vkEnumeratePhysicalDevices", e))
    }

    /// Create a logical device for every physical device.
    pub fn devices(&self, config: DeviceConfig) -> Result<Vec<Device>, GpuError> {
        self.physical_devices()?
            .into_iter()
            .map(|physical_device| Device::new(&self.shared, physical_device, config.clone()))
            .collect()
    }

    /// Create a logical device for the physical device at `index`.
    pub fn device(&self, index: usize, config: DeviceConfig) -> Result<Device, GpuError> {
        let physical_devices = self.physical_devices()?;
        if physical_devices.is_empty() {
            return Err(GpuError::NoDevice);
        }
        let physical_device =
            physical_devices
                .get(index)
                .copied()
                .ok_or(GpuError::DeviceIndex {
                    index,
                    count: physical_devices.len(),
                })?;
        Device::new(&self.shared, physical_device, config)
    }

    /// Name and type of each physical device, without creating logical devices.
    pub fn describe_devices(&self) -> Result<Vec<(String, vk::PhysicalDeviceType)>, GpuError> {
        Ok(self
            .physical_devices()?
            .into_iter()
            .map(|physical_device| {
                // SAFETY: physical_device was enumerated from this instance.
                let properties = unsafe {
                    self.shared
                        .handle
                        .get_physical_device_properties(physical_device)
                };
                let name = properties
                    .device_name_as_c_str()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (name, properties.device_type)
            })
            .collect())
    }

    /// Destroy the instance. Devices created from it keep it alive until they
    /// are dropped.
    pub fn teardown(self) {
        drop(self);
    }
}

fn has_validation_layer(entry: &ash::Entry) -> Result<bool, GpuError> {
    // SAFETY: plain global query.
    let layers = unsafe { entry.enumerate_instance_layer_properties() }
        .map_err(|e| GpuError::driver("vkEnumerateInstanceLayerProperties", e))?;
    Ok(layers
        .iter()
        .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER)))
}

/// Route validation-layer messages into the `log` facade.
unsafe extern "system" fn forward_validation_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    // SAFETY: the driver passes a valid callback struct for the duration of the call.
    let message = unsafe {
        match callback_data.as_ref() {
            Some(data) if !data.p_message.is_null() => {
                CStr::from_ptr(data.p_message).to_string_lossy()
            }
            _ => return vk::FALSE,
        }
    };

    let level = if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::Level::Info
    } else {
        log::Level::Debug
    };
    log::log!(level, "[Vulkan {:?}] {}", message_type, message);

    vk::FALSE
}
