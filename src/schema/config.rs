//! Configuration types for instances, devices and harness jobs.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::BufferInit;
use crate::compute::gpu::MAX_WORKGROUP_MEMORY_SLOTS;

fn default_entry_point() -> String {
    "main".to_string()
}

fn default_one() -> u32 {
    1
}

fn default_fence_timeout() -> u64 {
    u64::MAX
}

/// Vulkan instance options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Enable `VK_LAYER_KHRONOS_validation` and route its messages to the log.
    #[serde(default)]
    pub enable_validation_layers: bool,
}

/// What to do when a driver call reports anything but success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log and return `GpuError::Driver` to the caller.
    #[default]
    Propagate,
    /// Log and terminate the process.
    Abort,
}

/// Logical device options, fixed at device construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Log the device's name, type, API version and limits when it is created.
    #[serde(default)]
    pub log_device_info: bool,
    /// Behaviour on driver-call failure.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Fence wait timeout for dispatches, in nanoseconds.
    #[serde(default = "default_fence_timeout")]
    pub fence_timeout_ns: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            log_device_info: false,
            failure_policy: FailurePolicy::Propagate,
            fence_timeout_ns: default_fence_timeout(),
        }
    }
}

/// One buffer of a harness job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Size in bytes.
    pub size: u64,
    /// Allocate in device-local memory (transfers go through staging).
    #[serde(default)]
    pub device_local: bool,
    /// Initial contents.
    #[serde(default)]
    pub init: BufferInit,
}

/// A complete harness job: buffers, kernel and dispatch shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Index into the instance's device list.
    #[serde(default)]
    pub device: usize,
    /// Path to the compiled kernel binary.
    pub kernel: PathBuf,
    /// Kernel entry point.
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    /// Number of workgroups in X.
    pub workgroups: u32,
    /// Invocations per workgroup (specialization constant 0).
    #[serde(default = "default_one")]
    pub workgroup_size: u32,
    /// Workgroup-local memory lengths keyed by slot index.
    #[serde(default)]
    pub workgroup_memory: BTreeMap<u32, u32>,
    /// Buffers in binding order.
    pub buffers: Vec<BufferConfig>,
    /// Number of dispatches to run.
    #[serde(default = "default_one")]
    pub iterations: u32,
    /// Record GPU timestamps around each dispatch.
    #[serde(default)]
    pub timed: bool,
    /// Buffers to read back after the last dispatch (all when empty).
    #[serde(default)]
    pub outputs: Vec<usize>,
}

impl Default for JobConfig {
    fn default() -> Self {
        let vector = |init| BufferConfig {
            size: 16,
            device_local: false,
            init,
        };
        Self {
            device: 0,
            kernel: PathBuf::from("vect-add.spv"),
            entry_point: default_entry_point(),
            workgroups: 4,
            workgroup_size: 1,
            workgroup_memory: BTreeMap::new(),
            buffers: vec![
                vector(BufferInit::Sequence { start: 0, step: 1 }),
                vector(BufferInit::Sequence { start: 1, step: 1 }),
                vector(BufferInit::Zero),
            ],
            iterations: 1,
            timed: false,
            outputs: vec![2],
        }
    }
}

impl JobConfig {
    /// Buffer indices to read back after the run.
    pub fn output_indices(&self) -> Vec<usize> {
        if self.outputs.is_empty() {
            (0..self.buffers.len()).collect()
        } else {
            self.outputs.clone()
        }
    }

    /// Validate job parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workgroups == 0 || self.workgroup_size == 0 {
            return Err(ConfigError::InvalidDispatch);
        }
        if self.iterations == 0 {
            return Err(ConfigError::InvalidIterations);
        }
        if self.buffers.is_empty() {
            return Err(ConfigError::NoBuffers);
        }
        if self.entry_point.is_empty() || self.entry_point.contains('\0') {
            return Err(ConfigError::InvalidEntryPoint);
        }
        if let Some(&slot) = self
            .workgroup_memory
            .keys()
            .find(|&&slot| slot >= MAX_WORKGROUP_MEMORY_SLOTS)
        {
            return Err(ConfigError::InvalidMemorySlot {
                slot,
                max: MAX_WORKGROUP_MEMORY_SLOTS,
            });
        }
        for (i, buffer) in self.buffers.iter().enumerate() {
            if let Some(len) = buffer.init.byte_len() {
                if len > buffer.size {
                    return Err(ConfigError::InitTooLarge {
                        buffer: i,
                        len,
                        size: buffer.size,
                    });
                }
            }
        }
        for &output in &self.outputs {
            if output >= self.buffers.len() {
                return Err(ConfigError::InvalidOutput {
                    index: output,
                    buffers: self.buffers.len(),
                });
            }
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Workgroup count and workgroup size must be non-zero")]
    InvalidDispatch,
    #[error("Iteration count must be non-zero")]
    InvalidIterations,
    #[error("A job needs at least one buffer")]
    NoBuffers,
    #[error("Entry point must be non-empty and free of NUL bytes")]
    InvalidEntryPoint,
    #[error("Workgroup-memory slot {slot} is out of range (max {max} slots)")]
    InvalidMemorySlot { slot: u32, max: u32 },
    #[error("Buffer {buffer} initial data is {len} bytes but the buffer holds {size}")]
    InitTooLarge { buffer: usize, len: u64, size: u64 },
    #[error("Output {index} does not name one of the {buffers} buffers")]
    InvalidOutput { index: usize, buffers: usize },
}
