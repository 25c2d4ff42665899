//! compute-harness - Synchronous Vulkan compute for test harnesses.
//!
//! This crate wraps the pieces of Vulkan a compute test harness needs:
//! device enumeration, buffers with staged transfers, and programs that
//! dispatch a kernel once and wait for it. Every operation blocks until the
//! GPU has finished, which keeps results deterministic.
//!
//! # Architecture
//!
//! The crate is split into two main modules:
//!
//! - `schema`: Configuration types for instances, devices and jobs
//! - `compute`: Kernels, memory-type selection, GPU objects and the job runner
//!
//! # Example
//!
//! ```rust,no_run
//! use compute_harness::{
//!     compute::{
//!         KernelBinary,
//!         gpu::{Buffer, Instance, Program},
//!     },
//!     schema::{DeviceConfig, InstanceConfig},
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let instance = Instance::new(InstanceConfig::default())?;
//! let device = instance.device(0, DeviceConfig::default())?;
//!
//! let a = Buffer::new(&device, 16, false)?;
//! let b = Buffer::new(&device, 16, false)?;
//! let c = Buffer::new(&device, 16, true)?;
//! a.store_slice(&[0u32, 1, 2, 3], 0)?;
//! b.store_slice(&[1u32, 2, 3, 4], 0)?;
//! c.clear()?;
//!
//! let kernel = KernelBinary::from_file("vect-add.spv")?;
//! let mut program = Program::new(&device, &kernel, &[&a, &b, &c])?;
//! program.set_workgroups(4).set_workgroup_size(1);
//! let mut program = program.initialize("main")?;
//! program.run()?;
//!
//! let sum: Vec<u32> = c.load_vec(4, 0)?;
//! assert_eq!(sum, vec![1, 3, 5, 7]);
//! # Ok(())
//! # }
//! ```

pub mod compute;
pub mod schema;

// Re-export commonly used types
pub use compute::gpu::{Buffer, Device, GpuError, InitializedProgram, Instance, Program};
pub use compute::{JobReport, KernelBinary, run_job};
pub use schema::{DeviceConfig, InstanceConfig, JobConfig};
