//! Compute module - GPU resources, kernels and job execution.

mod kernel;
mod memory;
mod runner;

pub mod gpu;

pub use kernel::*;
pub use memory::*;
pub use runner::*;
