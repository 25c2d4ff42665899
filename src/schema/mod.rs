//! Schema module - Configuration types for instances, devices and jobs.

mod config;
mod init;

pub use config::*;
pub use init::*;
