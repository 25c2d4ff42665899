//! Run a [`JobConfig`] end to end on one device.

use serde::Serialize;

use super::gpu::{Buffer, Device, GpuError, Program, ShaderStatistics};
use super::{KernelBinary, KernelError};
use crate::schema::{BufferInit, ConfigError, JobConfig};

/// Error type for job execution.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Gpu(#[from] GpuError),
}

/// Contents of one buffer after the last dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferOutput {
    pub index: usize,
    pub words: Vec<u32>,
}

/// Everything a job produced.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub device: String,
    pub outputs: Vec<BufferOutput>,
    /// Per-iteration dispatch time in nanoseconds (empty unless timed).
    pub dispatch_ns: Vec<f64>,
    pub shader_stats: Vec<ShaderStatistics>,
}

impl JobReport {
    /// Mean dispatch time, if the job was timed.
    pub fn mean_dispatch_ns(&self) -> Option<f64> {
        if self.dispatch_ns.is_empty() {
            None
        } else {
            Some(self.dispatch_ns.iter().sum::<f64>() / self.dispatch_ns.len() as f64)
        }
    }
}

/// Load the job's kernel from disk and run it.
pub fn run_job(device: &Device, job: &JobConfig) -> Result<JobReport, JobError> {
    job.validate()?;
    let kernel = KernelBinary::from_file(&job.kernel)?;
    run_job_with_kernel(device, job, &kernel)
}

/// Run a job with an already-loaded kernel. `job.kernel` is ignored.
pub fn run_job_with_kernel(
    device: &Device,
    job: &JobConfig,
    kernel: &KernelBinary,
) -> Result<JobReport, JobError> {
    job.validate()?;

    let buffers = job
        .buffers
        .iter()
        .map(|config| {
            let buffer = Buffer::new(device, config.size, config.device_local)?;
            populate(&buffer, &config.init)?;
            Ok(buffer)
        })
        .collect::<Result<Vec<_>, GpuError>>()?;
    let bound: Vec<&Buffer> = buffers.iter().collect();

    let mut program = Program::new(device, kernel, &bound)?;
    program
        .set_workgroups(job.workgroups)
        .set_workgroup_size(job.workgroup_size);
    for (&slot, &length) in &job.workgroup_memory {
        program.set_workgroup_memory_length(slot, length);
    }
    let mut program = program.initialize(&job.entry_point)?;

    let mut dispatch_ns = Vec::new();
    for _ in 0..job.iterations {
        if job.timed {
            dispatch_ns.push(program.run_with_dispatch_timing()?);
        } else {
            program.run()?;
        }
    }
    log::info!(
        "Ran {} dispatch(es) of {} x {} on {}",
        job.iterations,
        job.workgroups,
        job.workgroup_size,
        device.name()
    );

    let shader_stats = program.shader_stats().unwrap_or_else(|e| {
        log::warn!("Shader statistics unavailable: {}", e);
        Vec::new()
    });
    program.teardown();

    let outputs = job
        .output_indices()
        .into_iter()
        .map(|index| {
            let buffer = &buffers[index];
            let words = buffer.load_vec((buffer.size() / 4) as usize, 0)?;
            Ok(BufferOutput { index, words })
        })
        .collect::<Result<Vec<_>, GpuError>>()?;

    Ok(JobReport {
        device: device.name().to_owned(),
        outputs,
        dispatch_ns,
        shader_stats,
    })
}

fn populate(buffer: &Buffer, init: &BufferInit) -> Result<(), GpuError> {
    match init {
        BufferInit::Zero => buffer.clear(),
        BufferInit::Fill { word } => buffer.fill(*word, 0),
        other => buffer.store_slice(&other.generate(buffer.size()), 0),
    }
}
