//! compute-harness CLI - Run compute jobs from JSON configuration.

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use compute_harness::{
    compute::{gpu::device_type_name, gpu::Instance, run_job},
    schema::{DeviceConfig, InstanceConfig, JobConfig},
};

fn print_usage(program: &str) {
    eprintln!("Usage: {} <job.json> [--json] [--validation]", program);
    eprintln!("       {} --list", program);
    eprintln!("       {} --example", program);
    eprintln!();
    eprintln!("Run a compute kernel on a Vulkan device from a JSON job description.");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  job.json      Path to job configuration file");
    eprintln!("  --json        Print the report as JSON");
    eprintln!("  --validation  Enable the Vulkan validation layer");
    eprintln!("  --list        List available devices");
    eprintln!("  --example     Print an example job configuration");
}

fn main() {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    let instance_config = InstanceConfig {
        enable_validation_layers: args.iter().any(|a| a == "--validation"),
    };

    match args[1].as_str() {
        "--example" => {
            print_example_config();
            return;
        }
        "--list" => {
            list_devices(instance_config);
            return;
        }
        "--help" | "-h" => {
            print_usage(&args[0]);
            return;
        }
        _ => {}
    }

    let json_output = args.iter().any(|a| a == "--json");
    let config_path = PathBuf::from(&args[1]);

    // Load configuration
    let config_str = fs::read_to_string(&config_path).unwrap_or_else(|e| {
        eprintln!("Error reading job file: {}", e);
        std::process::exit(1);
    });

    let mut job: JobConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error parsing job: {}", e);
        std::process::exit(1);
    });

    // Kernel paths are relative to the job file.
    if job.kernel.is_relative()
        && let Some(dir) = config_path.parent()
    {
        job.kernel = dir.join(&job.kernel);
    }

    let instance = Instance::new(instance_config).unwrap_or_else(|e| {
        eprintln!("Error creating Vulkan instance: {}", e);
        std::process::exit(1);
    });
    let device = instance
        .device(job.device, DeviceConfig {
            log_device_info: true,
            ..DeviceConfig::default()
        })
        .unwrap_or_else(|e| {
            eprintln!("Error opening device {}: {}", job.device, e);
            std::process::exit(1);
        });

    if !json_output {
        println!("Compute Harness");
        println!("===============");
        println!("Device: {}", device.name());
        println!("Kernel: {}", job.kernel.display());
        println!(
            "Dispatch: {} workgroups x {} invocations, {} iteration(s)",
            job.workgroups, job.workgroup_size, job.iterations
        );
        println!("Buffers: {}", job.buffers.len());
        println!();
    }

    let start = Instant::now();
    let report = run_job(&device, &job).unwrap_or_else(|e| {
        eprintln!("Job failed: {}", e);
        std::process::exit(1);
    });
    let elapsed = start.elapsed();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report).unwrap());
        return;
    }

    for output in &report.outputs {
        println!("Buffer {}: {:?}", output.index, output.words);
    }
    if let Some(mean) = report.mean_dispatch_ns() {
        println!();
        println!("Dispatch time: {:.0} ns mean over {} run(s)", mean, report.dispatch_ns.len());
    }
    if !report.shader_stats.is_empty() {
        println!();
        println!("Shader statistics:");
        for stat in &report.shader_stats {
            println!("  {}: {} ({})", stat.name, stat.value, stat.description);
        }
    }
    println!();
    println!("Time: {:.3}s", elapsed.as_secs_f32());
}

fn list_devices(config: InstanceConfig) {
    let instance = Instance::new(config).unwrap_or_else(|e| {
        eprintln!("Error creating Vulkan instance: {}", e);
        std::process::exit(1);
    });
    let devices = instance.describe_devices().unwrap_or_else(|e| {
        eprintln!("Error enumerating devices: {}", e);
        std::process::exit(1);
    });

    if devices.is_empty() {
        println!("No Vulkan devices found");
    }
    for (index, (name, device_type)) in devices.iter().enumerate() {
        println!("{}: {} ({})", index, name, device_type_name(*device_type));
    }
}

fn print_example_config() {
    let job = JobConfig::default();

    println!("Example job (job.json):");
    println!("{}", serde_json::to_string_pretty(&job).unwrap());
}
