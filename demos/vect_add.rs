//! Vector addition on the first Vulkan device.
//!
//! Run with: cargo run --example vect_add

use compute_harness::{
    compute::{
        KernelBinary,
        gpu::{Buffer, Instance, Program},
    },
    schema::{DeviceConfig, InstanceConfig},
};

const SIZE: u32 = 4;

const VECTOR_ADD_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read_write> a: array<u32>;
@group(0) @binding(1) var<storage, read_write> b: array<u32>;
@group(0) @binding(2) var<storage, read_write> c: array<u32>;

@compute @workgroup_size(1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    c[id.x] = a[id.x] + b[id.x];
}
"#;

fn compile_wgsl(source: &str) -> KernelBinary {
    let module = naga::front::wgsl::parse_str(source).unwrap();
    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .unwrap();
    let words =
        naga::back::spv::write_vec(&module, &info, &naga::back::spv::Options::default(), None)
            .unwrap();
    KernelBinary::from_words(words).unwrap()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("=== Vector Addition ===\n");

    let instance = Instance::new(InstanceConfig {
        enable_validation_layers: cfg!(debug_assertions),
    })?;
    let device = instance.device(0, DeviceConfig {
        log_device_info: true,
        ..Default::default()
    })?;
    println!("Device:  {}", device.name());

    let bytes = u64::from(SIZE) * 4;
    let a = Buffer::new(&device, bytes, false)?;
    let b = Buffer::new(&device, bytes, false)?;
    let c = Buffer::new(&device, bytes, true)?;

    let lhs: Vec<u32> = (0..SIZE).collect();
    let rhs: Vec<u32> = (1..=SIZE).collect();
    a.store_slice(&lhs, 0)?;
    b.store_slice(&rhs, 0)?;
    c.clear()?;

    let kernel = compile_wgsl(VECTOR_ADD_WGSL);
    let mut program = Program::new(&device, &kernel, &[&a, &b, &c])?;
    program.set_workgroups(SIZE).set_workgroup_size(1);
    let mut program = program.initialize("main")?;

    if device.supports_dispatch_timing() {
        let elapsed = program.run_with_dispatch_timing()?;
        println!("Dispatch: {:.0} ns", elapsed);
    } else {
        program.run()?;
    }

    let sum: Vec<u32> = c.load_vec(SIZE as usize, 0)?;
    println!("a:       {:?}", lhs);
    println!("b:       {:?}", rhs);
    println!("a + b:   {:?}", sum);

    for (i, value) in sum.iter().enumerate() {
        assert_eq!(*value, lhs[i] + rhs[i], "mismatch at index {}", i);
    }
    println!("\nAll {} elements correct", SIZE);

    for stat in program.shader_stats()? {
        println!("  {}: {}", stat.name, stat.value);
    }

    program.teardown();
    c.teardown();
    b.teardown();
    a.teardown();
    device.teardown();
    instance.teardown();
    Ok(())
}
