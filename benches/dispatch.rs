//! Benchmarks for buffer transfers and kernel dispatch.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use compute_harness::{
    compute::{
        KernelBinary,
        gpu::{Buffer, Device, Instance, Program},
    },
    schema::{DeviceConfig, InstanceConfig},
};

const VECTOR_ADD_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read_write> a: array<u32>;
@group(0) @binding(1) var<storage, read_write> b: array<u32>;
@group(0) @binding(2) var<storage, read_write> c: array<u32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    c[id.x] = a[id.x] + b[id.x];
}
"#;

fn bench_device() -> Option<Device> {
    let instance = Instance::new(InstanceConfig::default()).ok()?;
    match instance.device(0, DeviceConfig::default()) {
        Ok(device) => Some(device),
        Err(e) => {
            eprintln!("Skipping GPU benchmark: {}", e);
            None
        }
    }
}

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

fn bench_transfers(c: &mut Criterion) {
    let Some(device) = bench_device() else {
        return;
    };
    let mut group = c.benchmark_group("store_load");

    for size in [4 * 1024, 256 * 1024, 4 * 1024 * 1024] {
        let data = vec![0xA5u8; size];
        let mut out = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64 * 2));

        for device_local in [false, true] {
            let buffer = Buffer::new(&device, size as u64, device_local).unwrap();
            let label = if device_local { "device_local" } else { "host_visible" };
            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, _| {
                b.iter(|| {
                    buffer.store(black_box(&data), 0).unwrap();
                    buffer.load(black_box(&mut out), 0).unwrap();
                });
            });
        }
    }

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let Some(device) = bench_device() else {
        return;
    };
    let kernel = compile_wgsl(VECTOR_ADD_WGSL);
    let mut group = c.benchmark_group("vector_add_dispatch");

    for elements in [64u32, 64 * 1024, 1024 * 1024] {
        let bytes = u64::from(elements) * 4;
        let a = Buffer::new(&device, bytes, true).unwrap();
        let b = Buffer::new(&device, bytes, true).unwrap();
        let out = Buffer::new(&device, bytes, true).unwrap();
        a.fill(1, 0).unwrap();
        b.fill(2, 0).unwrap();

        let mut program = Program::new(&device, &kernel, &[&a, &b, &out]).unwrap();
        program.set_workgroups(elements / 64).set_workgroup_size(64);
        let mut program = program.initialize("main").unwrap();

        group.throughput(Throughput::Elements(u64::from(elements)));
        group.bench_with_input(
            BenchmarkId::from_parameter(elements),
            &elements,
            |bench, _| {
                bench.iter(|| program.run().unwrap());
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_transfers, bench_dispatch);
criterion_main!(benches);
