//! Shared helpers for GPU tests.

use super::{Device, Instance};
use crate::compute::KernelBinary;
use crate::schema::{DeviceConfig, InstanceConfig};

/// Elementwise `c = a + b` over three u32 storage buffers.
pub(crate) const VECTOR_ADD_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read_write> a: array<u32>;
@group(0) @binding(1) var<storage, read_write> b: array<u32>;
@group(0) @binding(2) var<storage, read_write> c: array<u32>;

@compute @workgroup_size(1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    c[id.x] = a[id.x] + b[id.x];
}
"#;

/// Each invocation iterates an LCG and stores the result at its global index.
pub(crate) const BUSY_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read_write> out: array<u32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    var acc = id.x;
    for (var i = 0u; i < 512u; i++) {
        acc = acc * 1664525u + 1013904223u;
    }
    out[id.x] = acc;
}
"#;

/// Hand-assembled SPIR-V 1.0 compute kernel whose local size x is
/// specialization constant 0 and which declares a workgroup array sized by
/// specialization constant 3:
///
/// ```text
/// layout(local_size_x_id = 0) in;
/// layout(constant_id = 3) const uint LEN = 1;
/// layout(set = 0, binding = 0) buffer Out { uint data[]; };
/// shared uint scratch[LEN];
/// void main() { data[gl_GlobalInvocationID.x] = (gl_WorkGroupSize.x << 16) | LEN; }
/// ```
#[rustfmt::skip]
pub(crate) const SPECIALIZED_SPIRV: &[u32] = &[
    // Header: magic, version 1.0, generator, bound, schema.
    0x0723_0203, 0x0001_0000, 0, 30, 0,
    // OpCapability Shader
    0x00020011, 1,
    // OpMemoryModel Logical GLSL450
    0x0003000e, 0, 1,
    // OpEntryPoint GLCompute %main "main" %gid
    0x0006000f, 5, 1, 0x6e69616d, 0, 2,
    // OpExecutionMode %main LocalSize 1 1 1
    0x00060010, 1, 17, 1, 1, 1,
    // OpDecorate %gid BuiltIn GlobalInvocationId
    0x00040047, 2, 11, 28,
    // OpDecorate %wgsize BuiltIn WorkgroupSize
    0x00040047, 3, 11, 25,
    // OpDecorate %x SpecId 0
    0x00040047, 4, 1, 0,
    // OpDecorate %y SpecId 1
    0x00040047, 5, 1, 1,
    // OpDecorate %z SpecId 2
    0x00040047, 6, 1, 2,
    // OpDecorate %len SpecId 3
    0x00040047, 7, 1, 3,
    // OpDecorate %rta ArrayStride 4
    0x00040047, 8, 6, 4,
    // OpMemberDecorate %block 0 Offset 0
    0x00050048, 9, 0, 35, 0,
    // OpDecorate %block BufferBlock
    0x00030047, 9, 3,
    // OpDecorate %out DescriptorSet 0
    0x00040047, 10, 34, 0,
    // OpDecorate %out Binding 0
    0x00040047, 10, 33, 0,
    // %void = OpTypeVoid
    0x00020013, 11,
    // %fn = OpTypeFunction %void
    0x00030021, 12, 11,
    // %uint = OpTypeInt 32 0
    0x00040015, 13, 32, 0,
    // %v3uint = OpTypeVector %uint 3
    0x00040017, 14, 13, 3,
    // %p_in_v3 = OpTypePointer Input %v3uint
    0x00040020, 15, 1, 14,
    // %gid = OpVariable %p_in_v3 Input
    0x0004003b, 15, 2, 1,
    // %x = OpSpecConstant %uint 1
    0x00040032, 13, 4, 1,
    // %y = OpSpecConstant %uint 1
    0x00040032, 13, 5, 1,
    // %z = OpSpecConstant %uint 1
    0x00040032, 13, 6, 1,
    // %wgsize = OpSpecConstantComposite %v3uint %x %y %z
    0x00060033, 14, 3, 4, 5, 6,
    // %len = OpSpecConstant %uint 1
    0x00040032, 13, 7, 1,
    // %c0 = OpConstant %uint 0
    0x0004002b, 13, 16, 0,
    // %c16 = OpConstant %uint 16
    0x0004002b, 13, 17, 16,
    // %arr = OpTypeArray %uint %len
    0x0004001c, 18, 13, 7,
    // %p_wg_arr = OpTypePointer Workgroup %arr
    0x00040020, 19, 4, 18,
    // %scratch = OpVariable %p_wg_arr Workgroup
    0x0004003b, 19, 20, 4,
    // %rta = OpTypeRuntimeArray %uint
    0x0003001d, 8, 13,
    // %block = OpTypeStruct %rta
    0x0003001e, 9, 8,
    // %p_u_block = OpTypePointer Uniform %block
    0x00040020, 21, 2, 9,
    // %out = OpVariable %p_u_block Uniform
    0x0004003b, 21, 10, 2,
    // %p_u_uint = OpTypePointer Uniform %uint
    0x00040020, 22, 2, 13,
    // %p_in_uint = OpTypePointer Input %uint
    0x00040020, 23, 1, 13,
    // %main = OpFunction %void None %fn
    0x00050036, 11, 1, 0, 12,
    // %entry = OpLabel
    0x000200f8, 24,
    // %gx_ptr = OpAccessChain %p_in_uint %gid %c0
    0x00050041, 23, 25, 2, 16,
    // %gx = OpLoad %uint %gx_ptr
    0x0004003d, 13, 26, 25,
    // %shifted = OpShiftLeftLogical %uint %x %c16
    0x000500c4, 13, 27, 4, 17,
    // %value = OpBitwiseOr %uint %shifted %len
    0x000500c5, 13, 28, 27, 7,
    // %dst = OpAccessChain %p_u_uint %out %c0 %gx
    0x00060041, 22, 29, 10, 16, 26,
    // OpStore %dst %value
    0x0003003e, 29, 28,
    // OpReturn
    0x000100fd,
    // OpFunctionEnd
    0x00010038,
];

/// Load [`SPECIALIZED_SPIRV`] as a kernel.
pub(crate) fn specialized_kernel() -> KernelBinary {
    KernelBinary::from_words(SPECIALIZED_SPIRV.to_vec()).expect("empty SPIR-V module")
}

/// The value `BUSY_WGSL` stores for global invocation `index`.
pub(crate) fn busy_expected(index: u32) -> u32 {
    (0..512).fold(index, |acc, _| {
        acc.wrapping_mul(1664525).wrapping_add(1013904223)
    })
}

/// First Vulkan device, or `None` (with a note on stderr) when the machine
/// has no loader or no device.
pub(crate) fn test_device() -> Option<Device> {
    test_device_with(DeviceConfig::default())
}

/// Like [`test_device`], with a custom device configuration.
pub(crate) fn test_device_with(config: DeviceConfig) -> Option<Device> {
    let instance = match Instance::new(InstanceConfig::default()) {
        Ok(instance) => instance,
        Err(e) => {
            eprintln!("Skipping GPU test: {}", e);
            return None;
        }
    };
    match instance.device(0, config) {
        Ok(device) => Some(device),
        Err(e) => {
            eprintln!("Skipping GPU test: {}", e);
            None
        }
    }
}

/// Compile WGSL to a SPIR-V kernel.
pub(crate) fn wgsl_kernel(source: &str) -> KernelBinary {
    let module = naga::front::wgsl::parse_str(source).expect("WGSL parse failed");
    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .expect("WGSL validation failed");
    let words = naga::back::spv::write_vec(&module, &info, &naga::back::spv::Options::default(), None)
        .expect("SPIR-V emission failed");
    KernelBinary::from_words(words).expect("empty SPIR-V module")
}
