//! Compiled-kernel statistics.
//!
//! Two sources are consulted: the vendor register-usage query
//! (`VK_AMD_shader_info`) and the portable pipeline-executable statistics
//! (`VK_KHR_pipeline_executable_properties`). Both are informational only.

use std::ffi::{CStr, c_void};

use ash::vk;
use serde::Serialize;

use super::{Device, GpuError};

/// Value type a statistic was reported in. The discriminant is the numeric
/// tag used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum StatisticFormat {
    Bool32 = 0,
    Int64 = 1,
    UInt64 = 2,
    Float64 = 3,
}

impl StatisticFormat {
    pub fn tag(self) -> u32 {
        self as u32
    }

    fn from_vk(format: vk::PipelineExecutableStatisticFormatKHR) -> Option<Self> {
        match format {
            vk::PipelineExecutableStatisticFormatKHR::BOOL32 => Some(Self::Bool32),
            vk::PipelineExecutableStatisticFormatKHR::INT64 => Some(Self::Int64),
            vk::PipelineExecutableStatisticFormatKHR::UINT64 => Some(Self::UInt64),
            vk::PipelineExecutableStatisticFormatKHR::FLOAT64 => Some(Self::Float64),
            _ => None,
        }
    }
}

/// One statistic about a compiled kernel.
///
/// `value` holds the statistic as 64 raw bits: booleans as 0/1, signed
/// integers reinterpreted, floats truncated toward zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShaderStatistics {
    pub name: String,
    pub description: String,
    pub format: StatisticFormat,
    pub value: u64,
}

impl ShaderStatistics {
    fn unsigned(name: &str, description: &str, value: u32) -> Self {
        Self {
            name: name.to_owned(),
            description: description.to_owned(),
            format: StatisticFormat::UInt64,
            value: u64::from(value),
        }
    }

    /// The four register counts from a vendor statistics block.
    pub fn register_usage(info: &vk::ShaderStatisticsInfoAMD) -> Vec<Self> {
        vec![
            Self::unsigned(
                "Physical Vgprs",
                "Physical vector general purpose registers",
                info.num_physical_vgprs,
            ),
            Self::unsigned(
                "Physical Sgprs",
                "Physical scalar general purpose registers",
                info.num_physical_sgprs,
            ),
            Self::unsigned(
                "Compiler Vgprs",
                "Compiler vector general purpose registers",
                info.num_available_vgprs,
            ),
            Self::unsigned(
                "Compiler Sgprs",
                "Compiler scalar general purpose registers",
                info.num_available_sgprs,
            ),
        ]
    }

    /// Convert a portable statistic's typed value. Unknown formats yield `None`.
    pub fn from_raw(
        name: &str,
        description: &str,
        format: vk::PipelineExecutableStatisticFormatKHR,
        value: vk::PipelineExecutableStatisticValueKHR,
    ) -> Option<Self> {
        let format = StatisticFormat::from_vk(format)?;
        // SAFETY: the format names the active union member.
        let value = unsafe {
            match format {
                StatisticFormat::Bool32 => u64::from(value.b32),
                StatisticFormat::Int64 => value.i64 as u64,
                StatisticFormat::UInt64 => value.u64,
                StatisticFormat::Float64 => value.f64 as u64,
            }
        };
        Some(Self {
            name: name.to_owned(),
            description: description.to_owned(),
            format,
            value,
        })
    }

    fn from_executable_statistic(statistic: &vk::PipelineExecutableStatisticKHR<'_>) -> Option<Self> {
        Self::from_raw(
            &c_text(statistic.name_as_c_str()),
            &c_text(statistic.description_as_c_str()),
            statistic.format,
            statistic.value,
        )
    }
}

fn c_text(text: Result<&CStr, std::ffi::FromBytesUntilNulError>) -> String {
    text.map(|text| text.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Gather every statistic the device can report for `pipeline`.
#[track_caller]
pub(crate) fn query(device: &Device, pipeline: vk::Pipeline) -> Result<Vec<ShaderStatistics>, GpuError> {
    let mut stats = Vec::new();

    if let Some(loader) = device.shader_info_loader() {
        let mut info = vk::ShaderStatisticsInfoAMD::default();
        let mut info_size = std::mem::size_of::<vk::ShaderStatisticsInfoAMD>();
        // SAFETY: info is a writable block of info_size bytes.
        let result = unsafe {
            (loader.fp().get_shader_info_amd)(
                device.handle().handle(),
                pipeline,
                vk::ShaderStageFlags::COMPUTE,
                vk::ShaderInfoTypeAMD::STATISTICS,
                &mut info_size,
                (&mut info as *mut vk::ShaderStatisticsInfoAMD).cast::<c_void>(),
            )
        };
        device.check("vkGetShaderInfoAMD", result.result())?;
        stats.extend(ShaderStatistics::register_usage(&info));
    }

    if let Some(loader) = device.executable_properties_loader() {
        // Compute pipelines have a single executable.
        let executable = vk::PipelineExecutableInfoKHR::default()
            .pipeline(pipeline)
            .executable_index(0);
        // SAFETY: pipeline was created with statistics capture on this device.
        let statistics = device.check("vkGetPipelineExecutableStatisticsKHR", unsafe {
            loader.get_pipeline_executable_statistics(&executable)
        })?;
        stats.extend(
            statistics
                .iter()
                .filter_map(ShaderStatistics::from_executable_statistic),
        );
    }

    log::debug!("{}: collected {} shader statistics", device.name(), stats.len());
    Ok(stats)
}
