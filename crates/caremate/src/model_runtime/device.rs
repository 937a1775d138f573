//! Compute device selection.
//!
//! `auto` probes for a usable CUDA device and falls back to CPU. An explicit
//! request is honored verbatim and fails if the device is missing.

use nvml_wrapper::Nvml;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::{CareError, CareResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSelector {
    Auto,
    Cpu,
    Cuda,
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceSelector::Auto => "auto",
            DeviceSelector::Cpu => "cpu",
            DeviceSelector::Cuda => "cuda",
        };
        f.write_str(s)
    }
}

impl FromStr for DeviceSelector {
    type Err = CareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(DeviceSelector::Auto),
            "cpu" => Ok(DeviceSelector::Cpu),
            "cuda" | "gpu" => Ok(DeviceSelector::Cuda),
            other => Err(CareError::InvalidConfig(format!(
                "DEVICE must be one of auto, cpu, cuda; got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub vram_gb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResolvedDevice {
    Cpu,
    Cuda { vram_gb: u64 },
}

impl ResolvedDevice {
    pub fn is_gpu(&self) -> bool {
        matches!(self, ResolvedDevice::Cuda { .. })
    }

    /// Layers to offload to the GPU; scales with available VRAM.
    pub fn gpu_layers(&self) -> u32 {
        match self {
            ResolvedDevice::Cpu => 0,
            ResolvedDevice::Cuda { vram_gb } => match vram_gb {
                0..=4 => 12,
                5..=8 => 20,
                9..=12 => 32,
                13..=16 => 40,
                _ => 50,
            },
        }
    }
}

impl fmt::Display for ResolvedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedDevice::Cpu => f.write_str("cpu"),
            ResolvedDevice::Cuda { vram_gb } => write!(f, "cuda ({} GB)", vram_gb),
        }
    }
}

/// Queries NVML for the first CUDA device.
pub fn probe_cuda() -> Option<GpuInfo> {
    let nvml = Nvml::init().ok()?;
    if nvml.device_count().ok()? == 0 {
        return None;
    }
    let memory = nvml.device_by_index(0).ok()?.memory_info().ok()?;
    Some(GpuInfo {
        vram_gb: memory.total / 1024 / 1024 / 1024,
    })
}

impl DeviceSelector {
    pub fn resolve(self) -> CareResult<ResolvedDevice> {
        self.resolve_with(probe_cuda)
    }

    pub fn resolve_with<P>(self, probe: P) -> CareResult<ResolvedDevice>
    where
        P: FnOnce() -> Option<GpuInfo>,
    {
        match self {
            DeviceSelector::Cpu => Ok(ResolvedDevice::Cpu),
            DeviceSelector::Cuda => match probe() {
                Some(gpu) => {
                    info!("Using requested CUDA device ({} GB VRAM)", gpu.vram_gb);
                    Ok(ResolvedDevice::Cuda { vram_gb: gpu.vram_gb })
                }
                None => Err(CareError::ModelUnavailable(
                    "DEVICE=cuda was requested but no CUDA device is available".to_string(),
                )),
            },
            DeviceSelector::Auto => match probe() {
                Some(gpu) => {
                    info!("Auto-detected CUDA device ({} GB VRAM)", gpu.vram_gb);
                    Ok(ResolvedDevice::Cuda { vram_gb: gpu.vram_gb })
                }
                None => {
                    warn!("No CUDA device detected, falling back to CPU");
                    Ok(ResolvedDevice::Cpu)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selector() {
        assert_eq!("AUTO".parse::<DeviceSelector>().unwrap(), DeviceSelector::Auto);
        assert_eq!("cpu".parse::<DeviceSelector>().unwrap(), DeviceSelector::Cpu);
        assert_eq!("cuda".parse::<DeviceSelector>().unwrap(), DeviceSelector::Cuda);
        assert!("metal".parse::<DeviceSelector>().is_err());
    }

    #[test]
    fn test_auto_falls_back_to_cpu() {
        let device = DeviceSelector::Auto.resolve_with(|| None).unwrap();
        assert_eq!(device, ResolvedDevice::Cpu);
        assert_eq!(device.gpu_layers(), 0);
    }

    #[test]
    fn test_auto_prefers_gpu() {
        let device = DeviceSelector::Auto
            .resolve_with(|| Some(GpuInfo { vram_gb: 8 }))
            .unwrap();
        assert_eq!(device, ResolvedDevice::Cuda { vram_gb: 8 });
        assert_eq!(device.gpu_layers(), 20);
    }

    #[test]
    fn test_explicit_cuda_fails_fast() {
        let err = DeviceSelector::Cuda.resolve_with(|| None).unwrap_err();
        assert_eq!(err.category(), "model_unavailable");
    }

    #[test]
    fn test_explicit_cpu_never_probes() {
        let device = DeviceSelector::Cpu
            .resolve_with(|| panic!("cpu selection must not probe"))
            .unwrap();
        assert_eq!(device, ResolvedDevice::Cpu);
    }
}
