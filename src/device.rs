//! # Compute Device Selection
//!
//! Picks the device the embedded speech runtime runs on. CUDA and Metal are
//! tried when asked for (or when auto-detecting) and CPU is the fallback, so a
//! misconfigured GPU host still serves sessions.

use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Cached auto-detected device
static BEST_DEVICE: OnceLock<Device> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// CUDA, then Metal, then CPU
    #[default]
    Auto,
    Cpu,
    /// Falls back to CPU if unavailable
    Cuda,
    /// Falls back to CPU if unavailable
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

pub struct DeviceManager;

impl DeviceManager {
    /// Resolve a preference to a concrete device.
    pub fn get_device(preference: DevicePreference) -> Device {
        match preference {
            DevicePreference::Auto => Self::get_best_device(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Self::get_cuda_device().unwrap_or_else(|| {
                warn!("CUDA requested but unavailable, speech runtime falls back to CPU");
                Device::Cpu
            }),
            DevicePreference::Metal => Self::get_metal_device().unwrap_or_else(|| {
                warn!("Metal requested but unavailable, speech runtime falls back to CPU");
                Device::Cpu
            }),
        }
    }

    pub fn get_best_device() -> Device {
        BEST_DEVICE.get_or_init(Self::detect_best_device).clone()
    }

    fn detect_best_device() -> Device {
        info!("Detecting compute device for the speech runtime...");

        if let Some(cuda_device) = Self::get_cuda_device() {
            info!("Selected CUDA GPU");
            return cuda_device;
        }

        if let Some(metal_device) = Self::get_metal_device() {
            info!("Selected Metal GPU");
            return metal_device;
        }

        info!("No GPU available, using CPU");
        Device::Cpu
    }

    fn get_cuda_device() -> Option<Device> {
        match Device::new_cuda(0) {
            Ok(device) => {
                debug!("CUDA device 0 available");
                Some(device)
            }
            Err(e) => {
                debug!("CUDA not available: {}", e);
                None
            }
        }
    }

    fn get_metal_device() -> Option<Device> {
        match Device::new_metal(0) {
            Ok(device) => {
                debug!("Metal device 0 available");
                Some(device)
            }
            Err(e) => {
                debug!("Metal not available: {}", e);
                None
            }
        }
    }

    /// Short device label for logs and the status endpoint.
    pub fn get_device_info(device: &Device) -> String {
        match device {
            Device::Cpu => "cpu".to_string(),
            Device::Cuda(_) => "cuda".to_string(),
            Device::Metal(_) => "metal".to_string(),
        }
    }
}
