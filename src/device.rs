//! # Device Selection
//!
//! Maps the configured [`DeviceKind`] onto a candle compute device. An
//! accelerator that was asked for but cannot be opened is an error here:
//! quietly running on the CPU would hide a misconfigured deployment.

use crate::engine::{DeviceKind, EngineError};
use candle_core::Device;
use tracing::{debug, info};

/// Device detection and selection utilities
pub struct DeviceManager;

impl DeviceManager {
    /// Open the device for the requested kind.
    pub fn resolve(kind: DeviceKind) -> Result<Device, EngineError> {
        match kind {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Accelerator => Self::accelerator().ok_or_else(|| {
                EngineError::UnsupportedConfiguration(
                    "accelerator requested but no CUDA or Metal device is available".to_string(),
                )
            }),
        }
    }

    /// Try CUDA first (NVIDIA GPUs), then Metal (Apple Silicon).
    fn accelerator() -> Option<Device> {
        if let Some(device) = Self::get_cuda_device() {
            info!("Selected CUDA GPU for inference");
            return Some(device);
        }
        if let Some(device) = Self::get_metal_device() {
            info!("Selected Metal GPU for inference");
            return Some(device);
        }
        None
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

    /// Get device information for logging/debugging
    pub fn describe(device: &Device) -> &'static str {
        match device {
            Device::Cpu => "CPU",
            Device::Cuda(_) => "CUDA GPU",
            Device::Metal(_) => "Metal GPU",
        }
    }
}
