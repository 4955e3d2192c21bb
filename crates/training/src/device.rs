use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::TrainingError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// Opens the compute device the run was configured for.
///
/// `Auto` prefers Metal, then CUDA, and falls back to the CPU when an
/// accelerator reports itself available but fails to initialize. An explicit
/// accelerator request fails instead of falling back.
pub fn select_device(kind: DeviceKind) -> Result<Device, TrainingError> {
    let device = match kind {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda => Device::new_cuda(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize cuda device: {err}"))
        })?,
        DeviceKind::Metal => Device::new_metal(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize metal device: {err}"))
        })?,
        DeviceKind::Auto => {
            let cuda_available = cuda_is_available();
            let metal_available = metal_is_available();
            info!(cuda_available, metal_available, "device detection");
            if metal_available {
                Device::new_metal(0).unwrap_or_else(|err| {
                    warn!("failed to initialize metal device, falling back to CPU: {err}");
                    Device::Cpu
                })
            } else if cuda_available {
                Device::new_cuda(0).unwrap_or_else(|err| {
                    warn!("cuda reported available but initialization failed: {err}");
                    Device::Cpu
                })
            } else {
                Device::Cpu
            }
        }
    };

    info!(
        is_cuda = device.is_cuda(),
        is_metal = device.is_metal(),
        "device selected"
    );
    Ok(device)
}
