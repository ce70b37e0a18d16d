//! Compute device selection

use candle_core::{DType, Device};
use tracing::info;

use crate::error::Result;

/// Pick the best available device and the matching weight precision.
///
/// Accelerators run at reduced precision (F16); the CPU fallback keeps F32
/// because half-precision matmuls are not worth it there.
pub fn select() -> Result<(Device, DType)> {
    if candle_core::utils::cuda_is_available() {
        let device = Device::new_cuda(0)?;
        info!("using CUDA device 0 at F16");
        return Ok((device, DType::F16));
    }
    if candle_core::utils::metal_is_available() {
        let device = Device::new_metal(0)?;
        info!("using Metal device 0 at F16");
        return Ok((device, DType::F16));
    }
    info!("no accelerator available, using CPU at F32");
    Ok((Device::Cpu, DType::F32))
}

/// CPU device with full precision, used by tests and as an explicit override.
pub fn cpu() -> (Device, DType) {
    (Device::Cpu, DType::F32)
}
