//! Forward core of a Llama2-style decoder on Candle.
//!
//! The workspace crates are re-exported here; [`setup_device`] picks the
//! backend a caller should build its [`RuntimeConfig`] for.

pub use attention;
pub use embedding;
pub use layers;
pub use model;

pub use model::{
    DecodeStep, GgufWeights, HyperParams, KvCache, ModelError, RuntimeConfig, TensorMapWeights,
    Transformer, TransformerBlock, WeightName, WeightSource,
};

use anyhow::Result;
use candle_core::{Device, Tensor};

/// CUDA when a device is present and passes a preflight matmul, CPU otherwise.
/// `CANDLE_FORCE_CPU` skips detection.
pub fn setup_device() -> Result<Device> {
    let force_cpu = std::env::var("CANDLE_FORCE_CPU").is_ok();
    if force_cpu {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
    }
    match model::config::select_device(force_cpu) {
        Ok(device) if device.is_cuda() => {
            if preflight(&device).is_ok() {
                log::info!("CUDA device selected: {:?}", device);
                Ok(device)
            } else {
                log::warn!("CUDA device detected but preflight failed, falling back to CPU");
                Ok(Device::Cpu)
            }
        }
        Ok(device) => {
            if !force_cpu {
                log::info!("using CPU backend");
            }
            Ok(device)
        }
        Err(err) => {
            log::warn!("device detection failed ({err}), using CPU backend");
            Ok(Device::Cpu)
        }
    }
}

fn preflight(device: &Device) -> Result<()> {
    let a = Tensor::ones((2, 4), candle_core::DType::F32, device)?;
    let b = Tensor::ones((4, 2), candle_core::DType::F32, device)?;
    let _ = a.matmul(&b)?;
    Ok(())
}
