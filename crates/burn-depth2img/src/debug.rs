//! Tensor diagnostics for the pipeline stages

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Depth2ImgError, Result};

/// Debug flags for pipeline and scheduler diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Log tensor statistics (min/max/mean/std) after each stage
    pub stats: bool,
    /// Fail with [`Depth2ImgError::NonFinite`] when NaN/Inf shows up
    pub nan: bool,
}

/// Copy a tensor to host memory as `f32`
pub(crate) fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Depth2ImgError::TensorData(format!("{:?}", e)))
}

/// Summarise a tensor as `min, max, mean, std`, flagging NaN/Inf counts
pub fn tensor_stats<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> String {
    let floats = match tensor_to_vec(tensor.clone()) {
        Ok(floats) => floats,
        Err(e) => return e.to_string(),
    };

    if floats.is_empty() {
        return "empty".to_string();
    }

    let nan_count = floats.iter().filter(|x| x.is_nan()).count();
    let inf_count = floats.iter().filter(|x| x.is_infinite()).count();
    let min = floats.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = floats.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mean = floats.iter().sum::<f32>() / floats.len() as f32;
    let var = floats.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / floats.len() as f32;
    let std = var.sqrt();

    if nan_count > 0 || inf_count > 0 {
        format!(
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4} [NaN={}, Inf={}]",
            min, max, mean, std, nan_count, inf_count
        )
    } else {
        format!(
            "min={:.4}, max={:.4}, mean={:.4}, std={:.4}",
            min, max, mean, std
        )
    }
}

/// Check a tensor for NaN/Inf values when `enabled`
pub(crate) fn check_tensor<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    name: &str,
    enabled: bool,
) -> Result<()> {
    if !enabled {
        return Ok(());
    }

    let floats = tensor_to_vec(tensor.clone())?;
    let nan = floats.iter().filter(|x| x.is_nan()).count();
    let inf = floats.iter().filter(|x| x.is_infinite()).count();

    if nan > 0 || inf > 0 {
        return Err(Depth2ImgError::NonFinite {
            name: name.to_string(),
            nan,
            inf,
            total: floats.len(),
        });
    }
    Ok(())
}

/// Log stats for a stage output when `debug.stats` is set, then run the NaN check
pub(crate) fn inspect<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    name: &str,
    debug: &DebugConfig,
) -> Result<()> {
    if debug.stats {
        tracing::debug!(stage = name, dims = ?tensor.dims(), stats = %tensor_stats(tensor));
    }
    check_tensor(tensor, name, debug.nan)
}
