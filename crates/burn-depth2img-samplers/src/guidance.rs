//! Classifier-free guidance

use burn::prelude::*;

/// Apply classifier-free guidance
///
/// Combines conditional and unconditional predictions:
/// `output = uncond + guidance_scale * (cond - uncond)`
pub fn apply_guidance<B: Backend>(
    noise_pred_uncond: Tensor<B, 4>,
    noise_pred_cond: Tensor<B, 4>,
    guidance_scale: f64,
) -> Tensor<B, 4> {
    noise_pred_uncond.clone() + (noise_pred_cond - noise_pred_uncond) * guidance_scale
}
