//! Scheduler setup for partial (image-to-image) denoising

use burn::prelude::*;
use burn::tensor::Distribution;
use burn_depth2img_samplers::Scheduler;

use crate::error::{Depth2ImgError, Result};

pub const DEFAULT_MAX_STEPS: usize = 50;
pub const DEFAULT_NOISE_STRENGTH: f64 = 1.0;

/// Number of leading timesteps to drop for a given strength
///
/// `max_steps - min(floor(max_steps * strength), max_steps)`: strength 1
/// keeps the whole schedule, strength 0 keeps none of it.
pub fn init_timestep(max_steps: usize, noise_strength: f64) -> usize {
    let kept = ((max_steps as f64 * noise_strength).floor() as usize).min(max_steps);
    max_steps - kept
}

/// Set `max_steps` timesteps on the scheduler and keep the last `strength` share
///
/// Afterwards `scheduler.timesteps()` starts at the noise level the input
/// latents should be noised to.
pub fn prepare_noise_scheduler<B, S>(
    scheduler: &mut S,
    max_steps: usize,
    noise_strength: f64,
) -> Result<()>
where
    B: Backend,
    S: Scheduler<B> + ?Sized,
{
    if max_steps == 0 {
        return Err(Depth2ImgError::InvalidArgument(
            "max_steps must be positive".to_string(),
        ));
    }
    if !noise_strength.is_finite() || noise_strength < 0.0 {
        return Err(Depth2ImgError::InvalidArgument(format!(
            "noise strength must be a finite non-negative number, got {}",
            noise_strength
        )));
    }

    scheduler.set_timesteps(max_steps)?;
    let skip = init_timestep(max_steps, noise_strength);
    scheduler.skip_timesteps(skip);

    tracing::debug!(
        max_steps,
        noise_strength,
        skipped = skip,
        remaining = scheduler.timesteps().len(),
        "prepared scheduler"
    );
    Ok(())
}

/// Noise clean latents to the scheduler's first remaining timestep with `noise`
///
/// With no remaining timesteps the latents are returned unchanged.
pub fn noise_latents_with<B, S>(
    latents: Tensor<B, 4>,
    noise: Tensor<B, 4>,
    scheduler: &S,
) -> Result<Tensor<B, 4>>
where
    B: Backend,
    S: Scheduler<B> + ?Sized,
{
    match scheduler.timesteps().first() {
        Some(&timestep) => Ok(scheduler.add_noise(latents, noise, timestep)?),
        None => Ok(latents),
    }
}

/// Noise clean latents to the scheduler's first remaining timestep
pub fn noise_latents<B, S>(latents: Tensor<B, 4>, scheduler: &S) -> Result<Tensor<B, 4>>
where
    B: Backend,
    S: Scheduler<B> + ?Sized,
{
    if scheduler.timesteps().is_empty() {
        return Ok(latents);
    }
    let noise = Tensor::random(
        latents.shape(),
        Distribution::Normal(0.0, 1.0),
        &latents.device(),
    );
    noise_latents_with(latents, noise, scheduler)
}
