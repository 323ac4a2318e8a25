//! Noise schedules and the scheduler interface
//!
//! The [`NoiseSchedule`] holds the training-time ᾱₜ table shared by every
//! scheduler. The [`Scheduler`] trait is the seam the denoising loop drives:
//! pick timesteps, scale the model input, step the latent, add noise.

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("number of inference steps must be positive")]
    NoInferenceSteps,

    #[error("{requested} inference steps exceed {num_train_steps} training steps")]
    TooManySteps {
        requested: usize,
        num_train_steps: usize,
    },

    #[error("timestep {timestep} is outside the training range 0..{num_train_steps}")]
    TimestepOutOfRange {
        timestep: usize,
        num_train_steps: usize,
    },

    #[error("timestep {0} is not part of the current schedule")]
    UnknownTimestep(usize),

    #[error("solver order must be 1, 2 or 3, got {0}")]
    InvalidOrder(usize),
}

// ============================================================================
// Prediction Type (epsilon vs v-prediction)
// ============================================================================

/// Model prediction type
///
/// - Epsilon (noise): SD 1.x, SD 2 depth
/// - V-prediction (velocity): SD 2.x 768
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// Model predicts the noise (epsilon) added to the sample
    #[default]
    Epsilon,
    /// Model predicts the velocity v = alpha_t * epsilon - sigma_t * x0
    VPrediction,
    /// Model predicts the original sample x0
    Sample,
}

/// Convert any prediction type to predicted x0
///
/// `alpha_t` and `sigma_t` are `sqrt(ᾱₜ)` and `sqrt(1 - ᾱₜ)`.
pub fn to_sample<B: Backend>(
    model_output: Tensor<B, 4>,
    sample: Tensor<B, 4>,
    alpha_t: f64,
    sigma_t: f64,
    prediction_type: PredictionType,
) -> Tensor<B, 4> {
    match prediction_type {
        PredictionType::Epsilon => (sample - model_output * sigma_t) / alpha_t,
        PredictionType::VPrediction => sample * alpha_t - model_output * sigma_t,
        PredictionType::Sample => model_output,
    }
}

/// Convert any prediction type to epsilon
pub fn to_epsilon<B: Backend>(
    model_output: Tensor<B, 4>,
    sample: Tensor<B, 4>,
    alpha_t: f64,
    sigma_t: f64,
    prediction_type: PredictionType,
) -> Tensor<B, 4> {
    match prediction_type {
        PredictionType::Epsilon => model_output,
        PredictionType::VPrediction => model_output * alpha_t + sample * sigma_t,
        PredictionType::Sample => (sample - model_output * alpha_t) / sigma_t,
    }
}

// ============================================================================
// Beta schedules
// ============================================================================

/// Spacing of the training betas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Betas evenly spaced between start and end
    Linear,
    /// Square roots evenly spaced, then squared (Stable Diffusion)
    #[default]
    ScaledLinear,
}

/// Precomputed noise schedule values
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    /// Cumulative product of alphas: ᾱₜ
    pub alphas_cumprod: Vec<f64>,
    /// Number of training steps
    pub num_train_steps: usize,
}

impl NoiseSchedule {
    /// Build a schedule from a beta spacing
    pub fn new(schedule: BetaSchedule, num_steps: usize, beta_start: f64, beta_end: f64) -> Self {
        match schedule {
            BetaSchedule::Linear => Self::linear(num_steps, beta_start, beta_end),
            BetaSchedule::ScaledLinear => Self::scaled_linear(num_steps, beta_start, beta_end),
        }
    }

    /// Linear beta schedule
    pub fn linear(num_steps: usize, beta_start: f64, beta_end: f64) -> Self {
        let betas: Vec<f64> = linspace(beta_start, beta_end, num_steps).collect();
        Self::from_betas(&betas)
    }

    /// Scaled linear beta schedule: `linspace(sqrt(start), sqrt(end))²`
    pub fn scaled_linear(num_steps: usize, beta_start: f64, beta_end: f64) -> Self {
        let betas: Vec<f64> = linspace(beta_start.sqrt(), beta_end.sqrt(), num_steps)
            .map(|b| b * b)
            .collect();
        Self::from_betas(&betas)
    }

    fn from_betas(betas: &[f64]) -> Self {
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut cumprod = 1.0f64;
        for beta in betas {
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }

        Self {
            alphas_cumprod,
            num_train_steps: betas.len(),
        }
    }

    /// The schedule Stable Diffusion 2 (including the depth model) was trained with
    pub fn sd2x() -> Self {
        Self::scaled_linear(1000, 0.00085, 0.012)
    }

    /// Get ᾱₜ at a specific timestep
    pub fn alpha_cumprod_at(&self, t: usize) -> Result<f64, SchedulerError> {
        self.alphas_cumprod
            .get(t)
            .copied()
            .ok_or(SchedulerError::TimestepOutOfRange {
                timestep: t,
                num_train_steps: self.num_train_steps,
            })
    }

    /// Get sqrt(ᾱₜ) at timestep
    pub fn sqrt_alpha_cumprod_at(&self, t: usize) -> Result<f64, SchedulerError> {
        Ok(self.alpha_cumprod_at(t)?.sqrt())
    }

    /// Get sqrt(1 - ᾱₜ) at timestep
    pub fn sqrt_one_minus_alpha_cumprod_at(&self, t: usize) -> Result<f64, SchedulerError> {
        Ok((1.0 - self.alpha_cumprod_at(t)?).sqrt())
    }

    /// Forward diffusion: `sqrt(ᾱₜ) * x0 + sqrt(1 - ᾱₜ) * noise`
    pub fn add_noise<B: Backend>(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        t: usize,
    ) -> Result<Tensor<B, 4>, SchedulerError> {
        let sqrt_alpha = self.sqrt_alpha_cumprod_at(t)?;
        let sqrt_one_minus_alpha = self.sqrt_one_minus_alpha_cumprod_at(t)?;
        Ok(original * sqrt_alpha + noise * sqrt_one_minus_alpha)
    }
}

fn linspace(start: f64, end: f64, n: usize) -> impl Iterator<Item = f64> {
    let step = if n > 1 {
        (end - start) / (n - 1) as f64
    } else {
        0.0
    };
    (0..n).map(move |i| start + step * i as f64)
}

// ============================================================================
// Scheduler interface
// ============================================================================

/// A noise scheduler driven by a denoising loop
///
/// Timesteps are training-step indices, highest noise first.
pub trait Scheduler<B: Backend> {
    /// The training schedule this scheduler samples from
    fn noise_schedule(&self) -> &NoiseSchedule;

    /// Compute the timesteps for `num_inference_steps` steps and reset any step history
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<(), SchedulerError>;

    /// Remaining timesteps, highest noise first
    fn timesteps(&self) -> &[usize];

    /// Drop the first `skip` timesteps
    ///
    /// Used for partial denoising: the loop then starts at a lower noise level.
    fn skip_timesteps(&mut self, skip: usize);

    /// Standard deviation of the initial noise
    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    /// Scale the model input for the given timestep
    fn scale_model_input(&self, sample: Tensor<B, 4>, _timestep: usize) -> Tensor<B, 4> {
        sample
    }

    /// Advance `sample` from `timestep` to the next timestep in the schedule
    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, SchedulerError>;

    /// Noise a clean sample to the level of `timestep`
    fn add_noise(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timestep: usize,
    ) -> Result<Tensor<B, 4>, SchedulerError> {
        self.noise_schedule().add_noise(original, noise, timestep)
    }
}
