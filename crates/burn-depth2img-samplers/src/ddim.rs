//! DDIM (Denoising Diffusion Implicit Models) Scheduler
//!
//! Deterministic (eta = 0) sampling with evenly strided timesteps.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::scheduler::{
    BetaSchedule, NoiseSchedule, PredictionType, Scheduler, SchedulerError, to_epsilon, to_sample,
};

/// DDIM scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DdimConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
    /// Offset added to every inference timestep (Stable Diffusion uses 1)
    pub steps_offset: usize,
    /// Use ᾱ = 1 for the step past the last timestep, instead of ᾱ₀
    pub set_alpha_to_one: bool,
}

impl Default for DdimConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
            steps_offset: 1,
            set_alpha_to_one: false,
        }
    }
}

/// DDIM Scheduler
pub struct DdimScheduler {
    config: DdimConfig,
    schedule: NoiseSchedule,
    timesteps: Vec<usize>,
    step_ratio: usize,
    final_alpha_cumprod: f64,
}

impl DdimScheduler {
    /// Create a new DDIM scheduler
    pub fn new(config: DdimConfig) -> Self {
        let schedule = NoiseSchedule::new(
            config.beta_schedule,
            config.num_train_timesteps,
            config.beta_start,
            config.beta_end,
        );
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            schedule.alphas_cumprod.first().copied().unwrap_or(1.0)
        };

        Self {
            config,
            schedule,
            timesteps: Vec::new(),
            step_ratio: 0,
            final_alpha_cumprod,
        }
    }

    pub fn config(&self) -> &DdimConfig {
        &self.config
    }
}

impl<B: Backend> Scheduler<B> for DdimScheduler {
    fn noise_schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<(), SchedulerError> {
        let num_train_steps = self.schedule.num_train_steps;
        if num_inference_steps == 0 {
            return Err(SchedulerError::NoInferenceSteps);
        }
        if num_inference_steps > num_train_steps {
            return Err(SchedulerError::TooManySteps {
                requested: num_inference_steps,
                num_train_steps,
            });
        }

        self.step_ratio = num_train_steps / num_inference_steps;
        self.timesteps = (0..num_inference_steps)
            .rev()
            .map(|i| (i * self.step_ratio + self.config.steps_offset).min(num_train_steps - 1))
            .collect();
        Ok(())
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn skip_timesteps(&mut self, skip: usize) {
        let skip = skip.min(self.timesteps.len());
        self.timesteps.drain(..skip);
    }

    fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, SchedulerError> {
        if !self.timesteps.contains(&timestep) {
            return Err(SchedulerError::UnknownTimestep(timestep));
        }

        let alpha_cumprod_t = self.schedule.alpha_cumprod_at(timestep)?;
        let alpha_cumprod_prev = match timestep.checked_sub(self.step_ratio) {
            Some(prev) => self.schedule.alpha_cumprod_at(prev)?,
            None => self.final_alpha_cumprod,
        };

        let sqrt_alpha_t = alpha_cumprod_t.sqrt();
        let sqrt_one_minus_alpha_t = (1.0 - alpha_cumprod_t).sqrt();
        let prediction_type = self.config.prediction_type;

        let pred_x0 = to_sample(
            model_output.clone(),
            sample.clone(),
            sqrt_alpha_t,
            sqrt_one_minus_alpha_t,
            prediction_type,
        );
        let pred_eps = to_epsilon(
            model_output,
            sample,
            sqrt_alpha_t,
            sqrt_one_minus_alpha_t,
            prediction_type,
        );

        // eta = 0: no variance term
        Ok(pred_x0 * alpha_cumprod_prev.sqrt() + pred_eps * (1.0 - alpha_cumprod_prev).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_ddim_config_default() {
        let config = DdimConfig::default();
        assert_eq!(config.num_train_timesteps, 1000);
        assert_eq!(config.steps_offset, 1);
    }

    #[test]
    fn test_ddim_timesteps() {
        let mut scheduler = DdimScheduler::new(DdimConfig::default());
        Scheduler::<TestBackend>::set_timesteps(&mut scheduler, 50).unwrap();
        let timesteps = Scheduler::<TestBackend>::timesteps(&scheduler);
        assert_eq!(timesteps.len(), 50);
        assert_eq!(timesteps[0], 981);
        assert_eq!(timesteps[49], 1);
    }

    #[test]
    fn test_ddim_step_with_true_noise() {
        let device = Default::default();
        let mut scheduler = DdimScheduler::new(DdimConfig::default());
        Scheduler::<TestBackend>::set_timesteps(&mut scheduler, 10).unwrap();

        let x0 = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device) * 0.25;
        let eps = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device);
        let t = Scheduler::<TestBackend>::timesteps(&scheduler)[0];
        let next = Scheduler::<TestBackend>::timesteps(&scheduler)[1];

        let sample = scheduler.add_noise(x0.clone(), eps.clone(), t).unwrap();
        let stepped = scheduler.step(eps.clone(), t, sample).unwrap();
        let expected = scheduler.add_noise(x0, eps, next).unwrap();

        let diff: f32 = (stepped - expected).abs().max().into_scalar().elem();
        assert!(diff < 1e-4, "diff = {}", diff);
    }
}
