//! DEIS (Diffusion Exponential Integrator Sampler), multistep variant
//!
//! Exponential integrator in the log-rho (`rho = sigma / alpha`) space with
//! polynomial extrapolation over up to three previous noise predictions.
//! Timesteps and coefficients follow the diffusers `DEISMultistepScheduler`.

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::scheduler::{
    BetaSchedule, NoiseSchedule, PredictionType, Scheduler, SchedulerError, to_sample,
};

/// Below this many steps the final steps drop to lower order for stability
const LOWER_ORDER_FINAL_THRESHOLD: usize = 15;

/// Configuration for the DEIS multistep scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeisConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    /// Order of the method (1-3)
    pub solver_order: usize,
    pub prediction_type: PredictionType,
    /// Use lower-order updates on the last steps of short schedules
    pub lower_order_final: bool,
}

impl Default for DeisConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            solver_order: 2,
            prediction_type: PredictionType::Epsilon,
            lower_order_final: true,
        }
    }
}

/// DEIS multistep scheduler
pub struct DeisMultistepScheduler<B: Backend> {
    config: DeisConfig,
    schedule: NoiseSchedule,
    /// Remaining timesteps, highest noise first
    timesteps: Vec<usize>,
    /// Epsilon history, newest first
    model_outputs: VecDeque<Tensor<B, 4>>,
    /// Number of updates taken so far, capped at the solver order
    lower_order_nums: usize,
}

impl<B: Backend> DeisMultistepScheduler<B> {
    /// Create a new DEIS scheduler
    pub fn new(config: DeisConfig) -> Result<Self, SchedulerError> {
        if !(1..=3).contains(&config.solver_order) {
            return Err(SchedulerError::InvalidOrder(config.solver_order));
        }
        let schedule = NoiseSchedule::new(
            config.beta_schedule,
            config.num_train_timesteps,
            config.beta_start,
            config.beta_end,
        );

        Ok(Self {
            config,
            schedule,
            timesteps: Vec::new(),
            model_outputs: VecDeque::new(),
            lower_order_nums: 0,
        })
    }

    pub fn config(&self) -> &DeisConfig {
        &self.config
    }

    /// alpha_t = sqrt(ᾱₜ), sigma_t = sqrt(1 - ᾱₜ)
    fn alpha_sigma(&self, t: usize) -> Result<(f64, f64), SchedulerError> {
        let alpha_cumprod = self.schedule.alpha_cumprod_at(t)?;
        Ok((alpha_cumprod.sqrt(), (1.0 - alpha_cumprod).sqrt()))
    }

    /// Model output as epsilon, via the predicted x0
    fn convert_model_output(
        &self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, SchedulerError> {
        let (alpha_t, sigma_t) = self.alpha_sigma(timestep)?;
        let x0_pred = to_sample(
            model_output,
            sample.clone(),
            alpha_t,
            sigma_t,
            self.config.prediction_type,
        );
        Ok((sample - x0_pred * alpha_t) / sigma_t)
    }

    fn first_order_update(
        &self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        prev_timestep: usize,
        sample: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, SchedulerError> {
        let (alpha_t, sigma_t) = self.alpha_sigma(prev_timestep)?;
        let (alpha_s, sigma_s) = self.alpha_sigma(timestep)?;
        let lambda_t = alpha_t.ln() - sigma_t.ln();
        let lambda_s = alpha_s.ln() - sigma_s.ln();
        let h = lambda_t - lambda_s;

        Ok(sample * (alpha_t / alpha_s) - model_output * (sigma_t * h.exp_m1()))
    }

    fn second_order_update(
        &self,
        timestep_list: [usize; 2],
        prev_timestep: usize,
        sample: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, SchedulerError> {
        let [s1, s0] = timestep_list;
        let (alpha_t, sigma_t) = self.alpha_sigma(prev_timestep)?;
        let (alpha_s0, sigma_s0) = self.alpha_sigma(s0)?;
        let (alpha_s1, sigma_s1) = self.alpha_sigma(s1)?;

        let rho_t = sigma_t / alpha_t;
        let rho_s0 = sigma_s0 / alpha_s0;
        let rho_s1 = sigma_s1 / alpha_s1;

        fn ind_fn(t: f64, b: f64, c: f64) -> f64 {
            t * (-c.ln() + t.ln() - 1.0) / (b.ln() - c.ln())
        }

        let coef1 = ind_fn(rho_t, rho_s0, rho_s1) - ind_fn(rho_s0, rho_s0, rho_s1);
        let coef2 = ind_fn(rho_t, rho_s1, rho_s0) - ind_fn(rho_s0, rho_s1, rho_s0);

        let m0 = self.model_outputs[0].clone();
        let m1 = self.model_outputs[1].clone();
        Ok((sample / alpha_s0 + m0 * coef1 + m1 * coef2) * alpha_t)
    }

    fn third_order_update(
        &self,
        timestep_list: [usize; 3],
        prev_timestep: usize,
        sample: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, SchedulerError> {
        let [s2, s1, s0] = timestep_list;
        let (alpha_t, sigma_t) = self.alpha_sigma(prev_timestep)?;
        let (alpha_s0, sigma_s0) = self.alpha_sigma(s0)?;
        let (alpha_s1, sigma_s1) = self.alpha_sigma(s1)?;
        let (alpha_s2, sigma_s2) = self.alpha_sigma(s2)?;

        let rho_t = sigma_t / alpha_t;
        let rho_s0 = sigma_s0 / alpha_s0;
        let rho_s1 = sigma_s1 / alpha_s1;
        let rho_s2 = sigma_s2 / alpha_s2;

        fn ind_fn(t: f64, b: f64, c: f64, d: f64) -> f64 {
            let (lt, lb, lc, ld) = (t.ln(), b.ln(), c.ln(), d.ln());
            let numerator = t * (lc * (ld - lt + 1.0) - ld * lt + ld + lt * lt - 2.0 * lt + 2.0);
            let denominator = (lb - lc) * (lb - ld);
            numerator / denominator
        }

        let coef1 = ind_fn(rho_t, rho_s0, rho_s1, rho_s2) - ind_fn(rho_s0, rho_s0, rho_s1, rho_s2);
        let coef2 = ind_fn(rho_t, rho_s1, rho_s2, rho_s0) - ind_fn(rho_s0, rho_s1, rho_s2, rho_s0);
        let coef3 = ind_fn(rho_t, rho_s2, rho_s0, rho_s1) - ind_fn(rho_s0, rho_s2, rho_s0, rho_s1);

        let m0 = self.model_outputs[0].clone();
        let m1 = self.model_outputs[1].clone();
        let m2 = self.model_outputs[2].clone();
        Ok((sample / alpha_s0 + m0 * coef1 + m1 * coef2 + m2 * coef3) * alpha_t)
    }
}

/// `linspace(0, T - 1, n + 1)` rounded, reversed, without the final 0
///
/// Points are `i * ((T - 1) / n)` with the endpoint pinned to `T - 1`, the way
/// numpy evaluates them, so ties round the same way. Repeated timesteps
/// (more steps than distinct rounded points) are dropped, keeping order.
fn deis_timesteps(num_inference_steps: usize, num_train_steps: usize) -> Vec<usize> {
    let last = (num_train_steps - 1) as f64;
    let step = last / num_inference_steps as f64;

    let mut timesteps: Vec<usize> = (1..=num_inference_steps)
        .rev()
        .map(|i| {
            let point = if i == num_inference_steps {
                last
            } else {
                i as f64 * step
            };
            point.round_ties_even() as usize
        })
        .collect();
    timesteps.dedup();
    timesteps
}

impl<B: Backend> Scheduler<B> for DeisMultistepScheduler<B> {
    fn noise_schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<(), SchedulerError> {
        if num_inference_steps == 0 {
            return Err(SchedulerError::NoInferenceSteps);
        }
        if num_inference_steps > self.schedule.num_train_steps {
            return Err(SchedulerError::TooManySteps {
                requested: num_inference_steps,
                num_train_steps: self.schedule.num_train_steps,
            });
        }

        self.timesteps = deis_timesteps(num_inference_steps, self.schedule.num_train_steps);
        self.model_outputs.clear();
        self.lower_order_nums = 0;
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
        let step_index = self
            .timesteps
            .iter()
            .position(|&t| t == timestep)
            .ok_or(SchedulerError::UnknownTimestep(timestep))?;
        let len = self.timesteps.len();

        let prev_timestep = if step_index == len - 1 {
            0
        } else {
            self.timesteps[step_index + 1]
        };
        let short = len < LOWER_ORDER_FINAL_THRESHOLD && self.config.lower_order_final;
        let lower_order_final = step_index == len - 1 && short;
        let lower_order_second = step_index + 2 == len && short;

        let model_output = self.convert_model_output(model_output, timestep, sample.clone())?;
        self.model_outputs.push_front(model_output.clone());
        self.model_outputs.truncate(self.config.solver_order);

        let order = self.config.solver_order;
        // Higher orders need the previous timesteps of this schedule
        let history = self.lower_order_nums.min(step_index);
        let prev_sample = if order == 1 || history < 1 || lower_order_final {
            self.first_order_update(model_output, timestep, prev_timestep, sample)?
        } else if order == 2 || history < 2 || lower_order_second {
            let timestep_list = [self.timesteps[step_index - 1], timestep];
            self.second_order_update(timestep_list, prev_timestep, sample)?
        } else {
            let timestep_list = [
                self.timesteps[step_index - 2],
                self.timesteps[step_index - 1],
                timestep,
            ];
            self.third_order_update(timestep_list, prev_timestep, sample)?
        };

        if self.lower_order_nums < order {
            self.lower_order_nums += 1;
        }

        tracing::trace!(step_index, timestep, prev_timestep, "deis step");
        Ok(prev_sample)
    }
}
