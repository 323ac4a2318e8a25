//! Noise schedules and schedulers for depth-conditioned latent diffusion
//!
//! - [`NoiseSchedule`] - training-time ᾱₜ table (linear / scaled linear betas)
//! - [`Scheduler`] - the interface a denoising loop drives
//! - [`DeisMultistepScheduler`] - multistep exponential integrator (default for depth2img)
//! - [`DdimScheduler`] - deterministic DDIM
//!
//! ```ignore
//! use burn_depth2img_samplers::{DeisConfig, DeisMultistepScheduler, Scheduler};
//!
//! let mut scheduler = DeisMultistepScheduler::<B>::new(DeisConfig::default())?;
//! scheduler.set_timesteps(50)?;
//! for t in scheduler.timesteps().to_vec() {
//!     latent = scheduler.step(noise_pred, t, latent)?;
//! }
//! ```

pub mod ddim;
pub mod deis;
pub mod guidance;
pub mod scheduler;

pub use ddim::{DdimConfig, DdimScheduler};
pub use deis::{DeisConfig, DeisMultistepScheduler};
pub use guidance::apply_guidance;
pub use scheduler::{
    BetaSchedule, NoiseSchedule, PredictionType, Scheduler, SchedulerError, to_epsilon, to_sample,
};
