//! burn-depth2img: depth-conditioned image-to-image on Burn
//!
//! Helpers for Stable Diffusion 2 depth2img built around five components
//! the caller supplies: a prompt tokenizer, a text encoder, a latent
//! autoencoder, a depth-aware U-Net and a noise scheduler.
//!
//! - [`image_to_latent`] / [`latent_to_image`]: pixels to scaled latents and back
//! - [`text_to_embedding`]: `[negative, prompt]` embeddings for guidance
//! - [`prepare_noise_scheduler`]: timesteps for a given strength
//! - [`prepare_depth_mask`]: depth map to a latent-sized mask
//! - [`denoise_depth2img`]: the guided denoising loop
//! - [`Depth2ImgPipeline`]: all of the above in one call
//!
//! # Backend Selection
//!
//! Choose a backend via feature flags:
//! - `ndarray`: CPU backend (default, no GPU required)
//! - `wgpu`: WebGPU backend (cross-platform GPU)
//! - `cuda`: Native CUDA backend (NVIDIA only)
//!
//! # Example
//!
//! ```ignore
//! use burn_depth2img::{Depth2ImgConfig, Depth2ImgPipeline, backends::DefaultBackend};
//!
//! let pipeline = Depth2ImgPipeline::<DefaultBackend, _, _, _, _>::new(tokenizer, clip, vae, unet);
//! let config = Depth2ImgConfig { strength: 0.8, ..Default::default() };
//! let mut scheduler = config.scheduler.build::<DefaultBackend>()?;
//! let image = pipeline.generate(&photo, &depth, "a marble statue", &config, scheduler.as_mut())?;
//! ```

pub mod backends;
pub mod debug;
pub mod denoise;
pub mod depth;
pub mod error;
pub mod image;
pub mod latent;
pub mod pipeline;
pub mod schedule;
pub mod text;

pub use burn_depth2img_clip as clip;
pub use burn_depth2img_samplers as samplers;

pub use debug::{DebugConfig, tensor_stats};
pub use denoise::{
    DEFAULT_GUIDANCE_SCALE, DenoiseStep, NoisePredictor, StepOutput, denoise_depth2img,
    denoise_depth2img_with_callback,
};
pub use depth::{DEFAULT_DEPTH_DIVISOR, prepare_depth_mask};
pub use error::{Depth2ImgError, Result};
pub use latent::{
    LatentAutoencoder, LatentDistribution, SD_SCALING_FACTOR, image_to_latent, latent_to_image,
};
pub use pipeline::{Depth2ImgConfig, Depth2ImgPipeline, SchedulerKind};
pub use schedule::{
    DEFAULT_MAX_STEPS, DEFAULT_NOISE_STRENGTH, init_timestep, noise_latents, noise_latents_with,
    prepare_noise_scheduler,
};
pub use text::text_to_embedding;
