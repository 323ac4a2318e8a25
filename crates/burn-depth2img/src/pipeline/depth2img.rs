//! Depth-conditioned image-to-image generation

use std::marker::PhantomData;

use burn::prelude::*;
use burn_depth2img_clip::{PromptTokenizer, TextEncoder};
use burn_depth2img_samplers::Scheduler;
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};

use super::SchedulerKind;
use crate::debug::{DebugConfig, inspect};
use crate::denoise::{
    DEFAULT_GUIDANCE_SCALE, DenoiseStep, NoisePredictor, StepOutput,
    denoise_depth2img_with_callback,
};
use crate::depth::{DEFAULT_DEPTH_DIVISOR, prepare_depth_mask};
use crate::error::{Depth2ImgError, Result};
use crate::latent::{LatentAutoencoder, image_to_latent, latent_to_image};
use crate::schedule::{DEFAULT_MAX_STEPS, DEFAULT_NOISE_STRENGTH, noise_latents, prepare_noise_scheduler};
use crate::text::text_to_embedding;

/// Configuration for depth2img generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Depth2ImgConfig {
    pub steps: usize,
    /// Share of the schedule to run (1.0 = start from the noisiest timestep)
    pub strength: f64,
    pub guidance_scale: f64,
    pub negative_prompt: String,
    /// Token row length, defaults to the tokenizer's model maximum
    pub max_length: Option<usize>,
    /// Pixel-to-latent downscale for the depth mask
    pub depth_divisor: u32,
    pub scheduler: SchedulerKind,
    pub debug: DebugConfig,
}

impl Default for Depth2ImgConfig {
    fn default() -> Self {
        Self {
            steps: DEFAULT_MAX_STEPS,
            strength: DEFAULT_NOISE_STRENGTH,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            negative_prompt: String::new(),
            max_length: None,
            depth_divisor: DEFAULT_DEPTH_DIVISOR,
            scheduler: SchedulerKind::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl Depth2ImgConfig {
    /// Check the values the helpers cannot validate on their own
    pub fn validate(&self) -> Result<()> {
        if !self.guidance_scale.is_finite() {
            return Err(Depth2ImgError::InvalidArgument(format!(
                "guidance scale must be finite, got {}",
                self.guidance_scale
            )));
        }
        Ok(())
    }
}

/// Stable Diffusion 2 depth2img pipeline over caller-supplied components
pub struct Depth2ImgPipeline<B, T, E, V, U>
where
    B: Backend,
{
    pub tokenizer: T,
    pub text_encoder: E,
    pub vae: V,
    pub unet: U,
    _backend: PhantomData<B>,
}

impl<B, T, E, V, U> Depth2ImgPipeline<B, T, E, V, U>
where
    B: Backend,
    T: PromptTokenizer,
    E: TextEncoder<B>,
    V: LatentAutoencoder<B>,
    U: NoisePredictor<B>,
{
    pub fn new(tokenizer: T, text_encoder: E, vae: V, unet: U) -> Self {
        Self {
            tokenizer,
            text_encoder,
            vae,
            unet,
            _backend: PhantomData,
        }
    }

    /// Re-imagine `image` following `prompt`, keeping the layout of `depth_map`
    pub fn generate<S>(
        &self,
        image: &DynamicImage,
        depth_map: &DynamicImage,
        prompt: &str,
        config: &Depth2ImgConfig,
        scheduler: &mut S,
    ) -> Result<RgbImage>
    where
        S: Scheduler<B> + ?Sized,
    {
        self.generate_with_callback(
            image,
            depth_map,
            prompt,
            config,
            scheduler,
            StepOutput::None,
            |_| {},
        )
    }

    /// Generate with a callback after every denoising step
    #[allow(clippy::too_many_arguments)]
    pub fn generate_with_callback<S, F>(
        &self,
        image: &DynamicImage,
        depth_map: &DynamicImage,
        prompt: &str,
        config: &Depth2ImgConfig,
        scheduler: &mut S,
        step_output: StepOutput,
        callback: F,
    ) -> Result<RgbImage>
    where
        S: Scheduler<B> + ?Sized,
        F: FnMut(DenoiseStep<B>),
    {
        config.validate()?;
        let debug = &config.debug;
        let device = self.unet.device();

        let text_emb = text_to_embedding(
            prompt,
            &self.tokenizer,
            &self.text_encoder,
            &config.negative_prompt,
            config.max_length,
        )?
        .to_device(&device);
        inspect(&text_emb, "text_embedding", debug)?;

        let latents = image_to_latent(&image.to_rgb8(), &self.vae)?.to_device(&device);
        inspect(&latents, "image_latents", debug)?;

        let depth_mask = prepare_depth_mask::<B>(depth_map, config.depth_divisor, &device)?;
        inspect(&depth_mask, "depth_mask", debug)?;

        prepare_noise_scheduler(scheduler, config.steps, config.strength)?;
        let latents = noise_latents(latents, scheduler)?;
        inspect(&latents, "noised_latents", debug)?;

        tracing::info!(
            steps = scheduler.timesteps().len(),
            strength = config.strength,
            guidance_scale = config.guidance_scale,
            "starting depth2img"
        );

        let latents = denoise_depth2img_with_callback(
            latents,
            depth_mask,
            text_emb,
            &self.unet,
            scheduler,
            config.guidance_scale,
            debug,
            step_output,
            callback,
        )?;
        inspect(&latents, "denoised_latents", debug)?;

        latent_to_image(latents, &self.vae)
    }
}
