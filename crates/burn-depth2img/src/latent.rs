//! Moving between pixel space and the autoencoder's latent space

use burn::prelude::*;
use burn::tensor::Distribution;
use image::RgbImage;

use crate::error::{Depth2ImgError, Result};
use crate::image::{image_to_tensor, normalize_min_max, tensor_to_image};

/// Latent scaling factor of the Stable Diffusion 1.x/2.x autoencoder
pub const SD_SCALING_FACTOR: f64 = 0.18215;

/// Diagonal Gaussian over latents, as produced by the VAE encoder
#[derive(Debug, Clone)]
pub struct LatentDistribution<B: Backend> {
    pub mean: Tensor<B, 4>,
    /// Log variance, clamped to [-30, 20]
    pub logvar: Tensor<B, 4>,
}

impl<B: Backend> LatentDistribution<B> {
    pub fn new(mean: Tensor<B, 4>, logvar: Tensor<B, 4>) -> Self {
        Self {
            mean,
            logvar: logvar.clamp(-30.0, 20.0),
        }
    }

    /// Split encoder moments `[N, 2C, h, w]` into mean and logvar along channels
    pub fn from_moments(moments: Tensor<B, 4>) -> Result<Self> {
        let [b, c, h, w] = moments.dims();
        if c == 0 || c % 2 != 0 {
            return Err(Depth2ImgError::ShapeMismatch {
                name: "encoder moments",
                expected: vec![b, c + c % 2, h, w],
                actual: vec![b, c, h, w],
            });
        }
        let half_c = c / 2;

        let mean = moments.clone().slice([0..b, 0..half_c, 0..h, 0..w]);
        let logvar = moments.slice([0..b, half_c..c, 0..h, 0..w]);
        Ok(Self::new(mean, logvar))
    }

    pub fn std(&self) -> Tensor<B, 4> {
        (self.logvar.clone() * 0.5).exp()
    }

    /// Draw `mean + std * N(0, 1)`
    pub fn sample(&self) -> Tensor<B, 4> {
        let noise = Tensor::random(
            self.mean.shape(),
            Distribution::Normal(0.0, 1.0),
            &self.mean.device(),
        );
        self.mean.clone() + self.std() * noise
    }

    pub fn mode(&self) -> Tensor<B, 4> {
        self.mean.clone()
    }
}

/// The variational autoencoder of a latent diffusion model
pub trait LatentAutoencoder<B: Backend> {
    /// Device the autoencoder weights live on
    fn device(&self) -> B::Device;

    /// Encode `[N, 3, H, W]` pixels in [-1, 1] to a latent distribution
    fn encode(&self, image: Tensor<B, 4>) -> LatentDistribution<B>;

    /// Decode unscaled latents to `[N, 3, H, W]` pixels in [-1, 1]
    fn decode(&self, latents: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Factor applied to sampled latents so they have unit variance
    fn scaling_factor(&self) -> f64 {
        SD_SCALING_FACTOR
    }
}

/// Encode an RGB image into scaled latents `[1, C, H/8, W/8]`
///
/// Pixels are min-max normalised to [-1, 1] before encoding, and the latent
/// is sampled from the encoder distribution.
pub fn image_to_latent<B: Backend, V: LatentAutoencoder<B> + ?Sized>(
    image: &RgbImage,
    vae: &V,
) -> Result<Tensor<B, 4>> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(Depth2ImgError::InvalidArgument(format!(
            "cannot encode an empty {}x{} image",
            width, height
        )));
    }

    let device = vae.device();
    let pixels = normalize_min_max(image_to_tensor::<B>(image, &device));
    let latents = vae.encode(pixels).sample() * vae.scaling_factor();

    tracing::debug!(dims = ?latents.dims(), "encoded image to latents");
    Ok(latents)
}

/// Decode scaled latents and return the first image of the batch
pub fn latent_to_image<B: Backend, V: LatentAutoencoder<B> + ?Sized>(
    latents: Tensor<B, 4>,
    vae: &V,
) -> Result<RgbImage> {
    let latents = latents.to_device(&vae.device()) / vae.scaling_factor();
    let decoded = vae.decode(latents);
    tracing::debug!(dims = ?decoded.dims(), "decoded latents");
    tensor_to_image(decoded)
}
