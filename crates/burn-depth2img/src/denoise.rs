//! Guided denoising loop for the depth-conditioned U-Net

use burn::prelude::*;
use burn_depth2img_samplers::{Scheduler, apply_guidance};

use crate::debug::{DebugConfig, inspect};
use crate::error::{Depth2ImgError, Result};

pub const DEFAULT_GUIDANCE_SCALE: f64 = 8.0;

/// The depth-conditioned U-Net
///
/// Its input is the latent with the depth mask appended as an extra channel.
pub trait NoisePredictor<B: Backend> {
    /// Device the U-Net weights live on
    fn device(&self) -> B::Device;

    /// Predict noise `[N, C, h, w]` for `sample` `[N, C + 1, h, w]`
    ///
    /// `timestep` is a one-element tensor holding the training timestep.
    fn forward(
        &self,
        sample: Tensor<B, 4>,
        timestep: Tensor<B, 1>,
        encoder_hidden_states: Tensor<B, 3>,
    ) -> Tensor<B, 4>;

    /// Return cached allocations to the device after each step
    fn release_cached_memory(&self) {}
}

/// What to output at each denoising step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepOutput {
    /// No output, minimal overhead
    #[default]
    None,
    /// Latent after the step (one extra clone)
    Latent,
}

/// Information passed to the step callback
pub struct DenoiseStep<B: Backend> {
    /// Current step (0-indexed)
    pub step: usize,
    /// Total number of steps
    pub total_steps: usize,
    /// Timestep that was just denoised
    pub timestep: usize,
    /// Output based on the [`StepOutput`] setting
    pub output: Option<Tensor<B, 4>>,
}

/// Denoise `latents` over the scheduler's remaining timesteps
///
/// `text_emb` holds the unconditional rows first, then the prompt rows.
pub fn denoise_depth2img<B, U, S>(
    latents: Tensor<B, 4>,
    depth_mask: Tensor<B, 4>,
    text_emb: Tensor<B, 3>,
    unet: &U,
    scheduler: &mut S,
    guidance_scale: f64,
) -> Result<Tensor<B, 4>>
where
    B: Backend,
    U: NoisePredictor<B> + ?Sized,
    S: Scheduler<B> + ?Sized,
{
    denoise_depth2img_with_callback(
        latents,
        depth_mask,
        text_emb,
        unet,
        scheduler,
        guidance_scale,
        &DebugConfig::default(),
        StepOutput::None,
        |_| {},
    )
}

/// [`denoise_depth2img`] reporting progress after every step
#[allow(clippy::too_many_arguments)]
pub fn denoise_depth2img_with_callback<B, U, S, F>(
    latents: Tensor<B, 4>,
    depth_mask: Tensor<B, 4>,
    text_emb: Tensor<B, 3>,
    unet: &U,
    scheduler: &mut S,
    guidance_scale: f64,
    debug: &DebugConfig,
    step_output: StepOutput,
    mut callback: F,
) -> Result<Tensor<B, 4>>
where
    B: Backend,
    U: NoisePredictor<B> + ?Sized,
    S: Scheduler<B> + ?Sized,
    F: FnMut(DenoiseStep<B>),
{
    let [n, c, h, w] = latents.dims();
    let [mask_n, mask_c, mask_h, mask_w] = depth_mask.dims();
    let [emb_n, emb_l, emb_d] = text_emb.dims();

    if (mask_n, mask_c, mask_h, mask_w) != (n, 1, h, w) {
        return Err(Depth2ImgError::ShapeMismatch {
            name: "depth mask",
            expected: vec![n, 1, h, w],
            actual: vec![mask_n, mask_c, mask_h, mask_w],
        });
    }
    if emb_n != 2 * n {
        return Err(Depth2ImgError::ShapeMismatch {
            name: "text embedding",
            expected: vec![2 * n, emb_l, emb_d],
            actual: vec![emb_n, emb_l, emb_d],
        });
    }

    let device = latents.device();
    let mut latents = latents;
    let depth_pair = Tensor::cat(vec![depth_mask.clone(), depth_mask], 0);

    let timesteps = scheduler.timesteps().to_vec();
    let total_steps = timesteps.len();
    let timestep_tensors: Vec<Tensor<B, 1>> = timesteps
        .iter()
        .map(|&t| Tensor::<B, 1>::from_data(TensorData::new(vec![t as f32], [1]), &device))
        .collect();

    tracing::debug!(total_steps, guidance_scale, "denoising");

    for (step_idx, (&timestep, t)) in timesteps.iter().zip(timestep_tensors).enumerate() {
        let model_input = Tensor::cat(vec![latents.clone(), latents.clone()], 0);
        let model_input = scheduler.scale_model_input(model_input, timestep);
        let model_input = Tensor::cat(vec![model_input, depth_pair.clone()], 1);

        let noise_pred = unet.forward(model_input, t, text_emb.clone());
        let pred_dims = noise_pred.dims();
        if pred_dims != [2 * n, c, h, w] {
            return Err(Depth2ImgError::ShapeMismatch {
                name: "noise prediction",
                expected: vec![2 * n, c, h, w],
                actual: pred_dims.to_vec(),
            });
        }

        let noise_uncond = noise_pred.clone().slice([0..n, 0..c, 0..h, 0..w]);
        let noise_text = noise_pred.slice([n..2 * n, 0..c, 0..h, 0..w]);
        let guided = apply_guidance(noise_uncond, noise_text, guidance_scale);

        latents = scheduler.step(guided, timestep, latents)?;
        inspect(&latents, &format!("step_{}_latent", step_idx), debug)?;
        unet.release_cached_memory();

        tracing::trace!(step = step_idx, timestep, "denoise step");

        let output = match step_output {
            StepOutput::None => None,
            StepOutput::Latent => Some(latents.clone()),
        };

        callback(DenoiseStep {
            step: step_idx,
            total_steps,
            timestep,
            output,
        });
    }

    Ok(latents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_depth2img_samplers::{DeisConfig, DeisMultistepScheduler};
    use std::cell::{Cell, RefCell};

    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// Predicts the depth channel as noise for the first half, zeros for the second
    struct DepthEchoUNet {
        calls: Cell<usize>,
        releases: Cell<usize>,
        inputs: RefCell<Vec<[usize; 4]>>,
    }

    impl DepthEchoUNet {
        fn new() -> Self {
            Self {
                calls: Cell::new(0),
                releases: Cell::new(0),
                inputs: RefCell::new(Vec::new()),
            }
        }
    }

    impl NoisePredictor<TestBackend> for DepthEchoUNet {
        fn device(&self) -> <TestBackend as Backend>::Device {
            Default::default()
        }

        fn forward(
            &self,
            sample: Tensor<TestBackend, 4>,
            _timestep: Tensor<TestBackend, 1>,
            _encoder_hidden_states: Tensor<TestBackend, 3>,
        ) -> Tensor<TestBackend, 4> {
            self.calls.set(self.calls.get() + 1);
            self.inputs.borrow_mut().push(sample.dims());

            let [n2, c1, h, w] = sample.dims();
            let n = n2 / 2;
            let depth = sample.clone().slice([0..n, c1 - 1..c1, 0..h, 0..w]).repeat_dim(1, c1 - 1);
            let zeros = Tensor::zeros([n, c1 - 1, h, w], &sample.device());
            Tensor::cat(vec![depth, zeros], 0)
        }

        fn release_cached_memory(&self) {
            self.releases.set(self.releases.get() + 1);
        }
    }

    /// Ignores its input and returns a fixed noise prediction
    struct ConstantUNet(f32);

    impl NoisePredictor<TestBackend> for ConstantUNet {
        fn device(&self) -> <TestBackend as Backend>::Device {
            Default::default()
        }

        fn forward(
            &self,
            sample: Tensor<TestBackend, 4>,
            _timestep: Tensor<TestBackend, 1>,
            _encoder_hidden_states: Tensor<TestBackend, 3>,
        ) -> Tensor<TestBackend, 4> {
            let [n2, c1, h, w] = sample.dims();
            Tensor::ones([n2, c1 - 1, h, w], &sample.device()) * self.0
        }
    }

    fn scheduler(steps: usize) -> DeisMultistepScheduler<TestBackend> {
        let mut scheduler = DeisMultistepScheduler::new(DeisConfig::default()).unwrap();
        Scheduler::<TestBackend>::set_timesteps(&mut scheduler, steps).unwrap();
        scheduler
    }

    type Inputs = (
        Tensor<TestBackend, 4>,
        Tensor<TestBackend, 4>,
        Tensor<TestBackend, 3>,
    );

    /// Zero latents `[1, 4, 2, 2]`, a flat depth mask and a zero embedding pair
    fn inputs(device: &<TestBackend as Backend>::Device) -> Inputs {
        (
            Tensor::zeros([1, 4, 2, 2], device),
            Tensor::ones([1, 1, 2, 2], device),
            Tensor::zeros([2, 3, 5], device),
        )
    }

    #[test]
    fn test_loop_runs_every_timestep() {
        let device = Default::default();
        let (latents, depth, emb) = inputs(&device);
        let unet = DepthEchoUNet::new();
        let mut scheduler = scheduler(5);

        let mut steps = Vec::new();
        let out = denoise_depth2img_with_callback(
            latents,
            depth,
            emb,
            &unet,
            &mut scheduler,
            DEFAULT_GUIDANCE_SCALE,
            &DebugConfig::default(),
            StepOutput::Latent,
            |info| steps.push((info.step, info.total_steps, info.timestep, info.output.is_some())),
        )
        .unwrap();

        assert_eq!(out.dims(), [1, 4, 2, 2]);
        assert_eq!(unet.calls.get(), 5);
        assert_eq!(unet.releases.get(), 5);
        assert!(unet.inputs.borrow().iter().all(|dims| dims == &[2, 5, 2, 2]));

        let timesteps = Scheduler::<TestBackend>::timesteps(&scheduler).to_vec();
        let expected: Vec<_> = timesteps.iter().enumerate().map(|(i, &t)| (i, 5, t, true)).collect();
        assert_eq!(steps, expected);
    }

    #[test]
    fn test_guidance_matches_manual_step() {
        let device = Default::default();
        let (latents, depth, emb) = inputs(&device);
        let unet = DepthEchoUNet::new();

        // uncond = depth (1.0), text = 0.0: guided = 1 + 8 * (0 - 1) = -7
        let mut looped = scheduler(1);
        let out = denoise_depth2img(latents.clone(), depth, emb, &unet, &mut looped, 8.0).unwrap();

        let mut manual = scheduler(1);
        let t = Scheduler::<TestBackend>::timesteps(&manual)[0];
        let guided = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device) * -7.0;
        let expected = manual.step(guided, t, latents).unwrap();

        let diff: f32 = (out - expected).abs().max().into_scalar().elem();
        assert!(diff < 1e-5, "diff = {}", diff);
    }

    #[test]
    fn test_no_timesteps_is_identity() {
        let device = Default::default();
        let (_, depth, emb) = inputs(&device);
        let latents = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device) * 0.5;
        let unet = DepthEchoUNet::new();
        let mut scheduler = scheduler(5);
        Scheduler::<TestBackend>::skip_timesteps(&mut scheduler, 5);

        let out = denoise_depth2img(latents, depth, emb, &unet, &mut scheduler, 8.0).unwrap();
        assert_eq!(unet.calls.get(), 0);
        let value: f32 = out.mean().into_scalar().elem();
        assert_eq!(value, 0.5);
    }

    #[test]
    fn test_shape_validation() {
        let device = Default::default();
        let (latents, depth, emb) = inputs(&device);
        let unet = ConstantUNet(0.0);

        let bad_depth = Tensor::<TestBackend, 4>::ones([1, 1, 3, 2], &device);
        let result =
            denoise_depth2img(latents.clone(), bad_depth, emb.clone(), &unet, &mut scheduler(2), 8.0);
        assert!(matches!(result, Err(Depth2ImgError::ShapeMismatch { name: "depth mask", .. })));

        let bad_batch = Tensor::<TestBackend, 4>::ones([2, 1, 2, 2], &device);
        let result =
            denoise_depth2img(latents.clone(), bad_batch, emb.clone(), &unet, &mut scheduler(2), 8.0);
        assert!(matches!(result, Err(Depth2ImgError::ShapeMismatch { name: "depth mask", .. })));

        let two_channels = Tensor::<TestBackend, 4>::ones([1, 2, 2, 2], &device);
        let result =
            denoise_depth2img(latents.clone(), two_channels, emb.clone(), &unet, &mut scheduler(2), 8.0);
        assert!(matches!(result, Err(Depth2ImgError::ShapeMismatch { name: "depth mask", .. })));

        let bad_emb = Tensor::<TestBackend, 3>::zeros([1, 3, 5], &device);
        let result = denoise_depth2img(latents, depth, bad_emb, &unet, &mut scheduler(2), 8.0);
        assert!(matches!(result, Err(Depth2ImgError::ShapeMismatch { name: "text embedding", .. })));
    }

    #[test]
    fn test_nan_check_stops_the_loop() {
        let device = Default::default();
        let (latents, depth, emb) = inputs(&device);
        let unet = ConstantUNet(f32::NAN);
        let debug = DebugConfig { stats: false, nan: true };

        let result = denoise_depth2img_with_callback(
            latents,
            depth,
            emb,
            &unet,
            &mut scheduler(3),
            8.0,
            &debug,
            StepOutput::None,
            |_| {},
        );
        assert!(matches!(result, Err(Depth2ImgError::NonFinite { .. })));
    }
}
