//! Conversions between `image` buffers and Burn tensors
//!
//! Tensors use the NCHW layout. Pixel tensors straight from an image are in
//! [0, 1]; tensors fed to or produced by the autoencoder are in [-1, 1].

use burn::prelude::*;
use image::{DynamicImage, GrayImage, Luma, RgbImage};

use crate::debug::tensor_to_vec;
use crate::error::{Depth2ImgError, Result};

/// RGB8 image to a `[1, 3, H, W]` tensor in [0, 1]
pub fn image_to_tensor<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    let plane = w * h;

    let mut data = vec![0f32; 3 * plane];
    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = y as usize * w + x as usize;
        for c in 0..3 {
            data[c * plane + offset] = pixel[c] as f32 / 255.0;
        }
    }

    Tensor::from_data(TensorData::new(data, [1, 3, h, w]), device)
}

/// L8 image to a `[1, 1, H, W]` tensor in [0, 1]
pub fn luma_to_tensor<B: Backend>(image: &GrayImage, device: &B::Device) -> Tensor<B, 4> {
    let (width, height) = image.dimensions();
    let data: Vec<f32> = image.as_raw().iter().map(|&v| v as f32 / 255.0).collect();

    Tensor::from_data(
        TensorData::new(data, [1, 1, height as usize, width as usize]),
        device,
    )
}

/// Rescale a tensor so its minimum maps to -1 and its maximum to 1
///
/// A constant tensor has no range to stretch and comes back as zeros.
pub fn normalize_min_max<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, D> {
    let min: f32 = tensor.clone().min().into_scalar().elem();
    let max: f32 = tensor.clone().max().into_scalar().elem();
    let range = max - min;

    if !(range > 0.0) {
        tracing::warn!(min, max, "constant tensor, min-max normalization yields zeros");
        return tensor.zeros_like();
    }

    (tensor - min) / range * 2.0 - 1.0
}

/// First image of a `[N, 3, H, W]` tensor in [-1, 1] to RGB8
pub fn tensor_to_image<B: Backend>(tensor: Tensor<B, 4>) -> Result<RgbImage> {
    let [n, c, h, w] = tensor.dims();
    if n == 0 || c != 3 {
        return Err(Depth2ImgError::ShapeMismatch {
            name: "image tensor",
            expected: vec![1, 3, h, w],
            actual: vec![n, c, h, w],
        });
    }

    let first = tensor.slice([0..1, 0..3, 0..h, 0..w]);
    let pixels = ((first / 2.0 + 0.5).clamp(0.0, 1.0) * 255.0).reshape([3, h * w]);
    let values = tensor_to_vec(pixels)?;

    let plane = h * w;
    let mut buffer = vec![0u8; 3 * plane];
    for idx in 0..plane {
        for ch in 0..3 {
            buffer[idx * 3 + ch] = values[ch * plane + idx].round() as u8;
        }
    }

    RgbImage::from_raw(w as u32, h as u32, buffer).ok_or_else(|| {
        Depth2ImgError::InvalidArgument(format!("cannot build a {}x{} RGB image", w, h))
    })
}

/// Convert to 8-bit luma with the ITU-R 601-2 weights
///
/// Uses the fixed-point form `(19595 R + 38470 G + 7471 B + 0x8000) >> 16`,
/// so gray inputs round-trip unchanged.
pub fn to_grayscale(image: &DynamicImage) -> GrayImage {
    if let DynamicImage::ImageLuma8(gray) = image {
        return gray.clone();
    }

    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let luma = (r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16;
        Luma([luma as u8])
    })
}
