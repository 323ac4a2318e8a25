//! Depth map conditioning for the depth-aware U-Net

use burn::prelude::*;
use image::{DynamicImage, GrayImage};

use crate::error::{Depth2ImgError, Result};
use crate::image::{luma_to_tensor, normalize_min_max, to_grayscale};

/// Spatial downscale between pixels and latents
pub const DEFAULT_DEPTH_DIVISOR: u32 = 8;

/// Nearest-neighbour resize sampling each target pixel's centre
///
/// Source column for target `x` is `floor((x + 0.5) * width / target_width)`.
/// An empty source gives an empty image.
pub(crate) fn resize_nearest(image: &GrayImage, target_w: u32, target_h: u32) -> GrayImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || target_w == 0 || target_h == 0 {
        return GrayImage::new(0, 0);
    }
    let src = |dst: u32, src_len: u32, dst_len: u32| -> u32 {
        let pos = (2 * dst as u64 + 1) * src_len as u64 / (2 * dst_len as u64);
        (pos as u32).min(src_len - 1)
    };

    GrayImage::from_fn(target_w, target_h, |x, y| {
        *image.get_pixel(src(x, w, target_w), src(y, h, target_h))
    })
}

/// Turn a depth map into a `[1, 1, H / divisor, W / divisor]` mask in [-1, 1]
///
/// The map is converted to 8-bit luma, resized by nearest neighbour with
/// integer-divided sides, and min-max normalised.
pub fn prepare_depth_mask<B: Backend>(
    depth_map: &DynamicImage,
    divisor: u32,
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    if divisor == 0 {
        return Err(Depth2ImgError::InvalidArgument(
            "depth divisor must be positive".to_string(),
        ));
    }

    let gray = to_grayscale(depth_map);
    let (width, height) = gray.dimensions();
    let (target_w, target_h) = (width / divisor, height / divisor);
    if target_w == 0 || target_h == 0 {
        return Err(Depth2ImgError::InvalidArgument(format!(
            "depth map {}x{} is smaller than the divisor {}",
            width, height, divisor
        )));
    }

    let resized = resize_nearest(&gray, target_w, target_h);
    let mask = normalize_min_max(luma_to_tensor::<B>(&resized, device));

    tracing::debug!(
        source = ?(width, height),
        dims = ?mask.dims(),
        "prepared depth mask"
    );
    Ok(mask)
}
