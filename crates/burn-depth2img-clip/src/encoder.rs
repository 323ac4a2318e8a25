//! Text encoder seam
//!
//! The CLIP / OpenCLIP transformer itself is supplied by the caller: any
//! module that maps token ids to per-token hidden states can condition the
//! U-Net.

use burn::prelude::*;
use burn::tensor::Int;

/// A pretrained text encoder (CLIP / OpenCLIP text transformer)
pub trait TextEncoder<B: Backend> {
    /// Device the encoder's weights live on
    fn device(&self) -> B::Device;

    /// Encode token ids `[batch, seq_len]` to hidden states `[batch, seq_len, embed_dim]`
    fn forward(&self, input_ids: Tensor<B, 2, Int>) -> Tensor<B, 3>;
}

/// Stack equal-length id rows into a `[rows, seq_len]` tensor
pub fn token_rows_to_tensor<B: Backend>(rows: &[Vec<u32>], device: &B::Device) -> Tensor<B, 2, Int> {
    let seq_len = rows.first().map_or(0, Vec::len);
    let ids: Vec<i32> = rows
        .iter()
        .flat_map(|row| row.iter().map(|&t| t as i32))
        .collect();

    Tensor::from_data(TensorData::new(ids, [rows.len(), seq_len]), device)
}
