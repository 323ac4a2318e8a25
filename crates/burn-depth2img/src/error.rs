//! Error type shared by the depth2img helpers

use burn_depth2img_clip::TokenizerError;
use burn_depth2img_samplers::SchedulerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Depth2ImgError {
    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Tensor data error: {0}")]
    TensorData(String),

    #[error("{name}: {nan}/{total} values are NaN, {inf}/{total} are Inf")]
    NonFinite {
        name: String,
        nan: usize,
        inf: usize,
        total: usize,
    },
}

pub type Result<T> = std::result::Result<T, Depth2ImgError>;
