//! CLIP tokenization and the text encoder seam
//!
//! # Tokenizer
//!
//! The [`ClipTokenizer`] handles BPE tokenization of text prompts:
//!
//! ```ignore
//! use burn_depth2img_clip::{ClipTokenizer, ClipTokenizerConfig, PromptTokenizer};
//!
//! let tokenizer = ClipTokenizer::from_file("merges.txt", ClipTokenizerConfig::sd2x())?;
//! let ids = tokenizer.encode_padded("a photo of a cat", 77)?;
//! ```
//!
//! # Encoder
//!
//! [`TextEncoder`] is implemented by whatever CLIP transformer the caller loads.

pub mod encoder;
pub mod tokenizer;

pub use encoder::{TextEncoder, token_rows_to_tensor};
pub use tokenizer::{
    CLIP_MAX_LENGTH, ClipTokenizer, ClipTokenizerConfig, END_OF_TEXT, PromptTokenizer,
    START_OF_TEXT, TokenizerError,
};
