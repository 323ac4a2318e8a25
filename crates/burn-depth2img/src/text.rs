//! Prompt embeddings for classifier-free guidance

use burn::prelude::*;
use burn_depth2img_clip::{PromptTokenizer, TextEncoder, token_rows_to_tensor};

use crate::error::{Depth2ImgError, Result};

/// Embed `[negative_prompt, prompt]` as a `[2, max_length, D]` batch
///
/// The unconditional row comes first, matching the order the denoising loop
/// splits the U-Net output in. `max_length` defaults to the tokenizer's
/// model maximum; prompts are truncated or padded to it.
pub fn text_to_embedding<B, T, E>(
    prompt: &str,
    tokenizer: &T,
    text_encoder: &E,
    negative_prompt: &str,
    max_length: Option<usize>,
) -> Result<Tensor<B, 3>>
where
    B: Backend,
    T: PromptTokenizer + ?Sized,
    E: TextEncoder<B> + ?Sized,
{
    let max_length = max_length.unwrap_or_else(|| tokenizer.model_max_length());
    if max_length < 2 {
        return Err(Depth2ImgError::InvalidArgument(format!(
            "max length {} cannot hold the start and end tokens",
            max_length
        )));
    }

    let rows = tokenizer.encode_batch_padded(&[negative_prompt, prompt], max_length)?;
    let input_ids = token_rows_to_tensor::<B>(&rows, &text_encoder.device());
    let embedding = text_encoder.forward(input_ids);

    tracing::debug!(dims = ?embedding.dims(), max_length, "embedded prompts");
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Int;
    use burn_depth2img_clip::{ClipTokenizer, ClipTokenizerConfig, END_OF_TEXT, START_OF_TEXT};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    const MERGES: &str = "#version: 0.2\nh e\nhe l\nhel l</w>\nc a\nca t</w>\n";

    /// Embeds each id as itself, repeated over 3 features
    struct EchoEncoder;

    impl TextEncoder<TestBackend> for EchoEncoder {
        fn device(&self) -> <TestBackend as Backend>::Device {
            Default::default()
        }

        fn forward(&self, input_ids: Tensor<TestBackend, 2, Int>) -> Tensor<TestBackend, 3> {
            input_ids.float().unsqueeze_dim::<3>(2).repeat_dim(2, 3)
        }
    }

    fn tokenizer() -> ClipTokenizer {
        ClipTokenizer::from_merges(MERGES, ClipTokenizerConfig::sd2x()).unwrap()
    }

    fn first_features(embedding: Tensor<TestBackend, 3>) -> Vec<f32> {
        let [n, l, _] = embedding.dims();
        embedding
            .slice([0..n, 0..l, 0..1])
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    #[test]
    fn test_negative_prompt_comes_first() {
        let embedding =
            text_to_embedding::<TestBackend, _, _>("cat", &tokenizer(), &EchoEncoder, "hell", Some(4))
                .unwrap();
        assert_eq!(embedding.dims(), [2, 4, 3]);

        let ids: Vec<u32> = first_features(embedding).iter().map(|&v| v as u32).collect();
        assert_eq!(
            ids,
            vec![
                START_OF_TEXT, 514, END_OF_TEXT, 0, // negative
                START_OF_TEXT, 516, END_OF_TEXT, 0, // prompt
            ]
        );
    }

    #[test]
    fn test_default_length_is_model_max() {
        let embedding =
            text_to_embedding::<TestBackend, _, _>("cat", &tokenizer(), &EchoEncoder, "", None).unwrap();
        assert_eq!(embedding.dims(), [2, 77, 3]);
    }

    #[test]
    fn test_too_short_max_length() {
        for max_length in [0, 1] {
            let result = text_to_embedding::<TestBackend, _, _>(
                "cat",
                &tokenizer(),
                &EchoEncoder,
                "",
                Some(max_length),
            );
            assert!(matches!(result, Err(Depth2ImgError::InvalidArgument(_))));
        }
    }
}
