//! CLIP BPE Tokenizer
//!
//! Implements the Byte Pair Encoding tokenizer used by CLIP text encoders,
//! plus the [`PromptTokenizer`] seam the embedding helpers are written against.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid merges file: no merge rules found")]
    InvalidVocab,

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("max length {0} cannot hold the start and end tokens")]
    MaxLengthTooShort(usize),
}

/// Special token IDs
pub const START_OF_TEXT: u32 = 49406;
pub const END_OF_TEXT: u32 = 49407;

/// Context length of every CLIP text encoder used by Stable Diffusion
pub const CLIP_MAX_LENGTH: usize = 77;

/// CLIP keeps the first 49152 - 256 - 2 merges
const MAX_MERGES: usize = 49152 - 256 - 2;

/// Tokenizes prompts into fixed-length id rows for a text encoder
pub trait PromptTokenizer {
    /// Longest sequence the paired text encoder accepts
    fn model_max_length(&self) -> usize;

    /// Encode one prompt, truncated and padded to exactly `max_length` ids
    fn encode_padded(&self, text: &str, max_length: usize) -> Result<Vec<u32>, TokenizerError>;

    /// Encode several prompts into equal-length rows, in order
    fn encode_batch_padded(
        &self,
        texts: &[&str],
        max_length: usize,
    ) -> Result<Vec<Vec<u32>>, TokenizerError> {
        texts
            .iter()
            .map(|text| self.encode_padded(text, max_length))
            .collect()
    }
}

/// Tokenizer settings that differ between model families
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipTokenizerConfig {
    pub max_length: usize,
    /// Id used to fill rows past the end token
    pub pad_token_id: u32,
}

impl ClipTokenizerConfig {
    /// SD 1.x (OpenAI CLIP) pads with the end token
    pub fn sd1x() -> Self {
        Self {
            max_length: CLIP_MAX_LENGTH,
            pad_token_id: END_OF_TEXT,
        }
    }

    /// SD 2.x (OpenCLIP) pads with `!`, id 0
    pub fn sd2x() -> Self {
        Self {
            max_length: CLIP_MAX_LENGTH,
            pad_token_id: 0,
        }
    }
}

impl Default for ClipTokenizerConfig {
    fn default() -> Self {
        Self::sd2x()
    }
}

/// CLIP BPE Tokenizer
pub struct ClipTokenizer {
    config: ClipTokenizerConfig,
    byte_encoder: HashMap<u8, char>,
    byte_decoder: HashMap<char, u8>,
    encoder: HashMap<String, u32>,
    decoder: HashMap<u32, String>,
    bpe_ranks: HashMap<(String, String), usize>,
    cache: RefCell<HashMap<String, String>>,
    pat: Regex,
}

impl ClipTokenizer {
    /// Load a tokenizer from a CLIP merges file (`bpe_simple_vocab_16e6.txt` / `merges.txt`)
    pub fn from_file<P: AsRef<Path>>(
        merges_path: P,
        config: ClipTokenizerConfig,
    ) -> Result<Self, TokenizerError> {
        let content = fs::read_to_string(merges_path)?;
        Self::from_merges(&content, config)
    }

    /// Build a tokenizer from merges file content
    pub fn from_merges(merges: &str, config: ClipTokenizerConfig) -> Result<Self, TokenizerError> {
        let byte_pairs = bytes_to_unicode();
        let byte_encoder: HashMap<u8, char> = byte_pairs.iter().copied().collect();
        let byte_decoder: HashMap<char, u8> = byte_pairs.iter().map(|&(b, c)| (c, b)).collect();

        // Skip header line if present (starts with #version)
        let merge_rules: Vec<(String, String)> = merges
            .lines()
            .filter(|line| !line.starts_with("#version"))
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(a), Some(b), None) => Some((a.to_string(), b.to_string())),
                    _ => None,
                }
            })
            .take(MAX_MERGES)
            .collect();

        if merge_rules.is_empty() {
            return Err(TokenizerError::InvalidVocab);
        }

        // Vocabulary order: bytes, bytes with end-of-word marker, merges, specials
        let mut vocab: Vec<String> = byte_pairs.iter().map(|(_, c)| c.to_string()).collect();
        vocab.extend(byte_pairs.iter().map(|(_, c)| format!("{}</w>", c)));
        vocab.extend(merge_rules.iter().map(|(a, b)| format!("{}{}", a, b)));

        let mut encoder: HashMap<String, u32> = vocab
            .into_iter()
            .enumerate()
            .map(|(i, token)| (token, i as u32))
            .collect();
        encoder.insert("<|startoftext|>".to_string(), START_OF_TEXT);
        encoder.insert("<|endoftext|>".to_string(), END_OF_TEXT);

        let decoder: HashMap<u32, String> = encoder.iter().map(|(k, &v)| (v, k.clone())).collect();
        let bpe_ranks: HashMap<(String, String), usize> = merge_rules
            .into_iter()
            .enumerate()
            .map(|(rank, pair)| (pair, rank))
            .collect();

        // Same split as CLIP's reference tokenizer
        let pat = Regex::new(
            r"(?i)<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|[\p{L}]+|[\p{N}]|[^\s\p{L}\p{N}]+",
        )?;

        Ok(Self {
            config,
            byte_encoder,
            byte_decoder,
            encoder,
            decoder,
            bpe_ranks,
            cache: RefCell::new(HashMap::new()),
            pat,
        })
    }

    pub fn config(&self) -> &ClipTokenizerConfig {
        &self.config
    }

    /// Encode text to token IDs, without start/end tokens
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut tokens = Vec::new();

        // Collapse whitespace, lowercase
        let text = text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        for mat in self.pat.find_iter(&text) {
            let byte_encoded: String = mat
                .as_str()
                .bytes()
                .filter_map(|b| self.byte_encoder.get(&b).copied())
                .collect();

            for bpe_token in self.bpe(&byte_encoded).split(' ') {
                if let Some(&id) = self.encoder.get(bpe_token) {
                    tokens.push(id);
                }
            }
        }

        tokens
    }

    /// Decode token IDs back to text
    pub fn decode(&self, tokens: &[u32]) -> String {
        let text: String = tokens
            .iter()
            .filter(|&&id| id != START_OF_TEXT && id != END_OF_TEXT)
            .filter_map(|id| self.decoder.get(id))
            .cloned()
            .collect();

        let text = text.replace("</w>", " ");
        let bytes: Vec<u8> = text
            .chars()
            .filter_map(|c| {
                if c == ' ' {
                    Some(b' ')
                } else {
                    self.byte_decoder.get(&c).copied()
                }
            })
            .collect();

        String::from_utf8_lossy(&bytes).trim().to_string()
    }

    /// Apply BPE to a byte-encoded word
    fn bpe(&self, token: &str) -> String {
        if let Some(cached) = self.cache.borrow().get(token) {
            return cached.clone();
        }

        let mut word: Vec<String> = token.chars().map(|c| c.to_string()).collect();
        if word.is_empty() {
            return String::new();
        }
        if let Some(last) = word.last_mut() {
            last.push_str("</w>");
        }

        loop {
            let best = word
                .windows(2)
                .filter_map(|w| {
                    let pair = (w[0].clone(), w[1].clone());
                    self.bpe_ranks.get(&pair).map(|&rank| (pair, rank))
                })
                .min_by_key(|&(_, rank)| rank);

            let Some(((first, second), _)) = best else {
                break;
            };

            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                    merged.push(format!("{}{}", first, second));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }
            word = merged;

            if word.len() == 1 {
                break;
            }
        }

        let result = word.join(" ");
        self.cache
            .borrow_mut()
            .insert(token.to_string(), result.clone());
        result
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.encoder.len()
    }
}

impl PromptTokenizer for ClipTokenizer {
    fn model_max_length(&self) -> usize {
        self.config.max_length
    }

    /// `[START, tokens.., END, PAD..]`; long prompts are cut so END stays last
    fn encode_padded(&self, text: &str, max_length: usize) -> Result<Vec<u32>, TokenizerError> {
        if max_length < 2 {
            return Err(TokenizerError::MaxLengthTooShort(max_length));
        }

        let mut body = self.encode(text);
        body.truncate(max_length - 2);

        let mut tokens = Vec::with_capacity(max_length);
        tokens.push(START_OF_TEXT);
        tokens.extend(body);
        tokens.push(END_OF_TEXT);
        tokens.resize(max_length, self.config.pad_token_id);
        Ok(tokens)
    }
}

/// Build byte-to-unicode mapping, in vocabulary order
///
/// Printable bytes map to themselves; the rest map to code points from 256 up.
fn bytes_to_unicode() -> Vec<(u8, char)> {
    let mut bs: Vec<u8> = Vec::new();
    bs.extend(b'!'..=b'~');
    bs.extend(b'\xa1'..=b'\xac');
    bs.extend(b'\xae'..=b'\xff');

    let mut pairs: Vec<(u8, char)> = bs.iter().map(|&b| (b, b as char)).collect();

    let mut n = 0u32;
    for b in 0u8..=255 {
        if !bs.contains(&b) {
            if let Some(c) = char::from_u32(256 + n) {
                pairs.push((b, c));
            }
            n += 1;
        }
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    const MERGES: &str = "#version: 0.2\nh e\nhe l\nhel l</w>\nc a\nca t</w>\n";

    fn tokenizer() -> ClipTokenizer {
        ClipTokenizer::from_merges(MERGES, ClipTokenizerConfig::sd2x()).unwrap()
    }

    #[test]
    fn test_bytes_to_unicode() {
        let mapping: HashMap<u8, char> = bytes_to_unicode().into_iter().collect();
        assert_eq!(mapping.len(), 256);

        assert_eq!(mapping.get(&b'a'), Some(&'a'));
        assert_eq!(mapping.get(&b'Z'), Some(&'Z'));
        assert_eq!(mapping.get(&b' '), Some(&'Ġ'));
    }

    #[test]
    fn test_special_tokens() {
        assert_eq!(START_OF_TEXT, 49406);
        assert_eq!(END_OF_TEXT, 49407);
    }

    #[test]
    fn test_empty_merges_rejected() {
        let result = ClipTokenizer::from_merges("#version: 0.2\n", ClipTokenizerConfig::default());
        assert!(matches!(result, Err(TokenizerError::InvalidVocab)));
    }

    #[test]
    fn test_merges_follow_file_order() {
        let tokenizer = tokenizer();
        // 256 bytes + 256 end-of-word bytes, then merges in order
        assert_eq!(tokenizer.encode("hell"), vec![514]);
        assert_eq!(tokenizer.encode("CAT"), vec![516]);
        assert_eq!(tokenizer.vocab_size(), 512 + 5 + 2);
    }

    #[test]
    fn test_encode_padded_frames_and_pads() {
        let tokenizer = tokenizer();
        let ids = tokenizer.encode_padded("hell  cat", 8).unwrap();
        assert_eq!(ids, vec![START_OF_TEXT, 514, 516, END_OF_TEXT, 0, 0, 0, 0]);

        let sd1 = ClipTokenizer::from_merges(MERGES, ClipTokenizerConfig::sd1x()).unwrap();
        let ids = sd1.encode_padded("", 4).unwrap();
        assert_eq!(ids, vec![START_OF_TEXT, END_OF_TEXT, END_OF_TEXT, END_OF_TEXT]);
    }

    #[test]
    fn test_encode_padded_truncates_keeping_end_token() {
        let tokenizer = tokenizer();
        let ids = tokenizer.encode_padded("cat cat cat cat", 4).unwrap();
        assert_eq!(ids, vec![START_OF_TEXT, 516, 516, END_OF_TEXT]);
    }

    #[test]
    fn test_max_length_too_short() {
        let tokenizer = tokenizer();
        assert!(matches!(
            tokenizer.encode_padded("cat", 1),
            Err(TokenizerError::MaxLengthTooShort(1))
        ));
    }

    #[test]
    fn test_batch_keeps_order() {
        let tokenizer = tokenizer();
        let rows = tokenizer.encode_batch_padded(&["", "cat"], 5).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec![START_OF_TEXT, END_OF_TEXT, 0, 0, 0]);
        assert_eq!(rows[1], vec![START_OF_TEXT, 516, END_OF_TEXT, 0, 0]);
    }

    #[test]
    fn test_decode_round_trip() {
        let tokenizer = tokenizer();
        let ids = tokenizer.encode_padded("hell cat", 6).unwrap();
        let ids: Vec<u32> = ids.into_iter().filter(|&id| id != 0).collect();
        assert_eq!(tokenizer.decode(&ids), "hell cat");
    }
}
