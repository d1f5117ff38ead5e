//! Shared tokenizer for the model triple
//!
//! Conventions: pad id is always 0, no BOS is added, EOS is appended to every
//! encoded sequence. Batches are padded on the right for training and on the
//! left for generation.

use std::path::Path;

use anyhow::Result;
use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;
use tracing::debug;

use crate::masks::rows_to_tensor;

/// Fixed padding id
pub const PAD_TOKEN_ID: u32 = 0;

/// Which end of a row receives padding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingSide {
    /// Generation batches: prompts end at the same position
    Left,
    /// Training batches: tokens start at position 0
    Right,
}

/// Tokenizer family, chosen from the checkpoint name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerVariant {
    Llama,
    Auto,
}

impl TokenizerVariant {
    pub fn from_model_name(model_name_or_path: &str) -> Self {
        if model_name_or_path.to_lowercase().contains("llama") {
            TokenizerVariant::Llama
        } else {
            TokenizerVariant::Auto
        }
    }

    /// End-of-sequence spellings in lookup order
    fn eos_candidates(self) -> &'static [&'static str] {
        match self {
            TokenizerVariant::Llama => &["</s>", "<|eot_id|>", "<|end_of_text|>"],
            TokenizerVariant::Auto => &[
                "<|im_end|>",
                "<|endoftext|>",
                "</s>",
                "<end_of_turn>",
                "<|eot_id|>",
            ],
        }
    }
}

pub struct NesyTokenizer {
    inner: Tokenizer,
    variant: TokenizerVariant,
    eos_token_id: Option<u32>,
}

impl NesyTokenizer {
    /// Load `tokenizer.json`
    pub fn from_file(path: impl AsRef<Path>, model_name_or_path: &str) -> Result<Self> {
        let inner = Tokenizer::from_file(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        Ok(Self::from_tokenizer(inner, model_name_or_path))
    }

    pub fn from_tokenizer(inner: Tokenizer, model_name_or_path: &str) -> Self {
        let variant = TokenizerVariant::from_model_name(model_name_or_path);
        let vocab = inner.get_vocab(true);
        let eos_token_id = variant
            .eos_candidates()
            .iter()
            .find_map(|tok| vocab.get(*tok).copied());
        debug!("Tokenizer variant {:?}, eos id {:?}", variant, eos_token_id);
        Self {
            inner,
            variant,
            eos_token_id,
        }
    }

    pub fn variant(&self) -> TokenizerVariant {
        self.variant
    }

    pub fn pad_token_id(&self) -> u32 {
        PAD_TOKEN_ID
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn inner(&self) -> &Tokenizer {
        &self.inner
    }

    /// Token ids for `text`, with EOS appended when the vocabulary has one
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        let mut ids = encoding.get_ids().to_vec();
        if let Some(eos) = self.eos_token_id {
            ids.push(eos);
        }
        Ok(ids)
    }

    /// Pad rows to a common length with [`PAD_TOKEN_ID`]
    pub fn pad_rows(rows: &[Vec<u32>], side: PaddingSide) -> Vec<Vec<u32>> {
        let max_len = rows.iter().map(Vec::len).max().unwrap_or(0);
        rows.iter()
            .map(|row| {
                let padding = std::iter::repeat(PAD_TOKEN_ID).take(max_len - row.len());
                match side {
                    PaddingSide::Left => padding.chain(row.iter().copied()).collect(),
                    PaddingSide::Right => row.iter().copied().chain(padding).collect(),
                }
            })
            .collect()
    }

    /// Encode and pad a batch into a `[batch, max_len]` u32 tensor
    pub fn encode_batch(&self, texts: &[&str], side: PaddingSide, device: &Device) -> Result<Tensor> {
        anyhow::ensure!(!texts.is_empty(), "Cannot encode an empty batch");
        let rows = texts
            .iter()
            .map(|t| self.encode(t))
            .collect::<Result<Vec<_>>>()?;
        rows_to_tensor(&Self::pad_rows(&rows, side), device)
    }

    /// Text for `ids` with pad, EOS and other special tokens removed
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let kept: Vec<u32> = ids
            .iter()
            .copied()
            .filter(|&id| id != PAD_TOKEN_ID && Some(id) != self.eos_token_id)
            .collect();
        self.inner
            .decode(&kept, true)
            .map_err(|e| anyhow::anyhow!("Decoding error: {e}"))
    }

    pub fn decode_batch(&self, rows: &[Vec<u32>]) -> Result<Vec<String>> {
        rows.iter().map(|row| self.decode(row)).collect()
    }
}
