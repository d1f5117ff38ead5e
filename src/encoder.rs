//! Latent encoder: token sequences to latent task embeddings
//!
//! The adapter-augmented base model reads the sequence, the hidden state at
//! each row's last non-pad position is taken, and a trainable `latent_head`
//! projects it to `latent_size`.

use anyhow::Result;
use candle_core::{DType, IndexOp, Module, Tensor};
use candle_nn::Linear;

use crate::forward_llama::NesyLlama;
use crate::lora::AdapterSet;
use crate::masks::{rows_to_tensor, token_mask};
use crate::model::{AttentionConfig, ForwardRequest, NesyBackend};
use crate::tokenizer::PAD_TOKEN_ID;

/// Name of the projection head inside the encoder adapter
pub const LATENT_HEAD: &str = "latent_head";

pub struct LatentEncoder {
    model: NesyLlama,
    adapters: AdapterSet,
    latent_head: Linear,
    latent_size: usize,
}

impl LatentEncoder {
    /// Wrap `model`, whose adapters live in `adapters`, and create the head
    pub fn new(model: NesyLlama, adapters: AdapterSet, latent_size: usize) -> Result<Self> {
        let latent_head = adapters.linear_head(LATENT_HEAD, model.d_model(), latent_size)?;
        adapters.log_trainable("encoder", model.base_param_count());
        Ok(Self {
            model,
            adapters,
            latent_head,
            latent_size,
        })
    }

    pub fn model(&self) -> &NesyLlama {
        &self.model
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    pub fn adapters_mut(&mut self) -> &mut AdapterSet {
        &mut self.adapters
    }

    pub fn latent_size(&self) -> usize {
        self.latent_size
    }

    /// Latent embeddings `[batch, latent_size]` for `[batch, seq]` token ids
    ///
    /// Every row needs at least one non-pad token.
    pub fn encode(&self, token_ids: &Tensor) -> Result<Tensor> {
        let device = self.model.device();
        let ids = token_ids.to_dtype(DType::U32)?.to_device(device)?;
        let rows: Vec<Vec<u32>> = ids.to_vec2()?;
        let mask_rows = token_mask(&rows, PAD_TOKEN_ID);

        let last_positions = mask_rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                row.iter().rposition(|&m| m == 1).ok_or_else(|| {
                    anyhow::anyhow!("Encoder input row {i} contains only pad tokens")
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mask = rows_to_tensor(&mask_rows, device)?;
        let hidden = self
            .model
            .hidden_states(&ForwardRequest::tokens(&ids).with_attention(AttentionConfig::new(mask)))?;

        let pooled = last_positions
            .iter()
            .enumerate()
            .map(|(row, &pos)| hidden.i((row, pos)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let pooled = Tensor::stack(&pooled, 0)?;

        Ok(self.latent_head.forward(&pooled)?)
    }
}
