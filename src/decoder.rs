//! Latent decoder: reconstruction loss and free-running sampling
//!
//! A latent is read as `num_soft_token` soft-token embeddings placed in front
//! of the target sequence. Soft-token positions and pad-valued labels are
//! excluded from the loss.

use anyhow::Result;
use candle_core::{DType, Tensor};

use crate::forward_llama::NesyLlama;
use crate::fusion::soft_tokens;
use crate::lora::AdapterSet;
use crate::masks::{prefixed_attention, prefixed_labels, rows_to_tensor};
use crate::model::{AttentionConfig, ForwardRequest, GenerationConfig, NesyBackend};
use crate::tokenizer::PAD_TOKEN_ID;

pub struct LatentDecoder {
    model: NesyLlama,
    adapters: AdapterSet,
    num_soft_token: usize,
}

impl LatentDecoder {
    pub fn new(model: NesyLlama, adapters: AdapterSet, num_soft_token: usize) -> Self {
        adapters.log_trainable("decoder", model.base_param_count());
        Self {
            model,
            adapters,
            num_soft_token,
        }
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

    fn soft_prefix(&self, embedding: &Tensor) -> Result<Tensor> {
        soft_tokens(
            embedding,
            embedding.dim(0)?,
            self.num_soft_token,
            self.model.d_model(),
            self.model.dtype(),
            self.model.device(),
        )
    }

    /// Mean reconstruction loss of `labels` (`[batch, len]`) given `embedding`
    /// (`[batch, num_soft_token * hidden]`)
    pub fn decode(&self, embedding: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let device = self.model.device();
        let soft = self.soft_prefix(embedding)?;
        let labels = labels.to_dtype(DType::U32)?.to_device(device)?;
        let label_rows: Vec<Vec<u32>> = labels.to_vec2()?;
        anyhow::ensure!(
            label_rows.len() == soft.dim(0)?,
            "Embedding has {} rows but labels have {}",
            soft.dim(0)?,
            label_rows.len()
        );

        let label_embeds = self.model.embed_tokens(&labels)?;
        let total = Tensor::cat(&[&soft, &label_embeds], 1)?;

        let attention = prefixed_attention(self.num_soft_token, &label_rows, PAD_TOKEN_ID);
        let targets = prefixed_labels(self.num_soft_token, &label_rows, PAD_TOKEN_ID);

        let request = ForwardRequest::embeds(&total)
            .with_attention(AttentionConfig::new(rows_to_tensor(&attention, device)?));
        self.model.loss(&request, &rows_to_tensor(&targets, device)?)
    }

    /// Greedy generation from the soft tokens alone, `max_length` positions in total
    pub fn sample(
        &self,
        embedding: &Tensor,
        max_length: usize,
        eos_token_id: Option<u32>,
    ) -> Result<Vec<Vec<u32>>> {
        let soft = self.soft_prefix(embedding)?;
        let config = GenerationConfig::greedy(max_length, eos_token_id, PAD_TOKEN_ID);
        self.model.generate(&ForwardRequest::embeds(&soft), &config)
    }
}
