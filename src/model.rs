//! Task-model adapter layer
//!
//! The wrapper talks to its three language models only through the traits in
//! this file. A forward call is described by an explicit [`ForwardRequest`]
//! (input tokens or embeddings, an [`AttentionConfig`], and an optional
//! [`DeltaAssignment`] of virtual weight overrides) instead of positional
//! arguments whose meaning depends on their runtime type.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, D};
use hf_hub::{api::sync::Api, Repo, RepoType};
use rand::Rng;
use tracing::info;

use crate::allocation::{ParamDescriptor, ParamKey};
use crate::injector::DeltaAssignment;

/// Read/write access to a model's projection weights
///
/// Mutation goes through `&mut self`, so a caller writing weights holds the
/// only reference to the model for the duration of the write.
pub trait ParamStore {
    /// All projection weights in model order
    fn projection_params(&self) -> Vec<ParamDescriptor>;

    /// Current value of one projection weight (`[out_features, in_features]`)
    fn projection(&self, key: ParamKey) -> Option<&Tensor>;

    /// Replace a projection weight; shape, dtype and device must match
    fn replace_projection(&mut self, key: ParamKey, weight: Tensor) -> Result<()>;
}

/// Model input: token ids `[batch, seq]` (u32) or embeddings `[batch, seq, hidden]`
#[derive(Debug, Clone, Copy)]
pub enum ModelInput<'a> {
    Tokens(&'a Tensor),
    Embeds(&'a Tensor),
}

/// Attention mask and loss reduction travelling with a forward call
#[derive(Debug, Clone)]
pub struct AttentionConfig {
    /// `[batch, seq]` 0/1 mask; `None` attends to every position
    pub mask: Option<Tensor>,
    /// Mean loss (`true`) or per-example loss (`false`)
    pub reduce: bool,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            mask: None,
            reduce: true,
        }
    }
}

impl AttentionConfig {
    pub fn new(mask: Tensor) -> Self {
        Self {
            mask: Some(mask),
            reduce: true,
        }
    }

    pub fn reduce(mut self, reduce: bool) -> Self {
        self.reduce = reduce;
        self
    }
}

/// One forward or generation call
#[derive(Debug, Clone)]
pub struct ForwardRequest<'a> {
    pub input: ModelInput<'a>,
    pub attention: AttentionConfig,
    /// Virtual weight overrides for this call only
    pub delta: Option<&'a DeltaAssignment>,
}

impl<'a> ForwardRequest<'a> {
    pub fn tokens(ids: &'a Tensor) -> Self {
        Self {
            input: ModelInput::Tokens(ids),
            attention: AttentionConfig::default(),
            delta: None,
        }
    }

    pub fn embeds(embeds: &'a Tensor) -> Self {
        Self {
            input: ModelInput::Embeds(embeds),
            attention: AttentionConfig::default(),
            delta: None,
        }
    }

    pub fn with_attention(mut self, attention: AttentionConfig) -> Self {
        self.attention = attention;
        self
    }

    pub fn with_delta(mut self, delta: Option<&'a DeltaAssignment>) -> Self {
        self.delta = delta;
        self
    }
}

/// Autoregressive generation settings
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Total length budget, prefill positions included
    pub max_length: usize,
    /// Rows stop after emitting this token
    pub eos_token_id: Option<u32>,
    /// Filler for rows that already stopped
    pub pad_token_id: u32,
    /// Sampling temperature (0.0 = greedy)
    pub temperature: f32,
}

impl GenerationConfig {
    pub fn greedy(max_length: usize, eos_token_id: Option<u32>, pad_token_id: u32) -> Self {
        Self {
            max_length,
            eos_token_id,
            pad_token_id,
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Unified backend trait for the task, encoder and decoder models
pub trait NesyBackend: ParamStore {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn vocab_size(&self) -> usize;
    fn dtype(&self) -> DType;
    fn device(&self) -> &Device;

    /// Token embeddings `[batch, seq, hidden]`
    fn embed_tokens(&self, ids: &Tensor) -> Result<Tensor>;

    /// Final-norm hidden states `[batch, seq, hidden]`
    fn hidden_states(&self, request: &ForwardRequest<'_>) -> Result<Tensor>;

    /// Vocabulary logits `[batch, seq, vocab]`
    fn logits(&self, request: &ForwardRequest<'_>) -> Result<Tensor>;

    /// Generated token ids per row (prompt excluded)
    fn generate(
        &self,
        request: &ForwardRequest<'_>,
        config: &GenerationConfig,
    ) -> Result<Vec<Vec<u32>>>;

    /// Teacher-forced causal-LM loss against `[batch, seq]` i64 labels
    fn loss(&self, request: &ForwardRequest<'_>, labels: &Tensor) -> Result<Tensor> {
        let logits = self.logits(request)?;
        causal_lm_loss(&logits, labels, request.attention.reduce)
    }
}

/// Shifted cross entropy ignoring negative labels
///
/// `reduce = true` returns the mean over all non-ignored targets (scalar);
/// `reduce = false` returns the summed negative log-likelihood per row.
pub fn causal_lm_loss(logits: &Tensor, labels: &Tensor, reduce: bool) -> Result<Tensor> {
    let (batch, seq_len, _vocab) = logits.dims3()?;
    anyhow::ensure!(
        labels.dims2()? == (batch, seq_len),
        "Labels shape {:?} does not match logits [{batch}, {seq_len}, _]",
        labels.dims()
    );
    anyhow::ensure!(seq_len >= 2, "Need at least two positions for a shifted loss");

    let logits = logits.narrow(1, 0, seq_len - 1)?.to_dtype(DType::F32)?;
    let targets = labels
        .narrow(1, 1, seq_len - 1)?
        .to_dtype(DType::I64)?
        .to_device(logits.device())?;

    let valid = targets.ge(0i64)?;
    let safe_targets = valid
        .where_cond(&targets, &targets.zeros_like()?)?
        .to_dtype(DType::U32)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs
        .gather(&safe_targets.unsqueeze(2)?.contiguous()?, 2)?
        .squeeze(2)?;
    let valid = valid.to_dtype(DType::F32)?;
    let nll = (picked.neg()? * &valid)?;

    if reduce {
        let count = valid.sum_all()?.to_scalar::<f32>()?.max(1.0);
        Ok((nll.sum_all()? / f64::from(count))?)
    } else {
        Ok(nll.sum(1)?)
    }
}

/// Pick the next token from one row of logits
pub(crate) fn select_token<R: Rng + ?Sized>(
    logits: &[f32],
    temperature: f32,
    rng: &mut R,
) -> Result<u32> {
    if temperature <= 0.0 {
        let (max_idx, _) = logits
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .ok_or_else(|| anyhow::anyhow!("Empty logits"))?;
        return Ok(max_idx as u32);
    }

    let scaled: Vec<f32> = logits.iter().map(|x| x / temperature).collect();
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();

    let r: f32 = rng.gen();
    let mut cumsum = 0.0;
    for (idx, &e) in exp_vals.iter().enumerate() {
        cumsum += e / sum;
        if r < cumsum {
            return Ok(idx as u32);
        }
    }
    Ok((exp_vals.len() - 1) as u32)
}

/// Safetensors index for sharded checkpoints
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Local paths of a checkpoint's config, tokenizer and weight shards
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Resolve `model_name_or_path` as a local directory or a HuggingFace repo id
    pub fn resolve(model_name_or_path: &str) -> Result<Self> {
        let local = Path::new(model_name_or_path);
        if local.is_dir() {
            info!("Using local checkpoint {}", local.display());
            return Self::from_fetcher(|name| {
                let path = local.join(name);
                anyhow::ensure!(path.exists(), "Missing {}", path.display());
                Ok(path)
            });
        }

        info!("Fetching checkpoint {} from HuggingFace", model_name_or_path);
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_name_or_path.to_string(), RepoType::Model));
        Self::from_fetcher(|name| {
            repo.get(name)
                .with_context(|| format!("Failed to download {name}"))
        })
    }

    fn from_fetcher(fetch: impl Fn(&str) -> Result<PathBuf>) -> Result<Self> {
        let config = fetch("config.json")?;
        let tokenizer = fetch("tokenizer.json")?;

        let weights = if let Ok(index_path) = fetch("model.safetensors.index.json") {
            let index_str =
                std::fs::read_to_string(&index_path).context("Failed to read index")?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

            let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
            shard_names.sort();
            shard_names.dedup();

            info!("Checkpoint is sharded into {} files", shard_names.len());
            shard_names
                .iter()
                .map(|name| fetch(name))
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![fetch("model.safetensors")?]
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_loss_uniform_logits() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[-100i64, 2, 3]], &device).unwrap();
        let loss = causal_lm_loss(&logits, &labels, true).unwrap();
        let value = loss.to_scalar::<f32>().unwrap();
        assert!((value - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_loss_ignores_masked_targets() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 3, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[-100i64, 1, -100], [-100, -100, -100]], &device).unwrap();

        let per_row = causal_lm_loss(&logits, &labels, false).unwrap();
        let rows: Vec<f32> = per_row.to_vec1().unwrap();
        assert!((rows[0] - 4f32.ln()).abs() < 1e-5);
        assert_eq!(rows[1], 0.0);

        let mean = causal_lm_loss(&logits, &labels, true).unwrap();
        assert!((mean.to_scalar::<f32>().unwrap() - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_loss_shape_errors() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[1i64, 2]], &device).unwrap();
        assert!(causal_lm_loss(&logits, &labels, true).is_err());

        let short = Tensor::zeros((1, 1, 4), DType::F32, &device).unwrap();
        let label = Tensor::new(&[[1i64]], &device).unwrap();
        assert!(causal_lm_loss(&short, &label, true).is_err());
    }

    #[test]
    fn test_select_token_greedy() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(select_token(&[0.1, 2.0, -1.0], 0.0, &mut rng).unwrap(), 1);
        assert!(select_token(&[], 0.0, &mut rng).is_err());
    }

    #[test]
    fn test_select_token_sampling_in_range() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..20 {
            let token = select_token(&[0.0, 1.0, 2.0], 1.0, &mut rng).unwrap();
            assert!(token < 3);
        }
    }

    #[test]
    fn test_request_builders() {
        let ids = Tensor::new(&[[1u32, 2]], &Device::Cpu).unwrap();
        let request = ForwardRequest::tokens(&ids)
            .with_attention(AttentionConfig::new(ids.ones_like().unwrap()).reduce(false));
        assert!(matches!(request.input, ModelInput::Tokens(_)));
        assert!(!request.attention.reduce);
        assert!(request.delta.is_none());
    }

    #[test]
    fn test_resolve_local_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        assert!(ModelFiles::resolve(path).is_err());

        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();
        std::fs::write(dir.path().join("model.safetensors"), "").unwrap();
        let files = ModelFiles::resolve(path).unwrap();
        assert_eq!(files.weights.len(), 1);
    }
}
