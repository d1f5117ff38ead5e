//! Conditioning the frozen task model on a latent task representation
//!
//! Two strategies share the [`Fusion`] contract:
//!
//! - [`DeltaFusion`] turns the latent into sparse weight overrides through a
//!   bound [`DeltaInjector`]; the task model applies them virtually per call
//! - [`SoftPromptFusion`] reshapes the latent into soft-token embeddings that
//!   are prepended to the input

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use tracing::{debug, warn};

use crate::config::{FuseMethod, LatentSampling, NesyConfig};
use crate::injector::DeltaInjector;
use crate::masks::{prefixed_attention, prefixed_labels, rows_to_tensor, token_mask};
use crate::model::{AttentionConfig, ForwardRequest, GenerationConfig, NesyBackend};
use crate::tokenizer::{NesyTokenizer, PAD_TOKEN_ID};

/// Solve/predict contract shared by both strategies
pub trait Fusion {
    /// Teacher-forced task loss of `y_id` given `x_id` under `latent`
    ///
    /// `reduce = false` returns one summed loss per row.
    fn solve(
        &self,
        model: &dyn NesyBackend,
        x_id: &Tensor,
        y_id: &Tensor,
        latent: &Tensor,
        reduce: bool,
    ) -> Result<Tensor>;

    /// Generated text for the prompts in `x_id` (left padded)
    fn predict(
        &self,
        model: &dyn NesyBackend,
        tokenizer: &NesyTokenizer,
        x_id: &Tensor,
        latent: Option<&Tensor>,
    ) -> Result<Vec<String>>;
}

/// Generation budget and sampling shared by both strategies
#[derive(Debug, Clone, Copy)]
pub struct GenerationBudget {
    /// Tokens allowed beyond the prompt length
    pub max_token: usize,
    pub temperature: f32,
}

impl GenerationBudget {
    fn for_prompt(&self, prompt_len: usize, tokenizer: &NesyTokenizer) -> GenerationConfig {
        GenerationConfig::greedy(
            prompt_len + self.max_token,
            tokenizer.eos_token_id(),
            tokenizer.pad_token_id(),
        )
        .with_temperature(self.temperature)
    }
}

/// Reshape a latent into `[rows, num_soft_token, hidden]` soft-token embeddings
pub fn soft_tokens(
    latent: &Tensor,
    rows: usize,
    num_soft_token: usize,
    hidden: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let width = num_soft_token * hidden;
    anyhow::ensure!(
        latent.elem_count() == rows * width,
        "Latent of shape {:?} cannot form {rows} rows of num_soft_token ({num_soft_token}) x hidden_size ({hidden})",
        latent.dims()
    );
    Ok(latent
        .to_device(device)?
        .to_dtype(dtype)?
        .reshape((rows, num_soft_token, hidden))?)
}

fn id_rows(ids: &Tensor) -> Result<Vec<Vec<u32>>> {
    Ok(ids.to_dtype(DType::U32)?.to_vec2()?)
}

/// `x_id ++ y_id` on the model device, with both row lists
fn concat_inputs(
    model: &dyn NesyBackend,
    x_id: &Tensor,
    y_id: &Tensor,
) -> Result<(Tensor, Vec<Vec<u32>>, Vec<Vec<u32>>)> {
    let (x_batch, _) = x_id.dims2()?;
    let (y_batch, _) = y_id.dims2()?;
    anyhow::ensure!(
        x_batch == y_batch,
        "Input batch has {x_batch} rows but output batch has {y_batch}"
    );
    let x = x_id.to_dtype(DType::U32)?.to_device(model.device())?;
    let y = y_id.to_dtype(DType::U32)?.to_device(model.device())?;
    let input = Tensor::cat(&[&x, &y], 1)?;
    Ok((input, id_rows(&x)?, id_rows(&y)?))
}

/// Sparse weight-override conditioning
#[derive(Debug, Clone)]
pub struct DeltaFusion {
    injector: DeltaInjector,
    budget: GenerationBudget,
}

impl DeltaFusion {
    pub fn new(injector: DeltaInjector, budget: GenerationBudget) -> Self {
        Self { injector, budget }
    }

    pub fn injector(&self) -> &DeltaInjector {
        &self.injector
    }
}

impl Fusion for DeltaFusion {
    fn solve(
        &self,
        model: &dyn NesyBackend,
        x_id: &Tensor,
        y_id: &Tensor,
        latent: &Tensor,
        reduce: bool,
    ) -> Result<Tensor> {
        let (input, x_rows, y_rows) = concat_inputs(model, x_id, y_id)?;
        let x_len = x_rows.first().map_or(0, Vec::len);
        let device = model.device();

        let labels = rows_to_tensor(&prefixed_labels(x_len, &y_rows, PAD_TOKEN_ID), device)?;
        let mask = token_mask(&id_rows(&input)?, PAD_TOKEN_ID);
        let mask = rows_to_tensor(&mask, device)?;

        let assignment = self.injector.allocate(latent)?;
        let request = ForwardRequest::tokens(&input)
            .with_attention(AttentionConfig::new(mask).reduce(reduce))
            .with_delta(Some(&assignment));
        model.loss(&request, &labels)
    }

    fn predict(
        &self,
        model: &dyn NesyBackend,
        tokenizer: &NesyTokenizer,
        x_id: &Tensor,
        latent: Option<&Tensor>,
    ) -> Result<Vec<String>> {
        let x = x_id.to_dtype(DType::U32)?.to_device(model.device())?;
        let (batch, prompt_len) = x.dims2()?;
        if batch > 1 {
            warn!(
                "Delta-mode prediction decodes only the first of {} rows",
                batch
            );
        }

        let assignment = latent.map(|l| self.injector.allocate(l)).transpose()?;
        if assignment.is_none() {
            debug!("No task parameters supplied, generating from the frozen model");
        }
        let mask = rows_to_tensor(&token_mask(&id_rows(&x)?, PAD_TOKEN_ID), model.device())?;
        let request = ForwardRequest::tokens(&x)
            .with_attention(AttentionConfig::new(mask))
            .with_delta(assignment.as_ref());

        let generated = model.generate(&request, &self.budget.for_prompt(prompt_len, tokenizer))?;
        let first = generated
            .first()
            .ok_or_else(|| anyhow::anyhow!("Generation returned no rows"))?;
        Ok(vec![tokenizer.decode(first)?])
    }
}

/// Soft-token (p-tuning) conditioning
#[derive(Debug, Clone)]
pub struct SoftPromptFusion {
    num_soft_token: usize,
    num_latent_samples: usize,
    sampling: LatentSampling,
    budget: GenerationBudget,
}

impl SoftPromptFusion {
    pub fn new(
        num_soft_token: usize,
        num_latent_samples: usize,
        sampling: LatentSampling,
        budget: GenerationBudget,
    ) -> Self {
        Self {
            num_soft_token,
            num_latent_samples,
            sampling,
            budget,
        }
    }

    /// Soft-token rows a latent batch expands to
    fn latent_rows(&self, latent_batch: usize) -> usize {
        match self.sampling {
            LatentSampling::MonteCarlo => latent_batch * self.num_latent_samples,
            LatentSampling::Single => latent_batch,
        }
    }
}

impl Fusion for SoftPromptFusion {
    fn solve(
        &self,
        model: &dyn NesyBackend,
        x_id: &Tensor,
        y_id: &Tensor,
        latent: &Tensor,
        reduce: bool,
    ) -> Result<Tensor> {
        let (input, x_rows, y_rows) = concat_inputs(model, x_id, y_id)?;
        let rows = self.latent_rows(latent.dim(0)?);
        anyhow::ensure!(
            x_rows.len() == rows,
            "Latent expands to {rows} soft-prompt rows but the token batch has {}",
            x_rows.len()
        );
        let device = model.device();
        let soft = soft_tokens(
            latent,
            rows,
            self.num_soft_token,
            model.d_model(),
            model.dtype(),
            device,
        )?;

        let embeds = model.embed_tokens(&input)?;
        let total = Tensor::cat(&[&soft, &embeds], 1)?;

        let x_len = x_rows.first().map_or(0, Vec::len);
        let attention = prefixed_attention(self.num_soft_token, &id_rows(&input)?, PAD_TOKEN_ID);
        let labels = prefixed_labels(self.num_soft_token + x_len, &y_rows, PAD_TOKEN_ID);

        let request = ForwardRequest::embeds(&total).with_attention(
            AttentionConfig::new(rows_to_tensor(&attention, device)?).reduce(reduce),
        );
        model.loss(&request, &rows_to_tensor(&labels, device)?)
    }

    fn predict(
        &self,
        model: &dyn NesyBackend,
        tokenizer: &NesyTokenizer,
        x_id: &Tensor,
        latent: Option<&Tensor>,
    ) -> Result<Vec<String>> {
        let latent = latent.ok_or_else(|| {
            anyhow::anyhow!("Soft-prompt prediction requires a latent task representation")
        })?;
        let x = x_id.to_dtype(DType::U32)?.to_device(model.device())?;
        let (batch, prompt_len) = x.dims2()?;
        let device = model.device();

        let soft = soft_tokens(
            latent,
            batch,
            self.num_soft_token,
            model.d_model(),
            model.dtype(),
            device,
        )?;
        let embeds = model.embed_tokens(&x)?;
        let total = Tensor::cat(&[&soft, &embeds], 1)?;
        let attention = prefixed_attention(self.num_soft_token, &id_rows(&x)?, PAD_TOKEN_ID);

        let request = ForwardRequest::embeds(&total)
            .with_attention(AttentionConfig::new(rows_to_tensor(&attention, device)?));
        let generated = model.generate(&request, &self.budget.for_prompt(prompt_len, tokenizer))?;
        tokenizer.decode_batch(&generated)
    }
}

/// Strategy selected by `fuse_method`
#[derive(Debug, Clone)]
pub enum FusionStrategy {
    Delta(DeltaFusion),
    SoftPrompt(SoftPromptFusion),
}

impl FusionStrategy {
    /// `injector` is only used by delta fusion
    pub fn from_config(config: &NesyConfig, injector: DeltaInjector) -> Self {
        let budget = GenerationBudget {
            max_token: config.max_token,
            temperature: config.temperature,
        };
        match config.fuse_method {
            FuseMethod::Delta => FusionStrategy::Delta(DeltaFusion::new(injector, budget)),
            FuseMethod::PTuning => FusionStrategy::SoftPrompt(SoftPromptFusion::new(
                config.num_soft_token,
                config.num_latent_samples,
                config.latent_sampling(),
                budget,
            )),
        }
    }

    pub fn delta(&self) -> Option<&DeltaFusion> {
        match self {
            FusionStrategy::Delta(delta) => Some(delta),
            FusionStrategy::SoftPrompt(_) => None,
        }
    }

    fn inner(&self) -> &dyn Fusion {
        match self {
            FusionStrategy::Delta(delta) => delta,
            FusionStrategy::SoftPrompt(soft) => soft,
        }
    }
}

impl Fusion for FusionStrategy {
    fn solve(
        &self,
        model: &dyn NesyBackend,
        x_id: &Tensor,
        y_id: &Tensor,
        latent: &Tensor,
        reduce: bool,
    ) -> Result<Tensor> {
        self.inner().solve(model, x_id, y_id, latent, reduce)
    }

    fn predict(
        &self,
        model: &dyn NesyBackend,
        tokenizer: &NesyTokenizer,
        x_id: &Tensor,
        latent: Option<&Tensor>,
    ) -> Result<Vec<String>> {
        self.inner().predict(model, tokenizer, x_id, latent)
    }
}
