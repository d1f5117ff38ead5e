//! `WrappedLlm`: the task, encoder and decoder models behind one interface
//!
//! The wrapper exclusively owns the frozen task model. Virtual delta
//! conditioning only needs `&self`; writing latent values into the stored
//! weights needs `&mut self`, so a physical write can never interleave with
//! another call on the same wrapper.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use crate::allocation::{eligible_params, specify_parameter, ParameterAllocation};
use crate::config::{parse_device, FuseMethod, NesyConfig};
use crate::decoder::LatentDecoder;
use crate::encoder::LatentEncoder;
use crate::forward_llama::NesyLlama;
use crate::fusion::{Fusion, FusionStrategy};
use crate::injector::{DeltaAssignment, DeltaInjector};
use crate::lora::{AdapterSet, LoraSettings};
use crate::model::{ModelFiles, NesyBackend, ParamStore};
use crate::tokenizer::NesyTokenizer;

pub const ENCODER_DIR: &str = "encoder_lora";
pub const DECODER_DIR: &str = "decoder_lora";
pub const PARAMS_INFO_FILE: &str = "params_info.json";

/// The three models, each on its own device
pub struct ModelTriple {
    pub task: NesyLlama,
    pub encoder: Option<LatentEncoder>,
    pub decoder: Option<LatentDecoder>,
}

pub struct WrappedLlm {
    config: NesyConfig,
    tokenizer: NesyTokenizer,
    task_model: NesyLlama,
    encoder: Option<LatentEncoder>,
    decoder: Option<LatentDecoder>,
    param_info: ParameterAllocation,
    injector: DeltaInjector,
    fusion: FusionStrategy,
}

impl WrappedLlm {
    /// Load every model `config.method` calls for from `model_name_or_path`
    pub fn new(config: NesyConfig) -> Result<Self> {
        config.validate()?;
        let files = ModelFiles::resolve(&config.model_name_or_path)?;
        let tokenizer = NesyTokenizer::from_file(&files.tokenizer, &config.model_name_or_path)?;

        let task_device = parse_device(&config.task_device)?;
        let encoder_device = parse_device(&config.encoder_device)?;
        let decoder_device = parse_device(&config.decoder_device)?;
        let dtype = if config.method.builds_latent_models() {
            config.dtype_for_devices(&[&task_device, &encoder_device, &decoder_device])
        } else {
            config.dtype_for_devices(&[&task_device])
        };

        info!("Loading task model");
        let task = NesyLlama::load(&files, &task_device, dtype, None)?;

        let (encoder, decoder) = if config.method.builds_latent_models() {
            let settings = LoraSettings::from_config(&config)?;

            info!("Loading encoder model");
            let encoder_adapters = AdapterSet::new(settings.clone(), dtype, &encoder_device);
            let encoder_model =
                NesyLlama::load(&files, &encoder_device, dtype, Some(&encoder_adapters))?;
            let encoder = LatentEncoder::new(encoder_model, encoder_adapters, config.latent_size)?;

            info!("Loading decoder model");
            let decoder_adapters = AdapterSet::new(settings, dtype, &decoder_device);
            let decoder_model =
                NesyLlama::load(&files, &decoder_device, dtype, Some(&decoder_adapters))?;
            let decoder = LatentDecoder::new(decoder_model, decoder_adapters, config.num_soft_token);

            (Some(encoder), Some(decoder))
        } else {
            (None, None)
        };

        Self::assemble(
            config,
            tokenizer,
            ModelTriple {
                task,
                encoder,
                decoder,
            },
        )
    }

    /// Build around already constructed models
    ///
    /// Restores from `load_nesy_ckpt` for the `nesy` method, otherwise samples
    /// a fresh parameter layout when the method needs one.
    pub fn assemble(config: NesyConfig, tokenizer: NesyTokenizer, models: ModelTriple) -> Result<Self> {
        config.validate()?;
        config.check_latent_width(models.task.d_model())?;
        let param_info = ParameterAllocation::empty();
        let injector = DeltaInjector::bind(&param_info, &models.task)?;
        let fusion = FusionStrategy::from_config(&config, injector.clone());

        let mut wrapped = Self {
            config,
            tokenizer,
            task_model: models.task,
            encoder: models.encoder,
            decoder: models.decoder,
            param_info,
            injector,
            fusion,
        };

        let checkpoint = wrapped
            .config
            .load_nesy_ckpt
            .clone()
            .filter(|_| wrapped.config.method.builds_latent_models());
        if let Some(dir) = checkpoint {
            wrapped.load(&dir)?;
        } else if wrapped.config.method.builds_allocation() {
            let allocation = wrapped.specify_parameter(wrapped.config.latent_size)?;
            wrapped.set_param_info(allocation)?;
        }
        Ok(wrapped)
    }

    pub fn config(&self) -> &NesyConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &NesyTokenizer {
        &self.tokenizer
    }

    pub fn task_model(&self) -> &NesyLlama {
        &self.task_model
    }

    pub fn encoder(&self) -> Option<&LatentEncoder> {
        self.encoder.as_ref()
    }

    pub fn decoder(&self) -> Option<&LatentDecoder> {
        self.decoder.as_ref()
    }

    pub fn param_info(&self) -> &ParameterAllocation {
        &self.param_info
    }

    pub fn injector(&self) -> &DeltaInjector {
        &self.injector
    }

    pub fn fusion(&self) -> &FusionStrategy {
        &self.fusion
    }

    pub fn hidden_size(&self) -> usize {
        self.task_model.d_model()
    }

    /// Sample a layout of up to `n` task-model coordinates
    ///
    /// Soft-prompt fusion needs no coordinates and gets an empty layout.
    pub fn specify_parameter(&self, n: usize) -> Result<ParameterAllocation> {
        if self.config.fuse_method != FuseMethod::Delta {
            return Ok(ParameterAllocation::empty());
        }
        let eligible = eligible_params(
            &self.task_model.projection_params(),
            self.task_model.n_layers(),
            self.config.selected_layers,
            self.task_model.dtype(),
        );
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(specify_parameter(&eligible, n, &mut rng))
    }

    /// Replace the layout and re-bind the injector to it
    pub fn set_param_info(&mut self, allocation: ParameterAllocation) -> Result<()> {
        let injector = DeltaInjector::bind(&allocation, &self.task_model)?;
        self.fusion = FusionStrategy::from_config(&self.config, injector.clone());
        self.injector = injector;
        self.param_info = allocation;
        Ok(())
    }

    /// Slice a delta vector into per-tensor overrides
    pub fn allocate(&self, delta: &Tensor) -> Result<DeltaAssignment> {
        self.injector.allocate(delta)
    }

    /// Write `assignment` into the task model's weights, irreversibly
    pub fn reset(&mut self, assignment: &DeltaAssignment) -> Result<()> {
        self.injector.reset(&mut self.task_model, assignment)
    }

    /// Physically apply `delta`, run `f` on the modified task model, then restore it
    pub fn with_physical_delta<T, F>(&mut self, delta: &Tensor, f: F) -> Result<T>
    where
        F: FnOnce(&NesyLlama) -> Result<T>,
    {
        let assignment = self.injector.allocate(delta)?;
        self.injector
            .with_applied(&mut self.task_model, &assignment, f)
    }

    fn require_encoder(&self) -> Result<&LatentEncoder> {
        self.encoder
            .as_ref()
            .context("Encoder is only built for method 'nesy'")
    }

    fn require_decoder(&self) -> Result<&LatentDecoder> {
        self.decoder
            .as_ref()
            .context("Decoder is only built for method 'nesy'")
    }

    /// Latent task embeddings `[batch, latent_size]`
    pub fn encode(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.require_encoder()?.encode(token_ids)
    }

    /// Decoder reconstruction loss of `labels` given latent `embedding`
    pub fn decode(&self, embedding: &Tensor, labels: &Tensor) -> Result<Tensor> {
        self.require_decoder()?.decode(embedding, labels)
    }

    /// Task loss of `y_id` given `x_id` under the latent conditioning
    pub fn solve_task(
        &self,
        x_id: &Tensor,
        y_id: &Tensor,
        new_task_parameters: &Tensor,
        reduce: bool,
    ) -> Result<Tensor> {
        self.fusion
            .solve(&self.task_model, x_id, y_id, new_task_parameters, reduce)
    }

    /// Generated responses for `x_id` under optional latent conditioning
    pub fn predict_task(
        &self,
        x_id: &Tensor,
        new_task_parameters: Option<&Tensor>,
    ) -> Result<Vec<String>> {
        self.fusion
            .predict(&self.task_model, &self.tokenizer, x_id, new_task_parameters)
    }

    /// Token ids the decoder produces from `embedding` alone
    pub fn sample(&self, embedding: &Tensor) -> Result<Vec<Vec<u32>>> {
        self.require_decoder()?.sample(
            embedding,
            self.config.max_token,
            self.tokenizer.eos_token_id(),
        )
    }

    pub fn sample_text(&self, embedding: &Tensor) -> Result<Vec<String>> {
        let ids = self.sample(embedding)?;
        self.tokenizer.decode_batch(&ids)
    }

    /// Write `encoder_lora/`, `decoder_lora/` and `params_info.json` into `dir`
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        if let Some(encoder) = &self.encoder {
            encoder.adapters().save(dir.join(ENCODER_DIR))?;
        }
        if let Some(decoder) = &self.decoder {
            decoder.adapters().save(dir.join(DECODER_DIR))?;
        }
        self.param_info.save(dir.join(PARAMS_INFO_FILE))?;
        info!("Saved checkpoint to {}", dir.display());
        Ok(())
    }

    /// Restore adapters and layout written by [`WrappedLlm::save`]
    pub fn load(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        anyhow::ensure!(dir.is_dir(), "Checkpoint directory {} not found", dir.display());
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.adapters_mut().load_weights(dir.join(ENCODER_DIR))?;
        }
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.adapters_mut().load_weights(dir.join(DECODER_DIR))?;
        }
        let allocation = ParameterAllocation::load(dir.join(PARAMS_INFO_FILE))?;
        self.set_param_info(allocation)?;
        info!(
            "Restored checkpoint from {} ({} layout entries)",
            dir.display(),
            self.param_info.len()
        );
        Ok(())
    }
}
