//! Run configuration for the wrapped model
//!
//! Mirrors the option names of the training scripts that drive the wrapper,
//! but every string-valued switch is parsed into an enum up front so that an
//! unsupported value fails at load time instead of falling through a branch.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allocation::ProjModule;

/// Which parts of the model triple get built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    /// Task model + encoder + decoder + parameter layout
    #[default]
    Nesy,
    /// Task model + parameter layout only
    NesyPretrain,
    /// Any other method name: task model only
    #[serde(other)]
    Baseline,
}

impl Method {
    /// Whether encoder and decoder models are constructed
    pub fn builds_latent_models(self) -> bool {
        matches!(self, Method::Nesy)
    }

    /// Whether a parameter layout is computed at construction
    pub fn builds_allocation(self) -> bool {
        matches!(self, Method::Nesy | Method::NesyPretrain)
    }
}

impl FromStr for Method {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "nesy" => Method::Nesy,
            "nesy-pretrain" => Method::NesyPretrain,
            _ => Method::Baseline,
        })
    }
}

/// How the latent task representation conditions the task model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FuseMethod {
    /// Sparse overrides of task-model weight coordinates
    #[default]
    Delta,
    /// Soft tokens prepended to the input embeddings
    PTuning,
}

impl FromStr for FuseMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "delta" => Ok(FuseMethod::Delta),
            "p-tuning" => Ok(FuseMethod::PTuning),
            other => anyhow::bail!(
                "Unsupported fuse_method '{other}' (expected 'delta' or 'p-tuning')"
            ),
        }
    }
}

/// Latent draws per example, derived from `ebm_optim_method`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatentSampling {
    /// One latent per example
    #[default]
    Single,
    /// `num_latent_samples` Monte-Carlo latents per example
    MonteCarlo,
}

impl LatentSampling {
    pub fn from_optim_method(method: &str) -> Self {
        if method == "mc" {
            LatentSampling::MonteCarlo
        } else {
            LatentSampling::Single
        }
    }
}

/// Working numeric precision of all three models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkingDtype {
    F32,
    F16,
    #[default]
    Bf16,
}

impl From<WorkingDtype> for DType {
    fn from(value: WorkingDtype) -> Self {
        match value {
            WorkingDtype::F32 => DType::F32,
            WorkingDtype::F16 => DType::F16,
            WorkingDtype::Bf16 => DType::BF16,
        }
    }
}

/// Full configuration surface of [`crate::WrappedLlm`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NesyConfig {
    /// Base checkpoint (local directory or HuggingFace repo id)
    pub model_name_or_path: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub fuse_method: FuseMethod,
    #[serde(default = "default_lora_r")]
    pub lora_r: usize,
    #[serde(default = "default_lora_alpha")]
    pub lora_alpha: f64,
    #[serde(default = "default_lora_dropout")]
    pub lora_dropout: f32,
    /// Comma-separated adapter targets, e.g. "q_proj,v_proj"
    #[serde(default = "default_target_modules")]
    pub target_modules: String,
    /// Total allocatable scalar budget `n`
    #[serde(default = "default_latent_size")]
    pub latent_size: usize,
    /// Trailing transformer blocks eligible for delta allocation
    #[serde(default = "default_selected_layers")]
    pub selected_layers: usize,
    #[serde(default = "default_num_soft_token")]
    pub num_soft_token: usize,
    /// Generation token budget
    #[serde(default = "default_max_token")]
    pub max_token: usize,
    #[serde(default = "default_num_latent_samples")]
    pub num_latent_samples: usize,
    #[serde(default)]
    pub ebm_optim_method: String,
    #[serde(default = "default_device")]
    pub task_device: String,
    #[serde(default = "default_device")]
    pub encoder_device: String,
    #[serde(default = "default_device")]
    pub decoder_device: String,
    /// Checkpoint directory to restore adapters and layout from
    #[serde(default)]
    pub load_nesy_ckpt: Option<PathBuf>,
    #[serde(default)]
    pub dtype: WorkingDtype,
    /// Seed for the parameter-position sampler (entropy when absent)
    #[serde(default)]
    pub seed: Option<u64>,
    /// Generation temperature (0.0 = greedy)
    #[serde(default)]
    pub temperature: f32,
}

fn default_lora_r() -> usize {
    8
}

fn default_lora_alpha() -> f64 {
    32.0
}

fn default_lora_dropout() -> f32 {
    0.05
}

fn default_target_modules() -> String {
    "q_proj,v_proj".to_string()
}

/// `num_soft_token * hidden_size` for the default one soft token on a 7B Llama
fn default_latent_size() -> usize {
    4096
}

fn default_selected_layers() -> usize {
    2
}

fn default_num_soft_token() -> usize {
    1
}

fn default_max_token() -> usize {
    50
}

fn default_num_latent_samples() -> usize {
    1
}

fn default_device() -> String {
    "auto".to_string()
}

impl NesyConfig {
    /// Configuration with defaults for everything but the model path
    pub fn new(model_name_or_path: &str) -> Self {
        Self {
            model_name_or_path: model_name_or_path.to_string(),
            method: Method::default(),
            fuse_method: FuseMethod::default(),
            lora_r: default_lora_r(),
            lora_alpha: default_lora_alpha(),
            lora_dropout: default_lora_dropout(),
            target_modules: default_target_modules(),
            latent_size: default_latent_size(),
            selected_layers: default_selected_layers(),
            num_soft_token: default_num_soft_token(),
            max_token: default_max_token(),
            num_latent_samples: default_num_latent_samples(),
            ebm_optim_method: String::new(),
            task_device: default_device(),
            encoder_device: default_device(),
            decoder_device: default_device(),
            load_nesy_ckpt: None,
            dtype: WorkingDtype::default(),
            seed: None,
            temperature: 0.0,
        }
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: NesyConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject option combinations the wrapper cannot run with
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.num_soft_token > 0, "num_soft_token must be positive");
        anyhow::ensure!(
            self.num_latent_samples > 0,
            "num_latent_samples must be positive"
        );
        if self.method.builds_allocation() {
            anyhow::ensure!(self.latent_size > 0, "latent_size must be positive");
        }
        self.lora_targets()?;
        Ok(())
    }

    /// Parsed `target_modules`
    pub fn lora_targets(&self) -> Result<Vec<ProjModule>> {
        self.target_modules
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|name| {
                ProjModule::from_name(name)
                    .ok_or_else(|| anyhow::anyhow!("Unknown LoRA target module '{name}'"))
            })
            .collect()
    }

    pub fn latent_sampling(&self) -> LatentSampling {
        LatentSampling::from_optim_method(&self.ebm_optim_method)
    }

    pub fn working_dtype(&self) -> DType {
        self.dtype.into()
    }

    /// Working dtype for models placed on `devices`
    ///
    /// CPU matmul has no BF16 kernel, so BF16 becomes F32 as soon as one model sits on the CPU.
    pub fn dtype_for_devices(&self, devices: &[&Device]) -> DType {
        let dtype = self.working_dtype();
        if dtype == DType::BF16 && devices.iter().any(|d| d.is_cpu()) {
            info!("BF16 is not supported on CPU, using F32");
            return DType::F32;
        }
        dtype
    }

    /// Whether latents are read as `num_soft_token` soft-token embeddings
    pub fn latent_is_soft_prompt(&self) -> bool {
        self.method.builds_latent_models()
            || (self.method.builds_allocation() && self.fuse_method == FuseMethod::PTuning)
    }

    /// Check `latent_size` against the model width once it is known
    pub fn check_latent_width(&self, hidden_size: usize) -> Result<()> {
        if self.latent_is_soft_prompt() {
            anyhow::ensure!(
                self.latent_size == self.num_soft_token * hidden_size,
                "latent_size ({}) must equal num_soft_token ({}) x hidden_size ({hidden_size})",
                self.latent_size,
                self.num_soft_token
            );
        }
        Ok(())
    }
}

/// Parse a device string ("cpu", "cuda:1", "metal", "auto")
pub fn parse_device(spec: &str) -> Result<Device> {
    let spec = spec.trim().to_lowercase();
    let (kind, ordinal) = match spec.split_once(':') {
        Some((kind, idx)) => (
            kind.to_string(),
            idx.parse::<usize>()
                .with_context(|| format!("Invalid device ordinal in '{spec}'"))?,
        ),
        None => (spec.clone(), 0),
    };

    let device = match kind.as_str() {
        "cpu" => Device::Cpu,
        "cuda" => Device::new_cuda(ordinal)
            .with_context(|| format!("Failed to open CUDA device {ordinal}"))?,
        "metal" | "mps" => Device::new_metal(ordinal)
            .with_context(|| format!("Failed to open Metal device {ordinal}"))?,
        "auto" => match Device::cuda_if_available(ordinal) {
            Ok(dev) if dev.is_cuda() => {
                info!("Using CUDA device {}", ordinal);
                dev
            }
            _ => {
                info!("CUDA not available, using CPU");
                Device::Cpu
            }
        },
        other => anyhow::bail!("Unknown device '{other}'"),
    };
    Ok(device)
}
