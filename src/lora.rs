//! Low-rank adapters for the encoder and decoder models
//!
//! Each targeted projection `W` gains a trainable pair `(A, B)` and computes
//! `W x + (alpha / r) * B A x`. `A` starts Kaiming-uniform and `B` starts at
//! zero, so a fresh adapter leaves the base model's output unchanged.
//!
//! All adapter tensors of one model live in a single [`VarMap`] (the
//! [`AdapterSet`]). The set persists in the PEFT directory layout:
//! `adapter_config.json` plus `adapter_model.safetensors` with tensors named
//! `base_model.model.model.layers.{i}.self_attn.q_proj.lora_A.weight`.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allocation::{ParamKey, ProjModule};
use crate::config::NesyConfig;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

const PEFT_PREFIX: &str = "base_model.model";

/// Adapter hyperparameters, stored as `adapter_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraSettings {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub lora_dropout: f32,
    pub target_modules: Vec<String>,
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
}

fn default_peft_type() -> String {
    "LORA".to_string()
}

fn default_task_type() -> String {
    "CAUSAL_LM".to_string()
}

impl LoraSettings {
    pub fn from_config(config: &NesyConfig) -> Result<Self> {
        anyhow::ensure!(config.lora_r > 0, "lora_r must be positive");
        let targets = config.lora_targets()?;
        Ok(Self {
            r: config.lora_r,
            lora_alpha: config.lora_alpha,
            lora_dropout: config.lora_dropout,
            target_modules: targets.iter().map(|m| m.name().to_string()).collect(),
            peft_type: default_peft_type(),
            task_type: default_task_type(),
        })
    }

    /// Output scaling `alpha / r`
    pub fn scale(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }

    pub fn targets(&self, module: ProjModule) -> bool {
        self.target_modules.iter().any(|t| t == module.name())
    }

    pub fn read(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(ADAPTER_CONFIG_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let settings: LoraSettings = serde_json::from_str(&content)
            .with_context(|| format!("Malformed {}", path.display()))?;
        for name in &settings.target_modules {
            anyhow::ensure!(
                ProjModule::from_name(name).is_some(),
                "Unknown LoRA target module '{name}' in {}",
                path.display()
            );
        }
        Ok(settings)
    }
}

/// Trainable low-rank update for one projection
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    lora_a: Linear,
    lora_b: Linear,
    scale: f64,
}

impl LoraAdapter {
    /// Create (or fetch) `lora_A` / `lora_B` under `vb`
    pub fn new(vb: VarBuilder, in_dim: usize, out_dim: usize, settings: &LoraSettings) -> Result<Self> {
        let a = vb.get_with_hints(
            (settings.r, in_dim),
            "lora_A.weight",
            candle_nn::init::DEFAULT_KAIMING_UNIFORM,
        )?;
        let b = vb.get_with_hints((out_dim, settings.r), "lora_B.weight", candle_nn::init::ZERO)?;
        Ok(Self {
            lora_a: Linear::new(a, None),
            lora_b: Linear::new(b, None),
            scale: settings.scale(),
        })
    }

    pub fn rank(&self) -> usize {
        self.lora_a.weight().dim(0).unwrap_or(0)
    }
}

impl Module for LoraAdapter {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let low = self.lora_a.forward(x)?;
        self.lora_b.forward(&low)? * self.scale
    }
}

/// All adapter tensors of one model, plus any extra trainable heads
pub struct AdapterSet {
    settings: LoraSettings,
    varmap: VarMap,
    dtype: DType,
    device: Device,
}

impl AdapterSet {
    pub fn new(settings: LoraSettings, dtype: DType, device: &Device) -> Self {
        Self {
            settings,
            varmap: VarMap::new(),
            dtype,
            device: device.clone(),
        }
    }

    pub fn settings(&self) -> &LoraSettings {
        &self.settings
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn var_builder(&self) -> VarBuilder<'_> {
        VarBuilder::from_varmap(&self.varmap, self.dtype, &self.device)
    }

    /// PEFT module path of a projection, without the `.weight` suffix
    pub fn module_path(key: ParamKey) -> String {
        let name = key.name();
        let module = name.strip_suffix(".weight").unwrap_or(&name);
        format!("{PEFT_PREFIX}.{module}")
    }

    /// Adapter for `key` if its module is targeted
    pub fn adapter_for(
        &self,
        key: ParamKey,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Option<LoraAdapter>> {
        if !self.settings.targets(key.module) {
            return Ok(None);
        }
        let vb = self.var_builder().pp(Self::module_path(key));
        Ok(Some(LoraAdapter::new(vb, in_dim, out_dim, &self.settings)?))
    }

    /// Trainable linear layer stored next to the adapters (e.g. `latent_head`)
    pub fn linear_head(&self, name: &str, in_dim: usize, out_dim: usize) -> Result<Linear> {
        Ok(candle_nn::linear(in_dim, out_dim, self.var_builder().pp(name))?)
    }

    /// Variables an optimizer should update
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn num_trainable(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    fn var_names(&self) -> Result<BTreeSet<String>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Adapter variable map lock poisoned"))?;
        Ok(data.keys().cloned().collect())
    }

    /// Log trainable vs total parameter counts
    pub fn log_trainable(&self, label: &str, base_params: usize) {
        let trainable = self.num_trainable();
        let total = trainable + base_params;
        let pct = if total == 0 {
            0.0
        } else {
            100.0 * trainable as f64 / total as f64
        };
        info!(
            "{}: trainable params: {} || all params: {} || trainable%: {:.4}",
            label, trainable, total, pct
        );
    }

    /// Write `adapter_config.json` and `adapter_model.safetensors` into `dir`
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let config_path = dir.join(ADAPTER_CONFIG_FILE);
        std::fs::write(&config_path, serde_json::to_string_pretty(&self.settings)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        self.varmap
            .save(&weights_path)
            .with_context(|| format!("Failed to write {}", weights_path.display()))?;

        info!("Saved adapter to {}", dir.display());
        Ok(())
    }

    /// Overwrite every created variable with the values saved in `dir`
    ///
    /// Variables must already exist (build the model on this set first); the
    /// file must provide every one of them.
    pub fn load_weights(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        anyhow::ensure!(dir.is_dir(), "Adapter directory {} not found", dir.display());

        let saved = LoraSettings::read(dir)?;
        anyhow::ensure!(
            saved.r == self.settings.r && saved.target_modules == self.settings.target_modules,
            "Adapter in {} has r={} targets={:?}, model was built with r={} targets={:?}",
            dir.display(),
            saved.r,
            saved.target_modules,
            self.settings.r,
            self.settings.target_modules
        );

        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        let bytes = std::fs::read(&weights_path)
            .with_context(|| format!("Failed to read {}", weights_path.display()))?;
        let file = safetensors::SafeTensors::deserialize(&bytes)
            .with_context(|| format!("Malformed {}", weights_path.display()))?;
        let stored: BTreeSet<String> = file.names().into_iter().cloned().collect();

        let missing: Vec<String> = self.var_names()?.difference(&stored).cloned().collect();
        anyhow::ensure!(
            missing.is_empty(),
            "{} lacks {} adapter tensors (first: {})",
            weights_path.display(),
            missing.len(),
            missing[0]
        );

        self.varmap
            .load(&weights_path)
            .with_context(|| format!("Failed to load {}", weights_path.display()))?;
        self.settings = saved;
        info!("Loaded adapter from {}", dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> LoraSettings {
        let mut config = NesyConfig::new("tiny");
        config.lora_r = 2;
        config.lora_alpha = 4.0;
        LoraSettings::from_config(&config).unwrap()
    }

    #[test]
    fn test_settings_from_config() {
        let s = settings();
        assert_eq!(s.target_modules, vec!["q_proj", "v_proj"]);
        assert_eq!(s.scale(), 2.0);
        assert!(s.targets(ProjModule::Q));
        assert!(!s.targets(ProjModule::Down));
    }

    #[test]
    fn test_module_path() {
        let key = ParamKey::new(3, ProjModule::V);
        assert_eq!(
            AdapterSet::module_path(key),
            "base_model.model.model.layers.3.self_attn.v_proj"
        );
    }

    #[test]
    fn test_fresh_adapter_is_zero() {
        let set = AdapterSet::new(settings(), DType::F32, &Device::Cpu);
        let adapter = set
            .adapter_for(ParamKey::new(0, ProjModule::Q), 4, 6)
            .unwrap()
            .unwrap();
        assert_eq!(adapter.rank(), 2);

        let x = Tensor::ones((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let out = adapter.forward(&x).unwrap();
        assert_eq!(out.dims(), &[1, 3, 6]);
        let sum = out.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(sum, 0.0);

        assert!(set
            .adapter_for(ParamKey::new(0, ProjModule::Up), 4, 6)
            .unwrap()
            .is_none());
        assert_eq!(set.num_trainable(), 2 * 4 + 6 * 2);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let key = ParamKey::new(1, ProjModule::V);

        let saved = AdapterSet::new(settings(), DType::F32, &Device::Cpu);
        saved.adapter_for(key, 4, 4).unwrap();
        let head = saved.linear_head("latent_head", 4, 3).unwrap();
        saved.save(dir.path()).unwrap();
        assert!(dir.path().join(ADAPTER_CONFIG_FILE).exists());

        let mut restored = AdapterSet::new(settings(), DType::F32, &Device::Cpu);
        restored.adapter_for(key, 4, 4).unwrap();
        let restored_head = restored.linear_head("latent_head", 4, 3).unwrap();
        restored.load_weights(dir.path()).unwrap();

        let a: Vec<Vec<f32>> = head.weight().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = restored_head.weight().to_vec2().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_rejects_missing_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let saved = AdapterSet::new(settings(), DType::F32, &Device::Cpu);
        saved.adapter_for(ParamKey::new(0, ProjModule::Q), 4, 4).unwrap();
        saved.save(dir.path()).unwrap();

        let mut restored = AdapterSet::new(settings(), DType::F32, &Device::Cpu);
        restored.adapter_for(ParamKey::new(0, ProjModule::Q), 4, 4).unwrap();
        restored.linear_head("latent_head", 4, 3).unwrap();
        assert!(restored.load_weights(dir.path()).is_err());

        let mut elsewhere = AdapterSet::new(settings(), DType::F32, &Device::Cpu);
        assert!(elsewhere.load_weights(dir.path().join("nope")).is_err());
    }
}
