//! LLaMA forward pass with virtual weight overrides and adapter hooks
//!
//! One forward path serves every model of the triple:
//!
//! - token or embedding input (soft tokens are plain embedding rows)
//! - a `[batch, seq]` padding mask combined with the causal mask
//! - per-call projection overrides from a [`DeltaAssignment`]
//! - optional LoRA adapters on targeted projections
//! - an optional KV cache for batched generation
//!
//! Architecture: pre-norm decoder blocks, grouped-query attention with
//! rotate-half RoPE, SwiGLU MLP, no bias on any projection.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, Embedding, Linear, RmsNorm, VarBuilder};
use tracing::info;

use crate::allocation::{ParamDescriptor, ParamKey, ProjModule};
use crate::injector::{DeltaAssignment, WeightOverrides};
use crate::kv_cache::KVCache;
use crate::lora::{AdapterSet, LoraAdapter};
use crate::masks::attention_bias;
use crate::model::{
    select_token, ForwardRequest, GenerationConfig, ModelFiles, ModelInput, NesyBackend,
    ParamStore,
};

/// Model configuration (matches HuggingFace config.json for LLaMA)
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl LlamaConfig {
    pub fn kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: LlamaConfig = serde_json::from_str(&config_str)?;
        anyhow::ensure!(
            config.hidden_size % config.num_attention_heads == 0,
            "hidden_size {} is not divisible by num_attention_heads {}",
            config.hidden_size,
            config.num_attention_heads
        );
        anyhow::ensure!(
            config.num_attention_heads % config.kv_heads() == 0,
            "num_attention_heads must be a multiple of num_key_value_heads"
        );
        Ok(config)
    }
}

/// Rotary Position Embeddings (RoPE), rotate-half layout
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
    max_seq_len: usize,
}

impl RotaryEmbedding {
    fn new(
        dim: usize,
        max_seq_len: usize,
        theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq, device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::new(positions, device)?;

        // [seq_len, dim/2], duplicated to [seq_len, dim] for rotate-half
        let freqs = positions.unsqueeze(1)?.matmul(&inv_freq.unsqueeze(0)?)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
            max_seq_len,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, start_pos: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, start_pos, seq_len)?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?;

        let q_embed = apply_rotary_emb(q, &cos, &sin)?;
        let k_embed = apply_rotary_emb(k, &cos, &sin)?;

        Ok((q_embed, k_embed))
    }
}

fn apply_rotary_emb(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
    Ok((x.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?)?)
}

/// Bias-free projection with an optional adapter
struct Proj {
    key: ParamKey,
    weight: Tensor,
    lora: Option<LoraAdapter>,
}

impl Proj {
    fn load(
        vb: VarBuilder,
        key: ParamKey,
        in_dim: usize,
        out_dim: usize,
        adapters: Option<&AdapterSet>,
    ) -> Result<Self> {
        let weight = vb.pp(key.module.name()).get_with_hints(
            (out_dim, in_dim),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let lora = match adapters {
            Some(set) => set.adapter_for(key, in_dim, out_dim)?,
            None => None,
        };
        Ok(Self { key, weight, lora })
    }

    fn forward(&self, x: &Tensor, overrides: Option<&WeightOverrides>) -> Result<Tensor> {
        let weight = overrides
            .and_then(|o| o.get(self.key))
            .unwrap_or(&self.weight);
        let out = Linear::new(weight.clone(), None).forward(x)?;
        match &self.lora {
            Some(lora) => Ok((out + lora.forward(x)?)?),
            None => Ok(out),
        }
    }
}

/// Grouped-query attention
struct Attention {
    q_proj: Proj,
    k_proj: Proj,
    v_proj: Proj,
    o_proj: Proj,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(
        vb: VarBuilder,
        layer: usize,
        config: &LlamaConfig,
        adapters: Option<&AdapterSet>,
    ) -> Result<Self> {
        let head_dim = config.head_dim();
        let hidden = config.hidden_size;
        let q_dim = config.num_attention_heads * head_dim;
        let kv_dim = config.kv_heads() * head_dim;
        let key = |m| ParamKey::new(layer, m);

        Ok(Self {
            q_proj: Proj::load(vb.clone(), key(ProjModule::Q), hidden, q_dim, adapters)?,
            k_proj: Proj::load(vb.clone(), key(ProjModule::K), hidden, kv_dim, adapters)?,
            v_proj: Proj::load(vb.clone(), key(ProjModule::V), hidden, kv_dim, adapters)?,
            o_proj: Proj::load(vb, key(ProjModule::O), q_dim, hidden, adapters)?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.kv_heads(),
            head_dim,
        })
    }

    /// `bias` is `[batch|1, 1, seq, start_pos + seq]` in F32
    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        start_pos: usize,
        bias: &Tensor,
        cache: Option<(&mut Option<Tensor>, &mut Option<Tensor>)>,
        overrides: Option<&WeightOverrides>,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self.q_proj.forward(x, overrides)?;
        let k = self.k_proj.forward(x, overrides)?;
        let v = self.v_proj.forward(x, overrides)?;

        let q = q
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = k
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = v
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rotary.apply(&q, &k, start_pos)?;

        let (k, v) = match cache {
            Some((cache_k, cache_v)) => {
                let (k, v) = match (cache_k.as_ref(), cache_v.as_ref()) {
                    (Some(prev_k), Some(prev_v)) => {
                        (Tensor::cat(&[prev_k, &k], 2)?, Tensor::cat(&[prev_v, &v], 2)?)
                    }
                    _ => (k, v),
                };
                *cache_k = Some(k.clone());
                *cache_v = Some(v.clone());
                (k, v)
            }
            None => (k, v),
        };

        let k = repeat_kv(k, self.num_heads / self.num_kv_heads)?.contiguous()?;
        let v = repeat_kv(v, self.num_heads / self.num_kv_heads)?.contiguous()?;

        // Scores and softmax in F32 so the padding bias cannot overflow
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let q = q.to_dtype(DType::F32)?.contiguous()?;
        let k = k.to_dtype(DType::F32)?;
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(bias)?;
        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?.to_dtype(v.dtype())?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        self.o_proj.forward(&attn_output, overrides)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x.unsqueeze(2)?;
    let x = x.expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// SwiGLU MLP
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Proj,
    up_proj: Proj,
    down_proj: Proj,
}

impl MLP {
    fn load(
        vb: VarBuilder,
        layer: usize,
        config: &LlamaConfig,
        adapters: Option<&AdapterSet>,
    ) -> Result<Self> {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        let key = |m| ParamKey::new(layer, m);
        Ok(Self {
            gate_proj: Proj::load(vb.clone(), key(ProjModule::Gate), hidden, inter, adapters)?,
            up_proj: Proj::load(vb.clone(), key(ProjModule::Up), hidden, inter, adapters)?,
            down_proj: Proj::load(vb, key(ProjModule::Down), inter, hidden, adapters)?,
        })
    }

    fn forward(&self, x: &Tensor, overrides: Option<&WeightOverrides>) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x, overrides)?)?;
        let up = self.up_proj.forward(x, overrides)?;
        self.down_proj.forward(&(gate * up)?, overrides)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(
        vb: VarBuilder,
        layer: usize,
        config: &LlamaConfig,
        adapters: Option<&AdapterSet>,
    ) -> Result<Self> {
        let self_attn = Attention::load(vb.pp("self_attn"), layer, config, adapters)?;
        let mlp = MLP::load(vb.pp("mlp"), layer, config, adapters)?;
        let input_layernorm = candle_nn::rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("input_layernorm"),
        )?;
        let post_attention_layernorm = candle_nn::rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;

        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        start_pos: usize,
        bias: &Tensor,
        cache: Option<(&mut Option<Tensor>, &mut Option<Tensor>)>,
        overrides: Option<&WeightOverrides>,
    ) -> Result<Tensor> {
        let residual = x;
        let hidden = self.input_layernorm.forward(x)?;
        let hidden = self
            .self_attn
            .forward(&hidden, rotary, start_pos, bias, cache, overrides)?;
        let hidden = (residual + hidden)?;

        let residual = &hidden;
        let out = self.post_attention_layernorm.forward(&hidden)?;
        let out = self.mlp.forward(&out, overrides)?;
        Ok((residual + out)?)
    }

    fn proj(&self, module: ProjModule) -> &Proj {
        match module {
            ProjModule::Q => &self.self_attn.q_proj,
            ProjModule::K => &self.self_attn.k_proj,
            ProjModule::V => &self.self_attn.v_proj,
            ProjModule::O => &self.self_attn.o_proj,
            ProjModule::Gate => &self.mlp.gate_proj,
            ProjModule::Up => &self.mlp.up_proj,
            ProjModule::Down => &self.mlp.down_proj,
        }
    }

    fn proj_mut(&mut self, module: ProjModule) -> &mut Proj {
        match module {
            ProjModule::Q => &mut self.self_attn.q_proj,
            ProjModule::K => &mut self.self_attn.k_proj,
            ProjModule::V => &mut self.self_attn.v_proj,
            ProjModule::O => &mut self.self_attn.o_proj,
            ProjModule::Gate => &mut self.mlp.gate_proj,
            ProjModule::Up => &mut self.mlp.up_proj,
            ProjModule::Down => &mut self.mlp.down_proj,
        }
    }
}

/// LLaMA causal LM used for the task, encoder and decoder roles
pub struct NesyLlama {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    config: LlamaConfig,
    dtype: DType,
    device: Device,
}

impl NesyLlama {
    /// Build from a var builder rooted at the checkpoint top level
    pub fn new(vb: VarBuilder, config: &LlamaConfig, adapters: Option<&AdapterSet>) -> Result<Self> {
        let dtype = vb.dtype();
        let device = vb.device().clone();
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(
                vb_model.pp(format!("layers.{i}")),
                i,
                config,
                adapters,
            )?);
        }

        let norm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        let rotary = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            &device,
            dtype,
        )?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            config: config.clone(),
            dtype,
            device,
        })
    }

    /// Load pretrained weights, attaching `adapters` to targeted projections
    pub fn load(
        files: &ModelFiles,
        device: &Device,
        dtype: DType,
        adapters: Option<&AdapterSet>,
    ) -> Result<Self> {
        let config = LlamaConfig::from_file(&files.config)?;
        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.num_hidden_layers, config.hidden_size, config.vocab_size
        );
        info!("Loading weights from {} file(s)...", files.weights.len());

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device)? };
        let model = Self::new(vb, &config, adapters)?;

        info!(
            "Model loaded successfully with {} layers on {:?} ({:?})",
            config.num_hidden_layers, device, dtype
        );
        Ok(model)
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    /// Element count of all base (non-adapter) weights
    pub fn base_param_count(&self) -> usize {
        let projections: usize = self
            .projection_params()
            .iter()
            .map(ParamDescriptor::elem_count)
            .sum();
        let norms = (2 * self.layers.len() + 1) * self.config.hidden_size;
        let embeddings = self.embed_tokens.embeddings().elem_count();
        let head = if self.config.tie_word_embeddings {
            0
        } else {
            self.lm_head.weight().elem_count()
        };
        projections + norms + embeddings + head
    }

    pub fn new_kv_cache(&self) -> KVCache {
        KVCache::new(self.layers.len())
    }

    fn input_embeds(&self, input: &ModelInput<'_>) -> Result<Tensor> {
        match input {
            ModelInput::Tokens(ids) => {
                let ids = ids.to_device(&self.device)?;
                Ok(self.embed_tokens.forward(&ids)?)
            }
            ModelInput::Embeds(embeds) => {
                let (_, _, hidden) = embeds.dims3()?;
                anyhow::ensure!(
                    hidden == self.config.hidden_size,
                    "Input embeddings have width {hidden}, model hidden size is {}",
                    self.config.hidden_size
                );
                Ok(embeds.to_device(&self.device)?.to_dtype(self.dtype)?)
            }
        }
    }

    fn overrides_for(&self, delta: Option<&DeltaAssignment>) -> Result<Option<WeightOverrides>> {
        delta.map(|d| d.overrides(self)).transpose()
    }

    /// Run the decoder stack, returning final-norm hidden states `[batch, seq, hidden]`
    fn forward_hidden(
        &self,
        embeds: &Tensor,
        mask: Option<&Tensor>,
        overrides: Option<&WeightOverrides>,
        mut cache: Option<&mut KVCache>,
    ) -> Result<Tensor> {
        let (batch, q_len, _) = embeds.dims3()?;
        let start_pos = cache.as_ref().map_or(0, |c| c.seq_len());
        anyhow::ensure!(
            start_pos + q_len <= self.rotary.max_seq_len,
            "Sequence of {} positions exceeds max_position_embeddings {}",
            start_pos + q_len,
            self.rotary.max_seq_len
        );

        let mask = mask.map(|m| m.to_device(&self.device)).transpose()?;
        if let Some(m) = &mask {
            anyhow::ensure!(
                m.dims2()? == (batch, q_len),
                "Attention mask shape {:?} does not match input [{batch}, {q_len}]",
                m.dims()
            );
        }
        let full_mask = match cache.as_deref_mut() {
            Some(c) => {
                let step = match mask {
                    Some(m) => m,
                    None => Tensor::ones((batch, q_len), DType::U8, &self.device)?,
                };
                Some(c.extend_mask(&step)?)
            }
            None => mask,
        };
        let bias = attention_bias(q_len, start_pos, full_mask.as_ref(), &self.device, DType::F32)?;

        let mut hidden = embeds.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            let layer_cache = cache.as_deref_mut().map(|c| c.layer_mut(i));
            hidden = layer.forward(&hidden, &self.rotary, start_pos, &bias, layer_cache, overrides)?;
        }
        Ok(self.norm.forward(&hidden)?)
    }

    fn last_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let seq_len = hidden.dim(1)?;
        let last = hidden.i((.., seq_len - 1, ..))?;
        Ok(self.lm_head.forward(&last)?.to_dtype(DType::F32)?)
    }
}

impl ParamStore for NesyLlama {
    fn projection_params(&self) -> Vec<ParamDescriptor> {
        self.layers
            .iter()
            .flat_map(|layer| ProjModule::ALL.into_iter().map(move |m| layer.proj(m)))
            .filter_map(|proj| {
                let (rows, cols) = proj.weight.dims2().ok()?;
                Some(ParamDescriptor {
                    key: proj.key,
                    rows,
                    cols,
                    dtype: proj.weight.dtype(),
                })
            })
            .collect()
    }

    fn projection(&self, key: ParamKey) -> Option<&Tensor> {
        self.layers
            .get(key.layer)
            .map(|layer| &layer.proj(key.module).weight)
    }

    fn replace_projection(&mut self, key: ParamKey, weight: Tensor) -> Result<()> {
        let layer = self
            .layers
            .get_mut(key.layer)
            .with_context(|| format!("No layer {} in model", key.layer))?;
        let proj = layer.proj_mut(key.module);
        anyhow::ensure!(
            proj.weight.dims() == weight.dims() && proj.weight.dtype() == weight.dtype(),
            "Replacement for {key} has shape {:?}/{:?}, expected {:?}/{:?}",
            weight.dims(),
            weight.dtype(),
            proj.weight.dims(),
            proj.weight.dtype()
        );
        anyhow::ensure!(
            proj.weight.device().same_device(weight.device()),
            "Replacement for {key} is on a different device"
        );
        proj.weight = weight;
        Ok(())
    }
}

impl NesyBackend for NesyLlama {
    fn n_layers(&self) -> usize {
        self.layers.len()
    }

    fn d_model(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn embed_tokens(&self, ids: &Tensor) -> Result<Tensor> {
        Ok(self.embed_tokens.forward(&ids.to_device(&self.device)?)?)
    }

    fn hidden_states(&self, request: &ForwardRequest<'_>) -> Result<Tensor> {
        let embeds = self.input_embeds(&request.input)?;
        let overrides = self.overrides_for(request.delta)?;
        self.forward_hidden(
            &embeds,
            request.attention.mask.as_ref(),
            overrides.as_ref(),
            None,
        )
    }

    fn logits(&self, request: &ForwardRequest<'_>) -> Result<Tensor> {
        let hidden = self.hidden_states(request)?;
        Ok(self.lm_head.forward(&hidden)?)
    }

    fn generate(
        &self,
        request: &ForwardRequest<'_>,
        config: &GenerationConfig,
    ) -> Result<Vec<Vec<u32>>> {
        let overrides = self.overrides_for(request.delta)?;
        let embeds = self.input_embeds(&request.input)?;
        let (batch, prefill, _) = embeds.dims3()?;
        anyhow::ensure!(prefill > 0, "Generation needs at least one prompt position");

        let max_new = config.max_length.saturating_sub(prefill);
        let mut outputs: Vec<Vec<u32>> = vec![Vec::with_capacity(max_new); batch];
        if max_new == 0 {
            return Ok(outputs);
        }

        let mut cache = self.new_kv_cache();
        let hidden = self.forward_hidden(
            &embeds,
            request.attention.mask.as_ref(),
            overrides.as_ref(),
            Some(&mut cache),
        )?;
        let mut logits = self.last_logits(&hidden)?;

        let mut finished = vec![false; batch];
        let mut rng = rand::thread_rng();

        for step in 0..max_new {
            let rows: Vec<Vec<f32>> = logits.to_vec2()?;
            let mut next = Vec::with_capacity(batch);
            for (row, row_logits) in rows.iter().enumerate() {
                let token = if finished[row] {
                    config.pad_token_id
                } else {
                    select_token(row_logits, config.temperature, &mut rng)?
                };
                if Some(token) == config.eos_token_id {
                    finished[row] = true;
                }
                outputs[row].push(token);
                next.push(token);
            }

            if finished.iter().all(|&f| f) || step + 1 == max_new {
                break;
            }

            let ids = Tensor::new(next.as_slice(), &self.device)?.unsqueeze(1)?;
            let step_embeds = self.embed_tokens.forward(&ids)?;
            let hidden =
                self.forward_hidden(&step_embeds, None, overrides.as_ref(), Some(&mut cache))?;
            logits = self.last_logits(&hidden)?;
        }

        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttentionConfig;
    use candle_nn::VarMap;

    fn tiny_config() -> LlamaConfig {
        LlamaConfig {
            hidden_size: 16,
            intermediate_size: 32,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            num_hidden_layers: 2,
            vocab_size: 24,
            rope_theta: 10_000.0,
            rms_norm_eps: 1e-5,
            max_position_embeddings: 64,
            tie_word_embeddings: false,
        }
    }

    fn tiny_model() -> NesyLlama {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        NesyLlama::new(vb, &tiny_config(), None).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_projection_params_layout() {
        let model = tiny_model();
        let params = model.projection_params();
        assert_eq!(params.len(), 2 * 7);
        assert_eq!(params[0].key, ParamKey::new(0, ProjModule::Q));
        assert_eq!((params[0].rows, params[0].cols), (16, 16));
        // k_proj: 2 kv heads * head_dim 4
        assert_eq!((params[1].rows, params[1].cols), (8, 16));
        assert_eq!((params[6].rows, params[6].cols), (16, 32));
        assert!(model.base_param_count() > 0);
    }

    #[test]
    fn test_logits_shape_and_embeds_equivalence() {
        let model = tiny_model();
        let ids = Tensor::new(&[[3u32, 4, 5], [6, 7, 8]], &Device::Cpu).unwrap();
        let logits = model.logits(&ForwardRequest::tokens(&ids)).unwrap();
        assert_eq!(logits.dims(), &[2, 3, 24]);

        let embeds = model.embed_tokens(&ids).unwrap();
        let from_embeds = model.logits(&ForwardRequest::embeds(&embeds)).unwrap();
        assert!(max_abs_diff(&logits, &from_embeds) < 1e-5);
    }

    #[test]
    fn test_padding_mask_isolates_pad_positions() {
        let model = tiny_model();
        // Left padding: real positions must not depend on the padded token
        let a = Tensor::new(&[[0u32, 4, 5]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[9u32, 4, 5]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[0u8, 1, 1]], &Device::Cpu).unwrap();
        let la = model
            .logits(&ForwardRequest::tokens(&a).with_attention(AttentionConfig::new(mask.clone())))
            .unwrap();
        let lb = model
            .logits(&ForwardRequest::tokens(&b).with_attention(AttentionConfig::new(mask)))
            .unwrap();
        assert!(max_abs_diff(&la.narrow(1, 1, 2).unwrap(), &lb.narrow(1, 1, 2).unwrap()) < 1e-5);
    }

    #[test]
    fn test_left_pad_mask_produces_finite_output() {
        let model = tiny_model();
        let ids = Tensor::new(&[[0u32, 0, 5]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[0u8, 0, 1]], &Device::Cpu).unwrap();
        let logits = model
            .logits(&ForwardRequest::tokens(&ids).with_attention(AttentionConfig::new(mask)))
            .unwrap();
        let values: Vec<f32> = logits.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_replace_projection_checks_shape() {
        let mut model = tiny_model();
        let key = ParamKey::new(1, ProjModule::V);
        let zeros = Tensor::zeros((8, 16), DType::F32, &Device::Cpu).unwrap();
        model.replace_projection(key, zeros).unwrap();
        let stored = model.projection(key).unwrap();
        assert_eq!(stored.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);

        let wrong = Tensor::zeros((16, 16), DType::F32, &Device::Cpu).unwrap();
        assert!(model.replace_projection(key, wrong).is_err());
        assert!(model.projection(ParamKey::new(5, ProjModule::Q)).is_none());
    }

    #[test]
    fn test_generate_matches_full_forward() {
        let model = tiny_model();
        let ids = Tensor::new(&[[3u32, 4, 5]], &Device::Cpu).unwrap();
        let config = GenerationConfig::greedy(6, None, 0);
        let generated = model
            .generate(&ForwardRequest::tokens(&ids), &config)
            .unwrap();
        assert_eq!(generated.len(), 1);
        assert_eq!(generated[0].len(), 3);

        // Greedy cached decoding agrees with recomputing the full sequence
        let mut seq = vec![3u32, 4, 5];
        for _ in 0..3 {
            let input = Tensor::new(seq.as_slice(), &Device::Cpu)
                .unwrap()
                .unsqueeze(0)
                .unwrap();
            let logits = model.logits(&ForwardRequest::tokens(&input)).unwrap();
            let last: Vec<f32> = logits
                .i((0, seq.len() - 1))
                .unwrap()
                .to_vec1()
                .unwrap();
            let mut rng = rand::thread_rng();
            seq.push(select_token(&last, 0.0, &mut rng).unwrap());
        }
        assert_eq!(generated[0], seq[3..].to_vec());
    }

    #[test]
    fn test_generate_budget_exhausted_by_prompt() {
        let model = tiny_model();
        let ids = Tensor::new(&[[3u32, 4, 5]], &Device::Cpu).unwrap();
        let config = GenerationConfig::greedy(2, None, 0);
        let generated = model
            .generate(&ForwardRequest::tokens(&ids), &config)
            .unwrap();
        assert!(generated[0].is_empty());
    }

    #[test]
    fn test_generate_rejects_empty_prompt() {
        let model = tiny_model();
        let embeds = Tensor::zeros((1, 0, 16), DType::F32, &Device::Cpu).unwrap();
        let config = GenerationConfig::greedy(4, None, 0);
        let err = model
            .generate(&ForwardRequest::embeds(&embeds), &config)
            .unwrap_err();
        assert!(err.to_string().contains("at least one prompt position"));
    }

    #[test]
    fn test_rejects_wrong_embed_width() {
        let model = tiny_model();
        let embeds = Tensor::zeros((1, 2, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(model.logits(&ForwardRequest::embeds(&embeds)).is_err());
    }
}
