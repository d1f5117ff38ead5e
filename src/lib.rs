// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `x_id`/`y_id`
#![allow(clippy::module_name_repetitions)] // LoraSettings in lora.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// Method style pedantic:
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::cast_sign_loss)]

//! nesy-rs: neuro-symbolic wrapper around a causal language model
//!
//! A frozen task model is conditioned on a continuous latent task
//! representation, either by overriding a sampled set of its weight
//! coordinates or by prepending soft tokens. A LoRA-adapted encoder maps
//! token sequences to latents and a LoRA-adapted decoder maps latents back
//! to text.
//!
//! ## Architecture
//!
//! - `config`: Run configuration and its enum-typed switches
//! - `allocation`: Eligible weight tensors and sampled coordinate layouts
//! - `injector`: Slicing latent vectors into per-tensor weight overrides
//! - `lora`: LoRA adapters, heads and PEFT-compatible persistence
//! - `model`: Backend traits, forward requests, loss and checkpoint resolution
//! - `forward_llama`: LLaMA forward pass with weight overrides and adapters
//! - `masks`: Causal, padding and soft-prefix attention/label masks
//! - `kv_cache`: KV-cache for autoregressive generation
//! - `tokenizer`: Tokenizer wrapper with pad/EOS conventions
//! - `encoder`: Token sequences to latent task embeddings
//! - `decoder`: Latent embeddings to reconstruction loss and samples
//! - `fusion`: Delta and soft-prompt conditioning of the task model
//! - `wrapped`: `WrappedLlm`, the model triple behind one interface

pub mod allocation;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod forward_llama;
pub mod fusion;
pub mod injector;
pub mod kv_cache;
pub mod lora;
pub mod masks;
pub mod model;
pub mod tokenizer;
pub mod wrapped;

pub use allocation::{
    eligible_params, specify_parameter, AllocationEntry, CoordinatePairs, ParamDescriptor,
    ParamKey, ParameterAllocation, ProjModule,
};
pub use config::{parse_device, FuseMethod, LatentSampling, Method, NesyConfig, WorkingDtype};
pub use decoder::LatentDecoder;
pub use encoder::{LatentEncoder, LATENT_HEAD};
pub use forward_llama::{LlamaConfig, NesyLlama};
pub use fusion::{
    soft_tokens, DeltaFusion, Fusion, FusionStrategy, GenerationBudget, SoftPromptFusion,
};
pub use injector::{read_coordinates, DeltaAssignment, DeltaInjector, WeightOverrides};
pub use kv_cache::KVCache;
pub use lora::{AdapterSet, LoraAdapter, LoraSettings};
pub use masks::{clear_mask_caches, create_causal_mask, create_generation_mask, IGNORE_INDEX};
pub use model::{
    causal_lm_loss, AttentionConfig, ForwardRequest, GenerationConfig, ModelFiles, ModelInput,
    NesyBackend, ParamStore,
};
pub use tokenizer::{NesyTokenizer, PaddingSide, TokenizerVariant, PAD_TOKEN_ID};
pub use wrapped::{ModelTriple, WrappedLlm};
