//! KV-cache for batched autoregressive generation
//!
//! Stores key and value tensors from previous positions so each decoding step
//! only projects the newly appended position. Alongside the per-layer tensors
//! the cache tracks the running `[batch, seq_len]` attention mask, so padded
//! prompt positions stay masked for every later step.
//!
//! ## Memory Layout
//!
//! Each layer stores:
//! - keys: `[batch, num_kv_heads, seq_len, head_dim]`
//! - values: `[batch, num_kv_heads, seq_len, head_dim]`

use anyhow::Result;
use candle_core::{DType, Tensor};

#[derive(Debug, Clone)]
pub struct KVCache {
    /// Cached key tensors per layer
    pub keys: Vec<Option<Tensor>>,
    /// Cached value tensors per layer
    pub values: Vec<Option<Tensor>>,
    /// Attention mask over all cached positions, `[batch, seq_len]`
    attention_mask: Option<Tensor>,
}

impl KVCache {
    pub fn new(n_layers: usize) -> Self {
        Self {
            keys: vec![None; n_layers],
            values: vec![None; n_layers],
            attention_mask: None,
        }
    }

    /// Number of cached positions (0 if empty)
    pub fn seq_len(&self) -> usize {
        self.keys
            .iter()
            .find_map(|k| k.as_ref())
            .map_or(0, |k| k.dim(2).unwrap_or(0))
    }

    pub fn layer_mut(&mut self, layer: usize) -> (&mut Option<Tensor>, &mut Option<Tensor>) {
        (&mut self.keys[layer], &mut self.values[layer])
    }

    /// Append mask columns for `new_mask` (`[batch, new_len]`) and return the full mask
    pub fn extend_mask(&mut self, new_mask: &Tensor) -> Result<Tensor> {
        let new_mask = new_mask.to_dtype(DType::U8)?;
        let full = match self.attention_mask.take() {
            Some(prev) => Tensor::cat(&[&prev, &new_mask], 1)?,
            None => new_mask,
        };
        self.attention_mask = Some(full.clone());
        Ok(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_new_cache() {
        let cache = KVCache::new(4);
        assert_eq!(cache.keys.len(), 4);
        assert_eq!(cache.seq_len(), 0);
    }

    #[test]
    fn test_extend_mask() {
        let mut cache = KVCache::new(2);
        let prompt = Tensor::new(&[[0u8, 1, 1], [1, 1, 1]], &Device::Cpu).unwrap();
        let full = cache.extend_mask(&prompt).unwrap();
        assert_eq!(full.dims(), &[2, 3]);

        let step = Tensor::ones((2, 1), DType::U8, &Device::Cpu).unwrap();
        let full = cache.extend_mask(&step).unwrap();
        assert_eq!(full.dims(), &[2, 4]);
        let rows: Vec<Vec<u8>> = full.to_vec2().unwrap();
        assert_eq!(rows[0], vec![0, 1, 1, 1]);
    }

    #[test]
    fn test_layer_mut_sets_seq_len() {
        let mut cache = KVCache::new(2);
        {
            let (k, v) = cache.layer_mut(1);
            *k = Some(Tensor::zeros((1, 2, 3, 4), DType::F32, &Device::Cpu).unwrap());
            *v = Some(Tensor::zeros((1, 2, 3, 4), DType::F32, &Device::Cpu).unwrap());
        }
        assert_eq!(cache.seq_len(), 3);
    }
}
