//! Attention masks and loss labels
//!
//! Two families of helpers live here:
//!
//! - additive attention biases (causal, KV-cache generation, key padding) that
//!   the forward pass adds to raw attention scores
//! - host-side builders for the label and attention rows used when soft tokens
//!   or prompt tokens are prepended to a target sequence
//!
//! ## Caching Strategy
//!
//! Causal masks are cached by `(seq_len, device, dtype)` to avoid recreating
//! the same tensor on every forward pass. Cache hits are shallow clones.

use anyhow::Result;
use candle_core::{DType, Device, DeviceLocation, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

/// Label value excluded from the loss
pub const IGNORE_INDEX: i64 = -100;

/// Additive bias for padded key positions
///
/// Finite so that a query row whose visible keys are all padding still
/// produces a valid softmax.
pub const PAD_BIAS: f64 = -1e9;

type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, DeviceLocation, DType), Tensor>>>;

static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Cached causal mask of shape `[1, 1, seq_len, seq_len]` (0 visible, -inf hidden)
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (seq_len, device.location(), dtype);

    {
        let cache = CAUSAL_MASK_CACHE.lock().unwrap();
        if let Some(cached) = cache.get(&cache_key) {
            return Ok(cached.clone());
        }
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask_tensor = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    CAUSAL_MASK_CACHE
        .lock()
        .unwrap()
        .insert(cache_key, mask_tensor.clone());

    Ok(mask_tensor)
}

/// Causal mask for `new_seq_len` queries appended after `start_pos` cached positions
///
/// Shape `[1, 1, new_seq_len, start_pos + new_seq_len]`.
pub fn create_generation_mask(
    new_seq_len: usize,
    start_pos: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let total_seq_len = start_pos + new_seq_len;
    if start_pos == 0 {
        return create_causal_mask(new_seq_len, device, dtype);
    }
    if new_seq_len == 1 {
        return Ok(Tensor::zeros((1, 1, 1, total_seq_len), dtype, device)?);
    }

    let mask: Vec<f32> = (0..new_seq_len)
        .flat_map(|i| {
            let visible_up_to = start_pos + i;
            (0..total_seq_len).map(move |j| {
                if j <= visible_up_to {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();

    Ok(Tensor::from_vec(mask, (1, 1, new_seq_len, total_seq_len), device)?.to_dtype(dtype)?)
}

/// Key-padding bias `[batch, 1, 1, kv_len]` from a `[batch, kv_len]` 0/1 mask
pub fn padding_bias(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch, kv_len) = attention_mask.dims2()?;
    let keep = attention_mask.to_dtype(DType::F32)?;
    let bias = ((keep.ones_like()? - keep)? * PAD_BIAS)?;
    Ok(bias.reshape((batch, 1, 1, kv_len))?.to_dtype(dtype)?)
}

/// Combined causal + padding bias `[batch, 1, q_len, start_pos + q_len]`
pub fn attention_bias(
    q_len: usize,
    start_pos: usize,
    attention_mask: Option<&Tensor>,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let causal = create_generation_mask(q_len, start_pos, device, dtype)?;
    match attention_mask {
        Some(mask) => {
            let kv_len = mask.dim(1)?;
            anyhow::ensure!(
                kv_len == start_pos + q_len,
                "Attention mask covers {kv_len} positions, expected {}",
                start_pos + q_len
            );
            Ok(causal.broadcast_add(&padding_bias(mask, dtype)?)?)
        }
        None => Ok(causal),
    }
}

/// 0/1 rows marking non-pad tokens
pub fn token_mask(ids: &[Vec<u32>], pad_id: u32) -> Vec<Vec<u8>> {
    ids.iter()
        .map(|row| row.iter().map(|&t| u8::from(t != pad_id)).collect())
        .collect()
}

/// Attention rows with `prefix_len` always-visible positions before `ids`
pub fn prefixed_attention(prefix_len: usize, ids: &[Vec<u32>], pad_id: u32) -> Vec<Vec<u8>> {
    token_mask(ids, pad_id)
        .into_iter()
        .map(|row| {
            let mut full = vec![1u8; prefix_len];
            full.extend(row);
            full
        })
        .collect()
}

/// Label rows: `prefix_len` ignored positions, then `targets` with pad ids ignored
///
/// Any target token equal to `pad_id` is ignored, not only trailing padding.
pub fn prefixed_labels(prefix_len: usize, targets: &[Vec<u32>], pad_id: u32) -> Vec<Vec<i64>> {
    targets
        .iter()
        .map(|row| {
            let mut labels = vec![IGNORE_INDEX; prefix_len];
            labels.extend(row.iter().map(|&t| {
                if t == pad_id {
                    IGNORE_INDEX
                } else {
                    i64::from(t)
                }
            }));
            labels
        })
        .collect()
}

/// Stack equal-length rows into a `[batch, len]` tensor
pub fn rows_to_tensor<T: candle_core::WithDType>(rows: &[Vec<T>], device: &Device) -> Result<Tensor> {
    let batch = rows.len();
    let len = rows.first().map_or(0, Vec::len);
    anyhow::ensure!(
        rows.iter().all(|r| r.len() == len),
        "Rows have unequal lengths"
    );
    let flat: Vec<T> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (batch, len), device)?)
}

/// Clear all cached masks
pub fn clear_mask_caches() {
    CAUSAL_MASK_CACHE.lock().unwrap().clear();
}

/// Number of cached causal masks
pub fn mask_cache_size() -> usize {
    CAUSAL_MASK_CACHE.lock().unwrap().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_causal_mask_values() {
        let mask = create_causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();

        assert_eq!(data[0], 0.0);
        assert!(data[1].is_infinite() && data[1] < 0.0);
        assert_eq!(data[3], 0.0);
        assert_eq!(data[4], 0.0);
        assert!(data[5].is_infinite());
        assert!(data[6..].iter().all(|&v| v == 0.0));
    }

    #[test]
    #[serial]
    fn test_causal_mask_caching() {
        clear_mask_caches();
        assert_eq!(mask_cache_size(), 0);

        let _a = create_causal_mask(4, &Device::Cpu, DType::F32).unwrap();
        let _b = create_causal_mask(4, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_size(), 1);

        let _c = create_causal_mask(8, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_size(), 2);
    }

    #[test]
    #[serial]
    fn test_generation_mask_multi_token() {
        // 2 new tokens after 3 cached
        let mask = create_generation_mask(2, 3, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 2, 5]);
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        assert!(data[..4].iter().all(|&v| v == 0.0));
        assert!(data[4].is_infinite());
        assert!(data[5..].iter().all(|&v| v == 0.0));

        let single = create_generation_mask(1, 4, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(single.dims(), &[1, 1, 1, 5]);
    }

    #[test]
    #[serial]
    fn test_attention_bias_masks_padding() {
        let mask = Tensor::new(&[[0u8, 1, 1], [1, 1, 1]], &Device::Cpu).unwrap();
        let bias = attention_bias(3, 0, Some(&mask), &Device::Cpu, DType::F32).unwrap();
        assert_eq!(bias.dims(), &[2, 1, 3, 3]);

        let rows: Vec<Vec<f32>> = bias.flatten_from(1).unwrap().to_vec2().unwrap();
        // batch 0, query 2: key 0 padded, keys 1 and 2 visible
        assert_eq!(rows[0][6], PAD_BIAS as f32);
        assert_eq!(rows[0][7], 0.0);
        assert_eq!(rows[0][8], 0.0);
        // batch 1, query 2: everything visible
        assert!(rows[1][6..9].iter().all(|&v| v == 0.0));

        let wrong = Tensor::new(&[[1u8, 1]], &Device::Cpu).unwrap();
        assert!(attention_bias(3, 0, Some(&wrong), &Device::Cpu, DType::F32).is_err());
    }

    #[test]
    fn test_prefixed_labels_mask_soft_tokens_and_pads() {
        let labels = prefixed_labels(2, &[vec![5, 0, 0], vec![7, 8, 0]], 0);
        assert_eq!(labels[0], vec![-100, -100, 5, -100, -100]);
        assert_eq!(labels[1], vec![-100, -100, 7, 8, -100]);

        // pad-valued tokens in the middle of a target are ignored too
        let labels = prefixed_labels(0, &[vec![3, 0, 4]], 0);
        assert_eq!(labels[0], vec![3, -100, 4]);
    }

    #[test]
    fn test_prefixed_attention() {
        let attention = prefixed_attention(2, &[vec![5, 0, 0], vec![7, 8, 0]], 0);
        assert_eq!(attention[0], vec![1, 1, 1, 0, 0]);
        assert_eq!(attention[1], vec![1, 1, 1, 1, 0]);
    }

    #[test]
    fn test_rows_to_tensor() {
        let t = rows_to_tensor(&[vec![1i64, 2], vec![3, 4]], &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[2, 2]);
        assert!(rows_to_tensor(&[vec![1i64], vec![3, 4]], &Device::Cpu).is_err());
    }
}
