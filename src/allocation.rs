//! Parameter allocation: which task-model weight coordinates a latent drives
//!
//! A latent vector of size `n` is spread over the projection weights of the
//! last few transformer blocks. Each eligible tensor receives a share of `n`
//! proportional to its element count, and that many coordinates are drawn
//! uniformly without replacement.
//!
//! ## Coordinate convention
//!
//! A flat draw `f` over a tensor of shape `[rows, cols]` maps to
//! `(row, col) = (f % rows, f / rows)`, a column-major reading of the flat
//! index. Layouts saved to `params_info.json` depend on this mapping, so it
//! must not change.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::DType;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Linear projections inside a Llama block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProjModule {
    Q,
    K,
    V,
    O,
    Gate,
    Up,
    Down,
}

impl ProjModule {
    /// All projections in module order (attention first, then MLP)
    pub const ALL: [ProjModule; 7] = [
        ProjModule::Q,
        ProjModule::K,
        ProjModule::V,
        ProjModule::O,
        ProjModule::Gate,
        ProjModule::Up,
        ProjModule::Down,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProjModule::Q => "q_proj",
            ProjModule::K => "k_proj",
            ProjModule::V => "v_proj",
            ProjModule::O => "o_proj",
            ProjModule::Gate => "gate_proj",
            ProjModule::Up => "up_proj",
            ProjModule::Down => "down_proj",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ProjModule::ALL.into_iter().find(|m| m.name() == name)
    }

    /// Parent block inside a decoder layer
    pub fn block(self) -> &'static str {
        match self {
            ProjModule::Q | ProjModule::K | ProjModule::V | ProjModule::O => "self_attn",
            ProjModule::Gate | ProjModule::Up | ProjModule::Down => "mlp",
        }
    }
}

/// Stable identifier of one projection weight in the task model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamKey {
    pub layer: usize,
    pub module: ProjModule,
}

impl ParamKey {
    pub fn new(layer: usize, module: ProjModule) -> Self {
        Self { layer, module }
    }

    /// HuggingFace-style parameter name, e.g. `model.layers.3.self_attn.q_proj.weight`
    pub fn name(&self) -> String {
        format!(
            "model.layers.{}.{}.{}.weight",
            self.layer,
            self.module.block(),
            self.module.name()
        )
    }

    /// Parse a parameter name back into a key
    ///
    /// Accepts any prefix (`base_model.model.`, ...) as long as the name contains
    /// `layers.<idx>` followed somewhere by a `*_proj` component.
    pub fn parse(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split('.').collect();
        let layer = parts
            .windows(2)
            .find_map(|w| (w[0] == "layers").then(|| w[1].parse::<usize>().ok()).flatten())?;
        let module = parts.iter().find_map(|p| ProjModule::from_name(p))?;
        Some(Self { layer, module })
    }
}

impl std::fmt::Display for ParamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}:{}", self.layer, self.module.name())
    }
}

/// Shape and precision of one projection weight, as seen by the allocator
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDescriptor {
    pub key: ParamKey,
    pub rows: usize,
    pub cols: usize,
    pub dtype: DType,
}

impl ParamDescriptor {
    pub fn elem_count(&self) -> usize {
        self.rows * self.cols
    }
}

/// Row and column index sequences of equal length
///
/// Serialized as `[[rows...], [cols...]]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatePairs(pub Vec<usize>, pub Vec<usize>);

impl CoordinatePairs {
    /// Convert flat draws over a `[rows, _]` tensor into (row, col) pairs
    pub fn from_flat(flat: &[usize], rows: usize) -> Self {
        let row_idx = flat.iter().map(|&f| f % rows).collect();
        let col_idx = flat.iter().map(|&f| f / rows).collect();
        Self(row_idx, col_idx)
    }

    pub fn rows(&self) -> &[usize] {
        &self.0
    }

    pub fn cols(&self) -> &[usize] {
        &self.1
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.0.iter().copied().zip(self.1.iter().copied())
    }

    /// Row-major flat offsets into a `[rows, cols]` tensor
    pub fn row_major_offsets(&self, rows: usize, cols: usize) -> Result<Vec<u32>> {
        anyhow::ensure!(
            self.0.len() == self.1.len(),
            "Coordinate pairs have mismatched lengths ({} rows, {} cols)",
            self.0.len(),
            self.1.len()
        );
        self.iter()
            .map(|(r, c)| {
                anyhow::ensure!(
                    r < rows && c < cols,
                    "Coordinate ({r}, {c}) outside tensor of shape [{rows}, {cols}]"
                );
                u32::try_from(r * cols + c).context("Flat offset exceeds u32 range")
            })
            .collect()
    }
}

/// One tensor's share of the latent: `(tensor_name, coordinate_pairs, allocated_count)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationEntry(pub String, pub CoordinatePairs, pub usize);

impl AllocationEntry {
    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn coordinates(&self) -> &CoordinatePairs {
        &self.1
    }

    pub fn count(&self) -> usize {
        self.2
    }
}

/// Ordered layout mapping latent dimensions to weight coordinates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterAllocation {
    entries: Vec<AllocationEntry>,
}

impl ParameterAllocation {
    pub fn new(entries: Vec<AllocationEntry>) -> Self {
        Self { entries }
    }

    /// Layout that allocates nothing (soft-prompt fusion)
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[AllocationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of allocated counts: the delta-vector length `allocate` consumes
    pub fn total(&self) -> usize {
        self.entries.iter().map(AllocationEntry::count).sum()
    }

    /// Serialize in the `params_info.json` format
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.entries)?)
    }

    /// Parse `params_info.json` content
    ///
    /// An empty JSON object is accepted as an empty layout; soft-prompt runs
    /// persist their (absent) layout that way.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(json).context("params_info is not valid JSON")?;
        if value.as_object().is_some_and(serde_json::Map::is_empty) {
            return Ok(Self::empty());
        }
        let entries: Vec<AllocationEntry> =
            serde_json::from_value(value).context("params_info has an unexpected layout")?;
        for entry in &entries {
            anyhow::ensure!(
                entry.coordinates().rows().len() == entry.count()
                    && entry.coordinates().cols().len() == entry.count(),
                "params_info entry '{}' declares {} positions but stores {} rows / {} cols",
                entry.name(),
                entry.count(),
                entry.coordinates().rows().len(),
                entry.coordinates().cols().len()
            );
        }
        Ok(Self { entries })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("Malformed {}", path.display()))
    }
}

/// Projections of the last `selected_layers` blocks stored in `dtype`
pub fn eligible_params(
    params: &[ParamDescriptor],
    n_layers: usize,
    selected_layers: usize,
    dtype: DType,
) -> Vec<ParamDescriptor> {
    let first_selected = n_layers.saturating_sub(selected_layers);
    params
        .iter()
        .filter(|p| p.key.layer >= first_selected && p.key.layer < n_layers && p.dtype == dtype)
        .cloned()
        .collect()
}

/// Build a layout covering (up to floor rounding) `n` coordinates
///
/// Each tensor receives `floor(n * count / total)` positions; the rounding
/// remainder is not redistributed.
pub fn specify_parameter<R: Rng + ?Sized>(
    eligible: &[ParamDescriptor],
    n: usize,
    rng: &mut R,
) -> ParameterAllocation {
    let total: u128 = eligible.iter().map(|p| p.elem_count() as u128).sum();
    if total == 0 {
        return ParameterAllocation::empty();
    }

    let entries: Vec<AllocationEntry> = eligible
        .iter()
        .map(|param| {
            let count = param.elem_count();
            let share = ((n as u128 * count as u128) / total) as usize;
            let share = share.min(count);
            let flat = rand::seq::index::sample(rng, count, share).into_vec();
            AllocationEntry(
                param.key.name(),
                CoordinatePairs::from_flat(&flat, param.rows),
                share,
            )
        })
        .collect();

    let allocation = ParameterAllocation::new(entries);
    info!(
        "Allocated {}/{} latent dimensions over {} tensors",
        allocation.total(),
        n,
        allocation.len()
    );
    allocation
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn descriptor(layer: usize, module: ProjModule, rows: usize, cols: usize) -> ParamDescriptor {
        ParamDescriptor {
            key: ParamKey::new(layer, module),
            rows,
            cols,
            dtype: DType::F32,
        }
    }

    #[test]
    fn test_param_key_name_roundtrip() {
        let key = ParamKey::new(31, ProjModule::Down);
        assert_eq!(key.name(), "model.layers.31.mlp.down_proj.weight");
        assert_eq!(ParamKey::parse(&key.name()), Some(key));

        let peft = "base_model.model.model.layers.4.self_attn.v_proj.weight";
        assert_eq!(
            ParamKey::parse(peft),
            Some(ParamKey::new(4, ProjModule::V))
        );
        assert_eq!(ParamKey::parse("model.embed_tokens.weight"), None);
        assert_eq!(ParamKey::parse("model.layers.2.input_layernorm.weight"), None);
    }

    #[test]
    fn test_proportional_allocation() {
        let params = vec![
            descriptor(1, ProjModule::Q, 10, 30),
            descriptor(1, ProjModule::V, 70, 10),
        ];
        let mut rng = StdRng::seed_from_u64(0);
        let allocation = specify_parameter(&params, 100, &mut rng);

        assert_eq!(allocation.len(), 2);
        assert_eq!(allocation.entries()[0].count(), 30);
        assert_eq!(allocation.entries()[1].count(), 70);
        assert_eq!(allocation.total(), 100);
    }

    #[test]
    fn test_sampled_coordinates_unique_and_in_range() {
        let params = vec![
            descriptor(0, ProjModule::Q, 10, 30),
            descriptor(0, ProjModule::Up, 70, 10),
        ];
        let mut rng = StdRng::seed_from_u64(3);
        let allocation = specify_parameter(&params, 100, &mut rng);

        for (entry, param) in allocation.entries().iter().zip(&params) {
            let coords = entry.coordinates();
            assert_eq!(coords.len(), entry.count());
            let unique: HashSet<(usize, usize)> = coords.iter().collect();
            assert_eq!(unique.len(), coords.len());
            for (r, c) in coords.iter() {
                assert!(r < param.rows);
                assert!(c < param.cols);
            }
        }
    }

    #[test]
    fn test_floor_rounding_undershoots() {
        let params = vec![
            descriptor(0, ProjModule::Q, 1, 3),
            descriptor(0, ProjModule::K, 1, 3),
            descriptor(0, ProjModule::V, 1, 3),
        ];
        let mut rng = StdRng::seed_from_u64(1);
        let allocation = specify_parameter(&params, 4, &mut rng);
        // 4 * 3 / 9 = 1.33 -> 1 each
        assert_eq!(allocation.total(), 3);
        assert!(allocation.total() <= 4);
        assert!(4 - allocation.total() <= params.len());
    }

    #[test]
    fn test_column_major_mapping() {
        let coords = CoordinatePairs::from_flat(&[0, 1, 4, 5], 4);
        assert_eq!(coords.rows(), &[0, 1, 0, 1]);
        assert_eq!(coords.cols(), &[0, 0, 1, 1]);
        assert_eq!(coords.row_major_offsets(4, 2).unwrap(), vec![0, 2, 1, 3]);
        assert!(coords.row_major_offsets(1, 2).is_err());
    }

    #[test]
    fn test_eligible_params_filters_layers_and_dtype() {
        let mut params = Vec::new();
        for layer in 0..4 {
            params.push(descriptor(layer, ProjModule::Q, 4, 4));
        }
        params[3].dtype = DType::F16;

        let eligible = eligible_params(&params, 4, 2, DType::F32);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].key.layer, 2);

        let all = eligible_params(&params, 4, 10, DType::F32);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_empty_eligible_set() {
        let mut rng = StdRng::seed_from_u64(0);
        let allocation = specify_parameter(&[], 100, &mut rng);
        assert!(allocation.is_empty());
        assert_eq!(allocation.total(), 0);
    }

    #[test]
    fn test_params_info_format() {
        let allocation = ParameterAllocation::new(vec![AllocationEntry(
            "model.layers.1.self_attn.q_proj.weight".to_string(),
            CoordinatePairs(vec![2, 0], vec![1, 3]),
            2,
        )]);
        let json = allocation.to_json().unwrap();
        assert_eq!(
            json,
            r#"[["model.layers.1.self_attn.q_proj.weight",[[2,0],[1,3]],2]]"#
        );
        assert_eq!(ParameterAllocation::from_json(&json).unwrap(), allocation);
    }

    #[test]
    fn test_params_info_empty_object() {
        let allocation = ParameterAllocation::from_json("{}").unwrap();
        assert!(allocation.is_empty());
        assert!(ParameterAllocation::from_json("[[\"x\", 1]]").is_err());
        assert!(ParameterAllocation::from_json(r#"[["x", [[1],[2,3]], 1]]"#).is_err());
    }
}
