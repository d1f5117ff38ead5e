//! Delta injection: latent values onto task-model weight coordinates
//!
//! [`DeltaInjector`] binds a [`ParameterAllocation`] to the task model once,
//! resolving each tensor name to a typed [`ParamKey`] and precomputing the
//! row-major flat offsets of its coordinates. Every call after that only
//! slices the caller's vector.
//!
//! Values always *replace* the weight entries at their coordinates. Two modes
//! consume an assignment:
//!
//! - virtual: [`DeltaAssignment::overrides`] builds per-call replacement
//!   weights that a forward pass uses instead of the stored ones
//! - physical: [`DeltaInjector::reset`] writes the values into the store
//!   irreversibly; [`DeltaInjector::with_applied`] writes, runs a closure and
//!   restores the previous values

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use tracing::debug;

use crate::allocation::{CoordinatePairs, ParamKey, ParameterAllocation};
use crate::model::ParamStore;

/// One allocation entry resolved against the task model
#[derive(Debug)]
struct BoundSlot {
    name: String,
    key: ParamKey,
    pairs: CoordinatePairs,
    /// Row-major flat offsets, u32 on the weight's device
    offsets: Tensor,
}

#[derive(Debug, Clone)]
pub struct DeltaInjector {
    slots: Arc<[BoundSlot]>,
    total: usize,
}

impl DeltaInjector {
    /// Resolve every allocation entry against `store`
    pub fn bind<S: ParamStore + ?Sized>(
        allocation: &ParameterAllocation,
        store: &S,
    ) -> Result<Self> {
        let slots = allocation
            .entries()
            .iter()
            .map(|entry| {
                let key = ParamKey::parse(entry.name()).with_context(|| {
                    format!("'{}' is not a projection weight name", entry.name())
                })?;
                let weight = store
                    .projection(key)
                    .with_context(|| format!("Task model has no tensor '{}'", entry.name()))?;
                let (rows, cols) = weight.dims2()?;
                let offsets = entry
                    .coordinates()
                    .row_major_offsets(rows, cols)
                    .with_context(|| format!("Invalid coordinates for '{}'", entry.name()))?;
                let count = offsets.len();
                Ok(BoundSlot {
                    name: entry.name().to_string(),
                    key,
                    pairs: entry.coordinates().clone(),
                    offsets: Tensor::from_vec(offsets, count, weight.device())?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let total = allocation.total();
        debug!("Bound {} allocation entries ({} values)", slots.len(), total);
        Ok(Self {
            slots: slots.into(),
            total,
        })
    }

    /// Number of values `allocate` consumes
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slice `delta` (`[len]` or `[1, len]`, `len >= total`) per tensor in allocation order
    ///
    /// Values past `total` are ignored.
    pub fn allocate(&self, delta: &Tensor) -> Result<DeltaAssignment> {
        let flat = match delta.rank() {
            1 => delta.clone(),
            2 if delta.dim(0)? == 1 => delta.squeeze(0)?,
            _ => anyhow::bail!(
                "Delta vector must have shape [n] or [1, n], got {:?}",
                delta.dims()
            ),
        };
        let len = flat.dim(0)?;
        anyhow::ensure!(
            len >= self.total,
            "Delta vector has {len} values but the allocation needs {}",
            self.total
        );

        let mut start = 0;
        let values = self
            .slots
            .iter()
            .map(|slot| {
                let count = slot.pairs.len();
                let slice = flat.narrow(0, start, count)?;
                start += count;
                Ok(slice)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(DeltaAssignment {
            slots: Arc::clone(&self.slots),
            values,
        })
    }

    /// Current values at every bound coordinate, as an assignment
    pub fn snapshot<S: ParamStore + ?Sized>(&self, store: &S) -> Result<DeltaAssignment> {
        let values = self
            .slots
            .iter()
            .map(|slot| {
                let weight = bound_weight(store, slot)?;
                Ok(weight.flatten_all()?.index_select(&slot.offsets, 0)?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DeltaAssignment {
            slots: Arc::clone(&self.slots),
            values,
        })
    }

    /// Write the assignment's values into the stored weights, irreversibly
    pub fn reset<S: ParamStore + ?Sized>(
        &self,
        store: &mut S,
        assignment: &DeltaAssignment,
    ) -> Result<()> {
        anyhow::ensure!(
            Arc::ptr_eq(&self.slots, &assignment.slots),
            "Assignment was produced by a different injector"
        );
        for (slot, values) in self.slots.iter().zip(&assignment.values) {
            let weight = bound_weight(store, slot)?;
            let updated = replace_at(weight, &slot.offsets, values)?.detach();
            store.replace_projection(slot.key, updated)?;
        }
        debug!("Physically applied {} delta tensors", self.slots.len());
        Ok(())
    }

    /// Apply `assignment`, run `f`, then restore the previous weight values
    ///
    /// The restore runs whether or not `f` succeeds.
    pub fn with_applied<S, T, F>(
        &self,
        store: &mut S,
        assignment: &DeltaAssignment,
        f: F,
    ) -> Result<T>
    where
        S: ParamStore + ?Sized,
        F: FnOnce(&S) -> Result<T>,
    {
        let original = self.snapshot(store)?;
        if let Err(e) = self.reset(store, assignment) {
            self.reset(store, &original)?;
            return Err(e);
        }
        let result = f(store);
        self.reset(store, &original)?;
        result
    }
}

fn bound_weight<'s, S: ParamStore + ?Sized>(store: &'s S, slot: &BoundSlot) -> Result<&'s Tensor> {
    store
        .projection(slot.key)
        .with_context(|| format!("Task model has no tensor '{}'", slot.name))
}

/// Copy of `weight` with `values` placed at row-major `offsets`
fn replace_at(weight: &Tensor, offsets: &Tensor, values: &Tensor) -> Result<Tensor> {
    let (rows, cols) = weight.dims2()?;
    let flat = weight.flatten_all()?;
    let device = flat.device();
    let values = values.to_device(device)?.to_dtype(flat.dtype())?;

    // -0.0 is the additive identity for every value, signed zeros included
    let placed = Tensor::full(-0.0f32, flat.elem_count(), device)?
        .to_dtype(flat.dtype())?
        .index_add(offsets, &values, 0)?;
    let marks = Tensor::ones(offsets.elem_count(), DType::F32, device)?;
    let hits = Tensor::zeros(flat.elem_count(), DType::F32, device)?.index_add(offsets, &marks, 0)?;

    Ok(hits.ne(0f32)?.where_cond(&placed, &flat)?.reshape((rows, cols))?)
}

/// Per-tensor `(coordinates, values)` produced by [`DeltaInjector::allocate`]
#[derive(Debug, Clone)]
pub struct DeltaAssignment {
    slots: Arc<[BoundSlot]>,
    values: Vec<Tensor>,
}

impl DeltaAssignment {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `(tensor_name, coordinate_pairs, values)` in allocation order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CoordinatePairs, &Tensor)> + '_ {
        self.slots
            .iter()
            .zip(&self.values)
            .map(|(slot, values)| (slot.name.as_str(), &slot.pairs, values))
    }

    pub fn get(&self, name: &str) -> Option<(&CoordinatePairs, &Tensor)> {
        self.iter()
            .find(|(n, _, _)| *n == name)
            .map(|(_, pairs, values)| (pairs, values))
    }

    /// All values concatenated in allocation order
    pub fn flat_values(&self) -> Result<Tensor> {
        anyhow::ensure!(!self.values.is_empty(), "Empty assignment");
        Ok(Tensor::cat(&self.values, 0)?)
    }

    /// Replacement weights for one forward call; `store` is left untouched
    pub fn overrides<S: ParamStore + ?Sized>(&self, store: &S) -> Result<WeightOverrides> {
        let weights = self
            .slots
            .iter()
            .zip(&self.values)
            .map(|(slot, values)| {
                let weight = bound_weight(store, slot)?;
                Ok((slot.key, replace_at(weight, &slot.offsets, values)?))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(WeightOverrides { weights })
    }
}

/// Weights to use instead of the stored ones during a single forward call
#[derive(Debug, Clone, Default)]
pub struct WeightOverrides {
    weights: HashMap<ParamKey, Tensor>,
}

impl WeightOverrides {
    pub fn get(&self, key: ParamKey) -> Option<&Tensor> {
        self.weights.get(&key)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Read the stored values at `pairs` of the tensor named `name`
pub fn read_coordinates<S: ParamStore + ?Sized>(
    store: &S,
    name: &str,
    pairs: &CoordinatePairs,
) -> Result<Tensor> {
    let key = ParamKey::parse(name)
        .with_context(|| format!("'{name}' is not a projection weight name"))?;
    let weight = store
        .projection(key)
        .with_context(|| format!("Task model has no tensor '{name}'"))?;
    let (rows, cols) = weight.dims2()?;
    let offsets = pairs.row_major_offsets(rows, cols)?;
    let count = offsets.len();
    let offsets = Tensor::from_vec(offsets, count, weight.device())?;
    Ok(weight.flatten_all()?.index_select(&offsets, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{specify_parameter, AllocationEntry, ParamDescriptor, ProjModule};
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Minimal in-memory store
    struct MapStore {
        weights: HashMap<ParamKey, Tensor>,
    }

    impl MapStore {
        fn new() -> Self {
            let mut weights = HashMap::new();
            let q: Vec<f32> = (0..12).map(|v| v as f32).collect();
            weights.insert(
                ParamKey::new(1, ProjModule::Q),
                Tensor::from_vec(q, (3, 4), &Device::Cpu).unwrap(),
            );
            weights.insert(
                ParamKey::new(1, ProjModule::V),
                Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap(),
            );
            Self { weights }
        }
    }

    impl ParamStore for MapStore {
        fn projection_params(&self) -> Vec<ParamDescriptor> {
            let mut params: Vec<ParamDescriptor> = self
                .weights
                .iter()
                .map(|(key, w)| {
                    let (rows, cols) = w.dims2().unwrap();
                    ParamDescriptor {
                        key: *key,
                        rows,
                        cols,
                        dtype: w.dtype(),
                    }
                })
                .collect();
            params.sort_by_key(|p| p.key);
            params
        }

        fn projection(&self, key: ParamKey) -> Option<&Tensor> {
            self.weights.get(&key)
        }

        fn replace_projection(&mut self, key: ParamKey, weight: Tensor) -> Result<()> {
            self.weights.insert(key, weight);
            Ok(())
        }
    }

    fn allocation() -> ParameterAllocation {
        ParameterAllocation::new(vec![
            AllocationEntry(
                "model.layers.1.self_attn.q_proj.weight".to_string(),
                CoordinatePairs(vec![2, 0], vec![1, 3]),
                2,
            ),
            AllocationEntry(
                "model.layers.1.self_attn.v_proj.weight".to_string(),
                CoordinatePairs(vec![1], vec![0]),
                1,
            ),
        ])
    }

    #[test]
    fn test_allocate_slices_in_order() {
        let store = MapStore::new();
        let injector = DeltaInjector::bind(&allocation(), &store).unwrap();
        assert_eq!(injector.total(), 3);

        let delta = Tensor::new(&[10f32, 20., 30., 99.], &Device::Cpu).unwrap();
        let assignment = injector.allocate(&delta).unwrap();
        assert_eq!(assignment.len(), 2);

        let names: Vec<&str> = assignment.iter().map(|(n, _, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "model.layers.1.self_attn.q_proj.weight",
                "model.layers.1.self_attn.v_proj.weight"
            ]
        );
        let (pairs, values) = assignment
            .get("model.layers.1.self_attn.q_proj.weight")
            .unwrap();
        assert_eq!(pairs, &CoordinatePairs(vec![2, 0], vec![1, 3]));
        assert_eq!(values.to_vec1::<f32>().unwrap(), vec![10., 20.]);

        // trailing value ignored
        let flat: Vec<f32> = assignment.flat_values().unwrap().to_vec1().unwrap();
        assert_eq!(flat, vec![10., 20., 30.]);
    }

    #[test]
    fn test_allocate_rejects_short_vector() {
        let store = MapStore::new();
        let injector = DeltaInjector::bind(&allocation(), &store).unwrap();
        let short = Tensor::new(&[1f32, 2.], &Device::Cpu).unwrap();
        assert!(injector.allocate(&short).is_err());

        let batched = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(injector.allocate(&batched).is_err());
        let row = Tensor::zeros((1, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(injector.allocate(&row).is_ok());
    }

    #[test]
    fn test_bind_rejects_bad_entries() {
        let store = MapStore::new();
        let unknown = ParameterAllocation::new(vec![AllocationEntry(
            "model.layers.7.mlp.up_proj.weight".to_string(),
            CoordinatePairs(vec![0], vec![0]),
            1,
        )]);
        assert!(DeltaInjector::bind(&unknown, &store).is_err());

        let out_of_range = ParameterAllocation::new(vec![AllocationEntry(
            "model.layers.1.self_attn.v_proj.weight".to_string(),
            CoordinatePairs(vec![5], vec![0]),
            1,
        )]);
        assert!(DeltaInjector::bind(&out_of_range, &store).is_err());
    }

    #[test]
    fn test_virtual_overrides_leave_store_untouched() {
        let store = MapStore::new();
        let injector = DeltaInjector::bind(&allocation(), &store).unwrap();
        let delta = Tensor::new(&[-1f32, -2., -3.], &Device::Cpu).unwrap();
        let assignment = injector.allocate(&delta).unwrap();

        let overrides = assignment.overrides(&store).unwrap();
        assert_eq!(overrides.len(), 2);
        let q = overrides.get(ParamKey::new(1, ProjModule::Q)).unwrap();
        let rows: Vec<Vec<f32>> = q.to_vec2().unwrap();
        assert_eq!(rows[2][1], -1.0);
        assert_eq!(rows[0][3], -2.0);
        assert_eq!(rows[1][1], 5.0);

        let stored: Vec<Vec<f32>> = store.weights[&ParamKey::new(1, ProjModule::Q)]
            .to_vec2()
            .unwrap();
        assert_eq!(stored[2][1], 9.0);
    }

    #[test]
    fn test_reset_roundtrip_bit_exact() {
        let mut store = MapStore::new();
        let injector = DeltaInjector::bind(&allocation(), &store).unwrap();
        let bits = |t: &Tensor| -> Vec<u32> {
            t.to_vec1::<f32>().unwrap().iter().map(|v| v.to_bits()).collect()
        };
        // Signed zeros and subnormals must survive the write unchanged
        for values in [[0.1f32, -7.25, 1e-7], [-0.0, 0.0, -1e-45], [-0.0, -0.0, -0.0]] {
            let delta = Tensor::new(&values, &Device::Cpu).unwrap();
            let assignment = injector.allocate(&delta).unwrap();

            injector.reset(&mut store, &assignment).unwrap();
            for (name, pairs, values) in assignment.iter() {
                let read = read_coordinates(&store, name, pairs).unwrap();
                assert_eq!(bits(&read), bits(values), "{name}");
            }
        }
        // untouched coordinate
        let rows: Vec<Vec<f32>> = store.weights[&ParamKey::new(1, ProjModule::V)]
            .to_vec2()
            .unwrap();
        assert_eq!(rows[0][0], 1.0);
    }

    #[test]
    fn test_with_applied_restores() {
        let mut store = MapStore::new();
        let before: Vec<Vec<f32>> = store.weights[&ParamKey::new(1, ProjModule::Q)]
            .to_vec2()
            .unwrap();
        let injector = DeltaInjector::bind(&allocation(), &store).unwrap();
        let delta = Tensor::new(&[100f32, 200., 300.], &Device::Cpu).unwrap();
        let assignment = injector.allocate(&delta).unwrap();

        let seen = injector
            .with_applied(&mut store, &assignment, |s| {
                let w: Vec<Vec<f32>> = s
                    .projection(ParamKey::new(1, ProjModule::Q))
                    .unwrap()
                    .to_vec2()?;
                Ok(w[2][1])
            })
            .unwrap();
        assert_eq!(seen, 100.0);

        let failed: Result<()> =
            injector.with_applied(&mut store, &assignment, |_| -> Result<()> {
                anyhow::bail!("boom")
            });
        assert!(failed.is_err());

        let after: Vec<Vec<f32>> = store.weights[&ParamKey::new(1, ProjModule::Q)]
            .to_vec2()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_foreign_assignment_rejected() {
        let mut store = MapStore::new();
        let a = DeltaInjector::bind(&allocation(), &store).unwrap();
        let b = DeltaInjector::bind(&allocation(), &store).unwrap();
        let delta = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        let assignment = a.allocate(&delta).unwrap();
        assert!(b.reset(&mut store, &assignment).is_err());
    }

    #[test]
    fn test_allocate_reproduces_sampled_layout() {
        let store = MapStore::new();
        let params = store.projection_params();
        let mut rng = StdRng::seed_from_u64(11);
        let layout = specify_parameter(&params, 10, &mut rng);
        let injector = DeltaInjector::bind(&layout, &store).unwrap();

        let delta: Vec<f32> = (0..injector.total()).map(|v| v as f32).collect();
        let delta = Tensor::new(delta.as_slice(), &Device::Cpu).unwrap();
        let assignment = injector.allocate(&delta).unwrap();

        for ((name, pairs, _), entry) in assignment.iter().zip(layout.entries()) {
            assert_eq!(name, entry.name());
            assert_eq!(pairs, entry.coordinates());
        }
        assert_eq!(
            assignment.flat_values().unwrap().to_vec1::<f32>().unwrap(),
            delta.to_vec1::<f32>().unwrap()
        );
    }
}
