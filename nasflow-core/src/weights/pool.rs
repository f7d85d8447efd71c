//! Shared parameter pool — arena of slots addressed by [`ParamKey`]
//!
//! Every key, including aliases of tied slots, resolves to exactly one
//! arena index. Slots are individually locked; callers that touch several
//! slots at once lock them in ascending index order.

use super::key::{ParamKey, SlotKind, SlotSpec};
use crate::error::{NasError, Result};
use nalgebra::DVector;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug)]
struct Slot {
    key: ParamKey,
    kind: SlotKind,
    value: RwLock<DVector<f64>>,
}

/// Serializable pool contents, one entry per owning slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    pub slots: Vec<SlotState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotState {
    pub key: ParamKey,
    pub kind: SlotKind,
    pub values: Vec<f64>,
}

#[derive(Debug)]
pub struct SharedParameterPool {
    slots: Vec<Slot>,
    index: HashMap<ParamKey, usize>,
    param_dim: usize,
}

impl SharedParameterPool {
    /// Allocate every declared slot. Parameters get small random values,
    /// buffers start at zero. `aliases` maps an alias key to its owner.
    pub fn allocate(
        specs: &[SlotSpec],
        aliases: &[(ParamKey, ParamKey)],
        param_dim: usize,
        init_scale: f64,
        seed: u64,
    ) -> Result<Self> {
        if param_dim == 0 {
            return Err(NasError::Config("param_dim must be positive".into()));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut slots = Vec::with_capacity(specs.len());
        let mut index = HashMap::with_capacity(specs.len());
        let alias_keys: Vec<&ParamKey> = aliases.iter().map(|(alias, _)| alias).collect();

        for spec in specs {
            if alias_keys.contains(&&spec.key) {
                continue;
            }
            if index.contains_key(&spec.key) {
                return Err(NasError::Config(format!("slot {} declared twice", spec.key)));
            }
            let value = match spec.kind {
                SlotKind::Parameter => DVector::from_fn(param_dim, |_, _| {
                    (rng.gen::<f64>() - 0.5) * 2.0 * init_scale
                }),
                SlotKind::Buffer => DVector::zeros(1),
            };
            index.insert(spec.key.clone(), slots.len());
            slots.push(Slot {
                key: spec.key.clone(),
                kind: spec.kind,
                value: RwLock::new(value),
            });
        }

        for (alias, owner) in aliases {
            let owner_idx = *index
                .get(owner)
                .ok_or_else(|| NasError::Config(format!("tied slot {} has no owner {}", alias, owner)))?;
            let alias_kind = specs
                .iter()
                .find(|s| &s.key == alias)
                .map(|s| s.kind)
                .ok_or_else(|| NasError::Config(format!("tied slot {} is not declared", alias)))?;
            let owner_kind = slots[owner_idx].kind;
            if alias_kind != owner_kind {
                return Err(NasError::Config(format!(
                    "tied slot {} is a {:?} but its owner {} is a {:?}",
                    alias, alias_kind, owner, owner_kind
                )));
            }
            index.insert(alias.clone(), owner_idx);
        }

        Ok(Self {
            slots,
            index,
            param_dim,
        })
    }

    pub fn resolve(&self, key: &ParamKey) -> Result<usize> {
        self.index
            .get(key)
            .copied()
            .ok_or_else(|| NasError::UnknownSlot(key.to_string()))
    }

    pub fn key(&self, idx: usize) -> &ParamKey {
        &self.slots[idx].key
    }

    pub fn kind(&self, idx: usize) -> SlotKind {
        self.slots[idx].kind
    }

    /// Length of a slot's vector, fixed at allocation
    pub fn width(&self, idx: usize) -> usize {
        match self.slots[idx].kind {
            SlotKind::Parameter => self.param_dim,
            SlotKind::Buffer => 1,
        }
    }

    pub fn read(&self, idx: usize) -> RwLockReadGuard<'_, DVector<f64>> {
        self.slots[idx].value.read()
    }

    /// Read-lock several slots at once; `sorted` must be ascending
    pub(crate) fn read_many(&self, sorted: &[usize]) -> Vec<RwLockReadGuard<'_, DVector<f64>>> {
        sorted.iter().map(|&i| self.slots[i].value.read()).collect()
    }

    /// Write-lock several slots at once; `sorted` must be ascending
    pub(crate) fn write_many(&self, sorted: &[usize]) -> Vec<RwLockWriteGuard<'_, DVector<f64>>> {
        sorted.iter().map(|&i| self.slots[i].value.write()).collect()
    }

    /// Number of owning slots (aliases excluded)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn param_dim(&self) -> usize {
        self.param_dim
    }

    /// Total trainable scalars
    pub fn num_params(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.kind == SlotKind::Parameter)
            .map(|s| s.value.read().len())
            .sum()
    }

    /// Consistent copy of every slot
    pub fn export(&self) -> PoolState {
        let all: Vec<usize> = (0..self.slots.len()).collect();
        let guards = self.read_many(&all);
        PoolState {
            slots: self
                .slots
                .iter()
                .zip(guards.iter())
                .map(|(slot, value)| SlotState {
                    key: slot.key.clone(),
                    kind: slot.kind,
                    values: value.iter().copied().collect(),
                })
                .collect(),
        }
    }

    /// Replace every slot from `state`; nothing changes unless the state
    /// matches this pool's layout exactly
    pub fn import(&self, state: &PoolState) -> Result<()> {
        if state.slots.len() != self.slots.len() {
            return Err(NasError::Checkpoint(format!(
                "pool layout mismatch: {} slots saved, {} allocated",
                state.slots.len(),
                self.slots.len()
            )));
        }
        for (saved, slot) in state.slots.iter().zip(&self.slots) {
            let len = slot.value.read().len();
            if saved.key != slot.key || saved.kind != slot.kind || saved.values.len() != len {
                return Err(NasError::Checkpoint(format!(
                    "pool layout mismatch at {}",
                    saved.key
                )));
            }
        }
        let all: Vec<usize> = (0..self.slots.len()).collect();
        let mut guards = self.write_many(&all);
        for (guard, saved) in guards.iter_mut().zip(&state.slots) {
            guard.copy_from_slice(&saved.values);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<SlotSpec> {
        vec![
            SlotSpec::parameter(ParamKey::common("stem")),
            SlotSpec::parameter(ParamKey::common("classifier")),
            SlotSpec::parameter(ParamKey::cell(0, 0, 0)),
            SlotSpec::buffer(ParamKey::Stats { cell: 0 }),
        ]
    }

    #[test]
    fn test_allocate_and_resolve() {
        let pool = SharedParameterPool::allocate(&specs(), &[], 4, 0.1, 3).unwrap();
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.num_params(), 12);
        let idx = pool.resolve(&ParamKey::cell(0, 0, 0)).unwrap();
        assert_eq!(pool.key(idx), &ParamKey::cell(0, 0, 0));
        assert!(pool.resolve(&ParamKey::cell(9, 0, 0)).is_err());
        let stats = pool.resolve(&ParamKey::Stats { cell: 0 }).unwrap();
        assert_eq!(pool.read(stats).len(), 1);
        assert!(pool.read(idx).iter().all(|v| v.abs() <= 0.1));
    }

    #[test]
    fn test_alias_resolves_to_owner() {
        let tied = vec![(ParamKey::common("classifier"), ParamKey::common("stem"))];
        let pool = SharedParameterPool::allocate(&specs(), &tied, 4, 0.1, 3).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(
            pool.resolve(&ParamKey::common("classifier")).unwrap(),
            pool.resolve(&ParamKey::common("stem")).unwrap()
        );
        let orphan = vec![(ParamKey::common("classifier"), ParamKey::common("head"))];
        assert!(SharedParameterPool::allocate(&specs(), &orphan, 4, 0.1, 3).is_err());
    }

    #[test]
    fn test_tie_across_slot_kinds_rejected() {
        let tied = vec![(ParamKey::Stats { cell: 0 }, ParamKey::common("stem"))];
        let err = SharedParameterPool::allocate(&specs(), &tied, 4, 0.1, 3).unwrap_err();
        assert!(matches!(err, NasError::Config(ref msg) if msg.contains("Buffer")));

        let reversed = vec![(ParamKey::common("classifier"), ParamKey::Stats { cell: 0 })];
        assert!(SharedParameterPool::allocate(&specs(), &reversed, 4, 0.1, 3).is_err());
    }

    #[test]
    fn test_export_import() {
        let a = SharedParameterPool::allocate(&specs(), &[], 4, 0.1, 1).unwrap();
        let b = SharedParameterPool::allocate(&specs(), &[], 4, 0.1, 2).unwrap();
        assert_ne!(a.export(), b.export());
        b.import(&a.export()).unwrap();
        assert_eq!(a.export(), b.export());

        let other = SharedParameterPool::allocate(&specs()[..3], &[], 4, 0.1, 1).unwrap();
        assert!(other.import(&a.export()).is_err());
    }

    #[test]
    fn test_seeded_allocation_is_reproducible() {
        let a = SharedParameterPool::allocate(&specs(), &[], 4, 0.1, 5).unwrap();
        let b = SharedParameterPool::allocate(&specs(), &[], 4, 0.1, 5).unwrap();
        assert_eq!(a.export(), b.export());
    }
}
