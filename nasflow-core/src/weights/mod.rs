//! Weight-sharing manager — one parameter pool, many candidate views
//!
//! [`WeightsManager::assemble`] maps a rollout to the exact slots it uses and
//! hands out a [`SubNetworkView`] borrowing them. Training never writes to a
//! view: it takes a [`SnapshotHandle`], trains the private copy, and then
//! either merges the change back or discards it.

mod candidate;
mod key;
mod pool;
mod view;

pub use candidate::{evaluate, gradients, train_step, ModelOutput, ParamAccess, ParamAccessMut};
pub use key::{ParamKey, SlotKind, SlotSpec};
pub use pool::{PoolState, SharedParameterPool, SlotState};
pub use view::{SnapshotHandle, SubNetworkView};

use crate::error::{NasError, Result};
use crate::rollout::{Rollout, RolloutType};
use crate::search_space::SearchSpace;
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Options of the `supernet` weights manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SupernetConfig {
    /// Width of every parameter slot; 0 takes the dataset's input width
    pub param_dim: usize,
    pub init_scale: f64,
    pub seed: u64,
    /// When set, `discard` rolls back parameters only and keeps buffer
    /// updates (running statistics)
    pub virtual_parameter_only: bool,
    /// `[alias, owner]` pairs of parameter keys sharing one slot
    pub tie_weights: Vec<(String, String)>,
    /// When unset, every view covers the whole supernet instead of only
    /// the slots its rollout activates
    pub candidate_member_mask: bool,
    pub rollout_type: Option<RolloutType>,
}

impl Default for SupernetConfig {
    fn default() -> Self {
        Self {
            param_dim: 0,
            init_scale: 0.1,
            seed: 0,
            virtual_parameter_only: false,
            tie_weights: Vec::new(),
            candidate_member_mask: true,
            rollout_type: None,
        }
    }
}

impl SupernetConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.init_scale.is_finite() && self.init_scale >= 0.0) {
            return Err(NasError::Config("init_scale must be finite and non-negative".into()));
        }
        self.aliases().map(|_| ())
    }

    fn aliases(&self) -> Result<Vec<(ParamKey, ParamKey)>> {
        self.tie_weights
            .iter()
            .map(|(alias, owner)| Ok((alias.parse()?, owner.parse()?)))
            .collect()
    }
}

/// Pool-level numbers for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupernetStats {
    pub slots: usize,
    pub parameters: usize,
    pub outstanding_snapshots: usize,
    pub leaked_snapshots: usize,
}

pub(crate) struct ManagerInner {
    pub(crate) pool: SharedParameterPool,
    space: Arc<dyn SearchSpace>,
    config: SupernetConfig,
    pub(crate) outstanding: Mutex<HashSet<Uuid>>,
    pub(crate) leaked: AtomicUsize,
}

/// Cheap to clone; every clone addresses the same pool
#[derive(Clone)]
pub struct WeightsManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for WeightsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightsManager")
            .field("space", &self.inner.space)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WeightsManager {
    /// Allocate the supernet for `space`. `input_dim` fills in a zero
    /// `param_dim`.
    pub fn new(space: Arc<dyn SearchSpace>, config: SupernetConfig, input_dim: usize) -> Result<Self> {
        config.validate()?;
        let param_dim = if config.param_dim == 0 { input_dim } else { config.param_dim };
        let pool = SharedParameterPool::allocate(
            &space.slot_specs(),
            &config.aliases()?,
            param_dim,
            config.init_scale,
            config.seed,
        )?;
        info!(
            "Allocated supernet for {} space: {} slots, {} parameters",
            space.rollout_type(),
            pool.len(),
            pool.num_params()
        );
        Ok(Self {
            inner: Arc::new(ManagerInner {
                pool,
                space,
                config,
                outstanding: Mutex::new(HashSet::new()),
                leaked: AtomicUsize::new(0),
            }),
        })
    }

    pub fn space(&self) -> &Arc<dyn SearchSpace> {
        &self.inner.space
    }

    pub fn config(&self) -> &SupernetConfig {
        &self.inner.config
    }

    pub fn param_dim(&self) -> usize {
        self.inner.pool.param_dim()
    }

    /// View over exactly the slots `rollout` activates, or over the whole
    /// pool when `candidate_member_mask` is off
    pub fn assemble(&self, rollout: &Rollout) -> Result<SubNetworkView> {
        let expected = self.inner.space.rollout_type();
        if rollout.rollout_type() != expected {
            return Err(NasError::RolloutTypeMismatch(format!(
                "weights manager serves {} rollouts, got {}",
                expected,
                rollout.rollout_type()
            )));
        }
        let keys = self.inner.space.active_keys(rollout.genotype())?;
        let mut slots = keys
            .iter()
            .map(|k| self.inner.pool.resolve(k))
            .collect::<Result<Vec<_>>>()?;
        if !self.inner.config.candidate_member_mask {
            slots = (0..self.inner.pool.len()).collect();
        }
        slots.sort_unstable();
        slots.dedup();
        Ok(SubNetworkView {
            owner: Arc::clone(&self.inner),
            rollout: rollout.id(),
            slots,
        })
    }

    fn check_owner(&self, owner: &Arc<ManagerInner>) -> Result<()> {
        if Arc::ptr_eq(owner, &self.inner) {
            Ok(())
        } else {
            Err(NasError::Runtime("handle belongs to a different weights manager".into()))
        }
    }

    /// Capture the view's slots into a job-private working copy
    pub fn snapshot(&self, view: &SubNetworkView) -> Result<SnapshotHandle> {
        self.check_owner(&view.owner)?;
        let base: Vec<_> = self
            .inner
            .pool
            .read_many(&view.slots)
            .iter()
            .map(|guard| (**guard).clone())
            .collect();
        let kinds = view.slots.iter().map(|&i| self.inner.pool.kind(i)).collect();
        let id = Uuid::new_v4();
        self.inner.outstanding.lock().insert(id);
        debug!("Snapshot {} taken for rollout {}", id, view.rollout);
        Ok(SnapshotHandle {
            id,
            owner: Arc::clone(&self.inner),
            rollout: view.rollout,
            slots: view.slots.clone(),
            kinds,
            working: base.clone(),
            base,
            resolved: false,
        })
    }

    /// Fold the snapshot's change (working − captured) into the pool.
    /// All touched slots are write-locked together, so concurrent readers
    /// see the update entirely or not at all.
    pub fn merge(&self, mut handle: SnapshotHandle) -> Result<()> {
        self.check_owner(&handle.owner)?;
        self.apply_delta(&handle, |_| true);
        handle.mark_resolved();
        debug!("Snapshot {} merged", handle.id);
        Ok(())
    }

    /// Drop the snapshot's change. With `virtual_parameter_only`, buffer
    /// updates are still kept.
    pub fn discard(&self, mut handle: SnapshotHandle) -> Result<()> {
        self.check_owner(&handle.owner)?;
        if self.inner.config.virtual_parameter_only {
            self.apply_delta(&handle, |kind| kind == SlotKind::Buffer);
        }
        handle.mark_resolved();
        debug!("Snapshot {} discarded", handle.id);
        Ok(())
    }

    fn apply_delta(&self, handle: &SnapshotHandle, include: impl Fn(SlotKind) -> bool) {
        let mut guards = self.inner.pool.write_many(&handle.slots);
        for (i, guard) in guards.iter_mut().enumerate() {
            if include(handle.kinds[i]) {
                let delta = &handle.working[i] - &handle.base[i];
                **guard += delta;
            }
        }
    }

    /// Direct SGD update of the shared slots a view covers. Buffers are
    /// left alone; `gradients` is indexed like the view.
    pub fn step(&self, view: &SubNetworkView, grads: &[nalgebra::DVector<f64>], lr: f64) -> Result<()> {
        self.check_owner(&view.owner)?;
        if grads.len() != view.slots.len() {
            return Err(NasError::Runtime(format!(
                "{} gradients for {} slots",
                grads.len(),
                view.slots.len()
            )));
        }
        // all widths are checked before any slot is written
        for (grad, &idx) in grads.iter().zip(&view.slots) {
            let width = self.inner.pool.width(idx);
            if self.inner.pool.kind(idx) == SlotKind::Parameter && grad.len() != width {
                return Err(NasError::Runtime(format!(
                    "gradient width {} for slot {} of width {}",
                    grad.len(),
                    self.inner.pool.key(idx),
                    width
                )));
            }
        }
        let mut guards = self.inner.pool.write_many(&view.slots);
        for ((guard, grad), &idx) in guards.iter_mut().zip(grads).zip(&view.slots) {
            if self.inner.pool.kind(idx) == SlotKind::Parameter {
                guard.axpy(-lr, grad, 1.0);
            }
        }
        Ok(())
    }

    pub fn outstanding_snapshots(&self) -> usize {
        self.inner.outstanding.lock().len()
    }

    pub fn leaked_snapshots(&self) -> usize {
        self.inner.leaked.load(Ordering::Acquire)
    }

    /// Error if any snapshot was dropped without merge or discard
    pub fn check_leaks(&self) -> Result<()> {
        match self.leaked_snapshots() {
            0 => Ok(()),
            count => Err(NasError::ResourceLeak { count }),
        }
    }

    pub fn export_state(&self) -> PoolState {
        self.inner.pool.export()
    }

    pub fn import_state(&self, state: &PoolState) -> Result<()> {
        if self.outstanding_snapshots() > 0 {
            return Err(NasError::Checkpoint(
                "cannot restore the pool while snapshots are outstanding".into(),
            ));
        }
        self.inner.pool.import(state)
    }

    pub fn num_params(&self) -> usize {
        self.inner.pool.num_params()
    }

    pub fn stats(&self) -> SupernetStats {
        SupernetStats {
            slots: self.inner.pool.len(),
            parameters: self.inner.pool.num_params(),
            outstanding_snapshots: self.outstanding_snapshots(),
            leaked_snapshots: self.leaked_snapshots(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Batch;
    use crate::search_space::{DiscreteSearchSpace, DiscreteSpaceConfig, OfaSearchSpace, OfaSpaceConfig};
    use nalgebra::DVector;

    fn manager_with(config: SupernetConfig) -> WeightsManager {
        let space = DiscreteSearchSpace::new(DiscreteSpaceConfig {
            num_cells: 2,
            num_ops: 3,
            ..DiscreteSpaceConfig::default()
        });
        WeightsManager::new(Arc::new(space), config, 2).unwrap()
    }

    fn manager() -> WeightsManager {
        manager_with(SupernetConfig::default())
    }

    fn rollout(text: &str) -> Rollout {
        Rollout::new(RolloutType::Discrete, text.parse().unwrap())
    }

    fn batch() -> Batch {
        Batch {
            inputs: vec![DVector::from_vec(vec![1.0, 0.5]), DVector::from_vec(vec![-0.5, 1.0])],
            targets: vec![1.0, -1.0],
        }
    }

    fn trained(wm: &WeightsManager, view: &SubNetworkView) -> SnapshotHandle {
        let mut handle = wm.snapshot(view).unwrap();
        for _ in 0..5 {
            train_step(&mut handle, &batch(), 0.3).unwrap();
        }
        assert!(handle.max_delta() > 0.0);
        handle
    }

    #[test]
    fn test_shared_keys_observe_identical_values() {
        let wm = manager();
        let a = wm.assemble(&rollout("cell_0=0, cell_1=1")).unwrap();
        let b = wm.assemble(&rollout("cell_0=0, cell_1=2")).unwrap();
        let shared = ParamKey::cell(0, 0, 0);
        assert_eq!(a.value(&shared), b.value(&shared));
        assert!(a.contains(&ParamKey::cell(1, 1, 0)));
        assert!(!b.contains(&ParamKey::cell(1, 1, 0)));
        // stem, classifier, one op and one stats buffer per cell
        assert_eq!(a.len(), 6);
    }

    #[test]
    fn test_merge_is_visible_to_later_views() {
        let wm = manager();
        let r = rollout("cell_0=1, cell_1=1");
        let view = wm.assemble(&r).unwrap();
        let key = ParamKey::cell(0, 1, 0);
        let before = view.value(&key).unwrap();
        let handle = trained(&wm, &view);
        let expected = handle.value(&key).unwrap();
        // training the copy leaves the pool untouched
        assert_eq!(view.value(&key).unwrap(), before);
        wm.merge(handle).unwrap();
        let after = wm.assemble(&r).unwrap().value(&key).unwrap();
        assert!((after - expected).amax() < 1e-12);
        assert_eq!(wm.outstanding_snapshots(), 0);
        wm.check_leaks().unwrap();
    }

    #[test]
    fn test_discard_restores_previous_values() {
        let wm = manager();
        let r = rollout("cell_0=2, cell_1=0");
        let before = wm.export_state();
        let view = wm.assemble(&r).unwrap();
        let handle = trained(&wm, &view);
        wm.discard(handle).unwrap();
        assert_eq!(wm.export_state(), before);
        wm.check_leaks().unwrap();
    }

    #[test]
    fn test_virtual_parameter_only_keeps_buffers() {
        let wm = manager_with(SupernetConfig {
            virtual_parameter_only: true,
            ..SupernetConfig::default()
        });
        let view = wm.assemble(&rollout("cell_0=0, cell_1=0")).unwrap();
        let stem = view.value(&ParamKey::common("stem")).unwrap();
        let handle = trained(&wm, &view);
        wm.discard(handle).unwrap();
        assert_eq!(view.value(&ParamKey::common("stem")).unwrap(), stem);
        assert!(view.value(&ParamKey::Stats { cell: 0 }).unwrap()[0] > 0.0);
    }

    #[test]
    fn test_overlapping_merges_compose() {
        let wm = manager();
        let key = ParamKey::common("stem");
        let a = wm.assemble(&rollout("cell_0=0, cell_1=0")).unwrap();
        let b = wm.assemble(&rollout("cell_0=1, cell_1=1")).unwrap();
        let base = a.value(&key).unwrap();
        let ha = trained(&wm, &a);
        let hb = trained(&wm, &b);
        let da = ha.value(&key).unwrap() - &base;
        let db = hb.value(&key).unwrap() - &base;
        wm.merge(ha).unwrap();
        wm.merge(hb).unwrap();
        let merged = a.value(&key).unwrap();
        assert!((merged - (base + da + db)).amax() < 1e-12);
    }

    #[test]
    fn test_dropped_snapshot_is_a_leak() {
        let wm = manager();
        let view = wm.assemble(&rollout("cell_0=0, cell_1=0")).unwrap();
        let handle = wm.snapshot(&view).unwrap();
        assert_eq!(wm.outstanding_snapshots(), 1);
        drop(handle);
        assert_eq!(wm.outstanding_snapshots(), 0);
        assert!(matches!(wm.check_leaks(), Err(NasError::ResourceLeak { count: 1 })));
    }

    #[test]
    fn test_tied_weights_appear_once() {
        let wm = manager_with(SupernetConfig {
            tie_weights: vec![("common.classifier".into(), "common.stem".into())],
            ..SupernetConfig::default()
        });
        let view = wm.assemble(&rollout("cell_0=0, cell_1=0")).unwrap();
        assert_eq!(view.len(), 5);
        assert_eq!(
            view.value(&ParamKey::common("classifier")),
            view.value(&ParamKey::common("stem"))
        );
        assert_eq!(wm.stats().slots, 2 + 2 * 3 + 2 - 1);
    }

    #[test]
    fn test_wrong_rollout_type_rejected() {
        let wm = manager();
        let ofa = OfaSearchSpace::new(OfaSpaceConfig::default());
        let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(1);
        let r = ofa.random_rollout(&mut rng).unwrap();
        assert!(matches!(wm.assemble(&r), Err(NasError::RolloutTypeMismatch(_))));
    }

    #[test]
    fn test_handles_from_another_manager_rejected() {
        let a = manager();
        let b = manager();
        let view = a.assemble(&rollout("cell_0=0, cell_1=0")).unwrap();
        assert!(b.snapshot(&view).is_err());
        let handle = a.snapshot(&view).unwrap();
        assert!(b.merge(handle).is_err());
        // the rejected handle was dropped unresolved
        assert_eq!(a.leaked_snapshots(), 1);
        assert_eq!(b.leaked_snapshots(), 0);
    }

    #[test]
    fn test_direct_step_updates_parameters() {
        let wm = manager();
        let view = wm.assemble(&rollout("cell_0=0, cell_1=0")).unwrap();
        let before = wm.export_state();
        let (_, grads) = gradients(&view, &batch()).unwrap();
        wm.step(&view, &grads, 0.1).unwrap();
        assert_ne!(wm.export_state(), before);
        assert!(wm.step(&view, &grads[..1], 0.1).is_err());
    }

    #[test]
    fn test_rejected_step_writes_nothing() {
        let wm = manager();
        let view = wm.assemble(&rollout("cell_0=1, cell_1=2")).unwrap();
        let before = wm.export_state();
        let (_, mut grads) = gradients(&view, &batch()).unwrap();
        let last = (0..grads.len())
            .rev()
            .find(|&i| wm.inner.pool.kind(view.slots[i]) == SlotKind::Parameter)
            .unwrap();
        grads[last] = DVector::zeros(5);
        assert!(matches!(wm.step(&view, &grads, 0.1), Err(NasError::Runtime(_))));
        assert_eq!(wm.export_state(), before);

        let (_, grads) = gradients(&view, &batch()).unwrap();
        wm.step(&view, &grads, 0.1).unwrap();
        assert_ne!(wm.export_state(), before);
    }

    #[test]
    fn test_unmasked_views_cover_the_supernet() {
        let wm = manager_with(SupernetConfig {
            candidate_member_mask: false,
            ..SupernetConfig::default()
        });
        let view = wm.assemble(&rollout("cell_0=0, cell_1=0")).unwrap();
        assert_eq!(view.len(), wm.stats().slots);
        assert!(view.contains(&ParamKey::cell(1, 2, 0)));
        assert!(wm.assemble(&rollout("cell_0=7, cell_1=0")).is_err());

        let before = wm.export_state();
        let handle = trained(&wm, &view);
        wm.merge(handle).unwrap();
        assert_ne!(wm.export_state(), before);
        wm.check_leaks().unwrap();
    }
}
