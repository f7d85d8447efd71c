//! Sub-network views and copy-on-write snapshots

use super::candidate::{ParamAccess, ParamAccessMut};
use super::key::{ParamKey, SlotKind};
use super::ManagerInner;
use log::{error, warn};
use nalgebra::DVector;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

/// The slots one rollout activates, borrowed from the pool without copying
pub struct SubNetworkView {
    pub(super) owner: Arc<ManagerInner>,
    pub(super) rollout: Uuid,
    /// Ascending, deduplicated arena indices
    pub(super) slots: Vec<usize>,
}

impl SubNetworkView {
    pub fn rollout(&self) -> Uuid {
        self.rollout
    }

    /// Canonical keys of the active slots (tied aliases appear once)
    pub fn keys(&self) -> Vec<ParamKey> {
        self.slots
            .iter()
            .map(|&i| self.owner.pool.key(i).clone())
            .collect()
    }

    pub fn contains(&self, key: &ParamKey) -> bool {
        self.owner
            .pool
            .resolve(key)
            .map(|idx| self.slots.binary_search(&idx).is_ok())
            .unwrap_or(false)
    }

    /// Copy of one slot's current value
    pub fn value(&self, key: &ParamKey) -> Option<DVector<f64>> {
        let idx = self.owner.pool.resolve(key).ok()?;
        self.slots.binary_search(&idx).ok()?;
        Some(self.owner.pool.read(idx).clone())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl ParamAccess for SubNetworkView {
    fn num_slots(&self) -> usize {
        self.slots.len()
    }

    fn slot_kind(&self, i: usize) -> SlotKind {
        self.owner.pool.kind(self.slots[i])
    }

    fn read_slot<R>(&self, i: usize, f: impl FnOnce(&DVector<f64>) -> R) -> R {
        let guard = self.owner.pool.read(self.slots[i]);
        f(&guard)
    }
}

/// Job-private copy of a view's slots.
///
/// Training writes only to the copy. [`super::WeightsManager::merge`]
/// folds the change into the pool, [`super::WeightsManager::discard`]
/// drops it. Dropping a handle without either is recorded as a leak.
#[must_use = "a snapshot must be merged or discarded"]
pub struct SnapshotHandle {
    pub(super) id: Uuid,
    pub(super) owner: Arc<ManagerInner>,
    pub(super) rollout: Uuid,
    pub(super) slots: Vec<usize>,
    pub(super) kinds: Vec<SlotKind>,
    pub(super) base: Vec<DVector<f64>>,
    pub(super) working: Vec<DVector<f64>>,
    pub(super) resolved: bool,
}

impl SnapshotHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn rollout(&self) -> Uuid {
        self.rollout
    }

    /// Working value of one slot
    pub fn value(&self, key: &ParamKey) -> Option<DVector<f64>> {
        let idx = self.owner.pool.resolve(key).ok()?;
        let pos = self.slots.binary_search(&idx).ok()?;
        Some(self.working[pos].clone())
    }

    /// Largest absolute change made to any slot so far
    pub fn max_delta(&self) -> f64 {
        self.working
            .iter()
            .zip(&self.base)
            .map(|(w, b)| (w - b).amax())
            .fold(0.0, f64::max)
    }

    pub(super) fn mark_resolved(&mut self) {
        self.resolved = true;
        self.owner.outstanding.lock().remove(&self.id);
    }
}

impl ParamAccess for SnapshotHandle {
    fn num_slots(&self) -> usize {
        self.slots.len()
    }

    fn slot_kind(&self, i: usize) -> SlotKind {
        self.kinds[i]
    }

    fn read_slot<R>(&self, i: usize, f: impl FnOnce(&DVector<f64>) -> R) -> R {
        f(&self.working[i])
    }
}

impl ParamAccessMut for SnapshotHandle {
    fn write_slot<R>(&mut self, i: usize, f: impl FnOnce(&mut DVector<f64>) -> R) -> R {
        f(&mut self.working[i])
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        self.owner.outstanding.lock().remove(&self.id);
        if std::thread::panicking() {
            // unwinding out of a crashed job: the pool was never touched
            warn!(
                "Snapshot {} for rollout {} discarded by a crashed job",
                self.id, self.rollout
            );
        } else {
            self.owner.leaked.fetch_add(1, Ordering::AcqRel);
            error!(
                "Snapshot {} for rollout {} dropped without merge or discard",
                self.id, self.rollout
            );
        }
    }
}
