//! Search spaces — the set of architectures a controller may propose
//!
//! A search space fixes three things: the decision vector controllers act
//! on, the genotype text each decision vector maps to, and the parameter
//! slots of the supernet each genotype activates.

mod discrete;
mod ofa;

pub use discrete::{DiscreteSearchSpace, DiscreteSpaceConfig};
pub use ofa::{OfaSearchSpace, OfaSpaceConfig};

use crate::error::Result;
use crate::rollout::{Genotype, Rollout, RolloutType};
use crate::weights::{ParamKey, SlotSpec};
use rand::Rng;
use std::fmt::Debug;

pub trait SearchSpace: Debug + Send + Sync {
    fn rollout_type(&self) -> RolloutType;

    /// Number of choices for each decision, in controller order
    fn decisions(&self) -> Vec<usize>;

    fn genotype_from_decisions(&self, decisions: &[usize]) -> Result<Genotype>;

    fn decisions_of(&self, genotype: &Genotype) -> Result<Vec<usize>>;

    /// Every slot the supernet must allocate
    fn slot_specs(&self) -> Vec<SlotSpec>;

    /// Slots a genotype reads and trains, in a stable order
    fn active_keys(&self, genotype: &Genotype) -> Result<Vec<ParamKey>>;

    /// Total number of distinct decision vectors (saturating)
    fn size(&self) -> u128 {
        self.decisions()
            .iter()
            .fold(1u128, |acc, &n| acc.saturating_mul(n as u128))
    }

    /// Decode the `index`-th decision vector in mixed-radix order
    fn decisions_at(&self, index: u128) -> Vec<usize> {
        let radices = self.decisions();
        let mut rest = index;
        let mut out = vec![0; radices.len()];
        for (slot, &radix) in out.iter_mut().zip(&radices).rev() {
            let radix = radix.max(1) as u128;
            *slot = (rest % radix) as usize;
            rest /= radix;
        }
        out
    }

    fn random_rollout(&self, rng: &mut dyn rand::RngCore) -> Result<Rollout> {
        let decisions: Vec<usize> = self
            .decisions()
            .iter()
            .map(|&n| rng.gen_range(0..n.max(1)))
            .collect();
        let genotype = self.genotype_from_decisions(&decisions)?;
        Ok(Rollout::new(self.rollout_type(), genotype))
    }
}

/// Index of `value` in `choices`, as a genotype error when absent
pub(crate) fn choice_index(choices: &[u32], value: u32, key: &str) -> Result<usize> {
    choices.iter().position(|&c| c == value).ok_or_else(|| {
        crate::error::NasError::Genotype(format!(
            "value {} for '{}' is not one of {:?}",
            value, key, choices
        ))
    })
}
