//! Controllers — propose rollouts and learn from their rewards

mod enumerative;
mod rl;

pub use enumerative::{EnumerativeConfig, EnumerativeController};
pub use rl::{RlController, RlControllerConfig};

use crate::error::Result;
use crate::rollout::{Rollout, RolloutType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;

/// Outcome of one [`Controller::update`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerReport {
    /// Valid rollouts that contributed
    pub used: usize,
    /// Invalid or unscored rollouts that were skipped
    pub skipped: usize,
    pub mean_reward: Option<f64>,
    pub entropy: Option<f64>,
}

pub trait Controller: Debug + Send {
    fn rollout_type(&self) -> RolloutType;

    /// Propose `n` fresh rollouts. Schedulable attributes resolve at `step`.
    fn sample(&mut self, n: usize, step: u64) -> Result<Vec<Rollout>>;

    /// Learn from scored rollouts; invalid ones are skipped
    fn update(&mut self, rollouts: &[Rollout], step: u64) -> Result<ControllerReport>;

    /// Everything needed to resume sampling where it stopped
    fn state(&self) -> Result<Value>;

    fn load_state(&mut self, state: &Value) -> Result<()>;

    fn summary(&self, step: u64) -> String;
}

/// Split a batch into (reward, rollout) for valid members and a skip count
pub(crate) fn valid_rewards(rollouts: &[Rollout]) -> (Vec<(f64, &Rollout)>, usize) {
    let used: Vec<_> = rollouts
        .iter()
        .filter_map(|r| r.scored_reward().map(|reward| (reward, r)))
        .collect();
    let skipped = rollouts.len() - used.len();
    (used, skipped)
}
