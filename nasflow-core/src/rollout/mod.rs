//! Rollouts — one sampled candidate architecture and its evaluation outcome

mod genotype;

pub use genotype::{Gene, Genotype};

use crate::error::{NasError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Encoding family shared by search space, controller, evaluator and
/// weights manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloutType {
    /// One op index per cell
    Discrete,
    /// Depth per cell plus (expansion, kernel) per block
    Ofa,
}

impl RolloutType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutType::Discrete => "discrete",
            RolloutType::Ofa => "ofa",
        }
    }
}

impl fmt::Display for RolloutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RolloutType {
    type Err = NasError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "discrete" => Ok(RolloutType::Discrete),
            "ofa" => Ok(RolloutType::Ofa),
            other => Err(NasError::Config(format!("unknown rollout_type '{}'", other))),
        }
    }
}

/// A candidate architecture plus bookkeeping.
///
/// The encoding never changes. Scoring happens exactly once, through
/// [`Rollout::record_score`] or [`Rollout::mark_invalid`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollout {
    id: Uuid,
    rollout_type: RolloutType,
    genotype: Genotype,
    reward: Option<f64>,
    valid: bool,
    scored: bool,
    failure: Option<String>,
    /// Auxiliary metrics reported by the evaluator (loss, accuracy, ...)
    pub perf: BTreeMap<String, f64>,
}

impl Rollout {
    pub fn new(rollout_type: RolloutType, genotype: Genotype) -> Self {
        Self {
            id: Uuid::new_v4(),
            rollout_type,
            genotype,
            reward: None,
            valid: true,
            scored: false,
            failure: None,
            perf: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// First eight hex digits of the id, for log lines
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    pub fn rollout_type(&self) -> RolloutType {
        self.rollout_type
    }

    pub fn genotype(&self) -> &Genotype {
        &self.genotype
    }

    pub fn reward(&self) -> Option<f64> {
        self.reward
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_scored(&self) -> bool {
        self.scored
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Valid and carrying a reward
    pub fn scored_reward(&self) -> Option<f64> {
        if self.valid {
            self.reward
        } else {
            None
        }
    }

    pub fn record_score(&mut self, reward: f64) -> Result<()> {
        self.ensure_unscored()?;
        self.reward = Some(reward);
        self.valid = true;
        self.scored = true;
        Ok(())
    }

    pub fn mark_invalid(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_unscored()?;
        self.valid = false;
        self.scored = true;
        self.failure = Some(reason.into());
        Ok(())
    }

    fn ensure_unscored(&self) -> Result<()> {
        if self.scored {
            return Err(NasError::Runtime(format!(
                "rollout {} was already scored",
                self.short_id()
            )));
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        match (self.valid, self.reward) {
            (true, Some(r)) => format!("[{}] reward={:.4} | {}", self.short_id(), r, self.genotype),
            (false, _) => format!(
                "[{}] invalid ({}) | {}",
                self.short_id(),
                self.failure.as_deref().unwrap_or("unknown"),
                self.genotype
            ),
            (true, None) => format!("[{}] unscored | {}", self.short_id(), self.genotype),
        }
    }
}

/// Mean and best reward over the valid members of a batch
pub fn reward_stats(rollouts: &[Rollout]) -> Option<(f64, f64, usize)> {
    let rewards: Vec<f64> = rollouts.iter().filter_map(Rollout::scored_reward).collect();
    if rewards.is_empty() {
        return None;
    }
    let mean = rewards.iter().sum::<f64>() / rewards.len() as f64;
    let best = rewards.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    Some((mean, best, rewards.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Rollout {
        Rollout::new(RolloutType::Discrete, "cell_0=1, cell_1=2".parse().unwrap())
    }

    #[test]
    fn test_score_once() {
        let mut r = sample();
        assert!(!r.is_scored());
        r.record_score(0.7).unwrap();
        assert_eq!(r.scored_reward(), Some(0.7));
        assert!(r.record_score(0.9).is_err());
        assert!(r.mark_invalid("late").is_err());
        assert_eq!(r.reward(), Some(0.7));
    }

    #[test]
    fn test_invalid_excluded_from_stats() {
        let mut a = sample();
        let mut b = sample();
        let mut c = sample();
        a.record_score(0.2).unwrap();
        b.mark_invalid("crashed").unwrap();
        c.record_score(0.6).unwrap();
        let (mean, best, n) = reward_stats(&[a, b, c]).unwrap();
        assert_eq!(n, 2);
        assert!((mean - 0.4).abs() < 1e-12);
        assert_eq!(best, 0.6);
    }

    #[test]
    fn test_rollout_type_parse() {
        assert_eq!("ofa".parse::<RolloutType>().unwrap(), RolloutType::Ofa);
        assert!("darts".parse::<RolloutType>().is_err());
        assert_eq!(serde_json::to_string(&RolloutType::Discrete).unwrap(), "\"discrete\"");
    }
}
