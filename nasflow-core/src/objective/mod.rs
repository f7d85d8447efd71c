//! Objectives — turn a candidate's model output into a reward

use crate::error::{NasError, Result};
use crate::schedule::{AttrShape, ScheduleSet};
use crate::weights::ModelOutput;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

pub trait Objective: Debug + Send + Sync {
    /// Names of the metrics [`Objective::perf`] reports
    fn perf_names(&self) -> Vec<&'static str>;

    fn perf(&self, output: &ModelOutput) -> BTreeMap<String, f64>;

    /// Scalar reward at the given step; higher is better
    fn reward(&self, output: &ModelOutput, step: u64) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardMetric {
    Accuracy,
    NegLoss,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClassificationConfig {
    pub reward_metric: RewardMetric,
    /// Reward subtracted per thousand parameters
    pub param_penalty: f64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            reward_metric: RewardMetric::Accuracy,
            param_penalty: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationObjective {
    pub config: ClassificationConfig,
    schedule: ScheduleSet,
}

impl ClassificationObjective {
    pub const SCHEDULABLE: &'static [(&'static str, AttrShape)] = &[("param_penalty", AttrShape::Scalar)];

    pub fn new(config: ClassificationConfig, schedule: ScheduleSet) -> Result<Self> {
        if !config.param_penalty.is_finite() || config.param_penalty < 0.0 {
            return Err(NasError::Config("param_penalty must be non-negative".into()));
        }
        schedule.check_attributes(Self::SCHEDULABLE)?;
        Ok(Self { config, schedule })
    }
}

impl Objective for ClassificationObjective {
    fn perf_names(&self) -> Vec<&'static str> {
        vec!["accuracy", "loss", "num_params"]
    }

    fn perf(&self, output: &ModelOutput) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("accuracy".to_string(), output.accuracy),
            ("loss".to_string(), output.loss),
            ("num_params".to_string(), output.num_params as f64),
        ])
    }

    fn reward(&self, output: &ModelOutput, step: u64) -> f64 {
        let base = match self.config.reward_metric {
            RewardMetric::Accuracy => output.accuracy,
            RewardMetric::NegLoss => -output.loss,
        };
        let penalty = self.schedule.f64("param_penalty", step, self.config.param_penalty);
        base - penalty * output.num_params as f64 / 1000.0
    }
}
