//! Learned controller: independent categorical policy per decision,
//! trained with REINFORCE against a moving-average baseline.
//!
//! Sampling draws from a generator derived from `(seed, calls so far)`, so a
//! controller restored from its state continues the exact same sequence.

use super::{valid_rewards, Controller, ControllerReport};
use crate::error::{NasError, Result};
use crate::rollout::{Rollout, RolloutType};
use crate::schedule::{AttrShape, ScheduleSet};
use crate::search_space::SearchSpace;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RlControllerConfig {
    pub learning_rate: f64,
    pub temperature: f64,
    /// Weight of the entropy bonus
    pub entropy_coeff: f64,
    pub baseline_decay: f64,
    pub seed: u64,
    pub rollout_type: Option<RolloutType>,
}

impl Default for RlControllerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            temperature: 1.0,
            entropy_coeff: 0.0,
            baseline_decay: 0.9,
            seed: 0,
            rollout_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RlState {
    logits: Vec<Vec<f64>>,
    baseline: Option<f64>,
    sample_calls: u64,
    updates: u64,
}

#[derive(Debug)]
pub struct RlController {
    space: Arc<dyn SearchSpace>,
    config: RlControllerConfig,
    schedule: ScheduleSet,
    state: RlState,
}

impl RlController {
    pub const SCHEDULABLE: &'static [(&'static str, AttrShape)] = &[
        ("learning_rate", AttrShape::Scalar),
        ("temperature", AttrShape::Scalar),
        ("entropy_coeff", AttrShape::Scalar),
    ];

    pub fn new(space: Arc<dyn SearchSpace>, config: RlControllerConfig, schedule: ScheduleSet) -> Result<Self> {
        if !(config.temperature > 0.0) {
            return Err(NasError::Config("temperature must be positive".into()));
        }
        if !(0.0..1.0).contains(&config.baseline_decay) {
            return Err(NasError::Config("baseline_decay must be in [0, 1)".into()));
        }
        schedule.check_attributes(Self::SCHEDULABLE)?;
        let logits = space.decisions().iter().map(|&n| vec![0.0; n]).collect();
        Ok(Self {
            space,
            config,
            schedule,
            state: RlState {
                logits,
                baseline: None,
                sample_calls: 0,
                updates: 0,
            },
        })
    }

    fn temperature(&self, step: u64) -> f64 {
        self.schedule
            .f64("temperature", step, self.config.temperature)
            .max(1e-6)
    }

    /// Current action probabilities per decision at `step`
    pub fn probabilities(&self, step: u64) -> Vec<Vec<f64>> {
        let t = self.temperature(step);
        self.state.logits.iter().map(|l| softmax(l, t)).collect()
    }

    pub fn baseline(&self) -> Option<f64> {
        self.state.baseline
    }

    fn rng_for_call(&self) -> StdRng {
        let mixed = self
            .config
            .seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(self.state.sample_calls);
        StdRng::seed_from_u64(mixed)
    }
}

impl Controller for RlController {
    fn rollout_type(&self) -> RolloutType {
        self.space.rollout_type()
    }

    fn sample(&mut self, n: usize, step: u64) -> Result<Vec<Rollout>> {
        let probs = self.probabilities(step);
        let mut rng = self.rng_for_call();
        self.state.sample_calls += 1;
        (0..n)
            .map(|_| {
                let decisions: Vec<usize> = probs.iter().map(|p| sample_categorical(p, &mut rng)).collect();
                let genotype = self.space.genotype_from_decisions(&decisions)?;
                Ok(Rollout::new(self.rollout_type(), genotype))
            })
            .collect()
    }

    fn update(&mut self, rollouts: &[Rollout], step: u64) -> Result<ControllerReport> {
        let (used, skipped) = valid_rewards(rollouts);
        if used.is_empty() {
            return Ok(ControllerReport {
                used: 0,
                skipped,
                mean_reward: None,
                entropy: None,
            });
        }
        let lr = self.schedule.f64("learning_rate", step, self.config.learning_rate);
        let entropy_coeff = self.schedule.f64("entropy_coeff", step, self.config.entropy_coeff);
        let t = self.temperature(step);
        let probs = self.probabilities(step);

        let mean_reward = used.iter().map(|(r, _)| r).sum::<f64>() / used.len() as f64;
        let baseline = self.state.baseline.unwrap_or(mean_reward);

        let mut grads: Vec<Vec<f64>> = probs.iter().map(|p| vec![0.0; p.len()]).collect();
        for (reward, rollout) in &used {
            let advantage = reward - baseline;
            let decisions = self.space.decisions_of(rollout.genotype())?;
            for ((grad, p), &chosen) in grads.iter_mut().zip(&probs).zip(&decisions) {
                // d log p(chosen) / d logit_j = (1[j == chosen] - p_j) / t
                for (j, g) in grad.iter_mut().enumerate() {
                    let onehot = if j == chosen { 1.0 } else { 0.0 };
                    *g += advantage * (onehot - p[j]) / t;
                }
            }
        }
        let scale = 1.0 / used.len() as f64;
        let mut total_entropy = 0.0;
        for ((logits, grad), p) in self.state.logits.iter_mut().zip(&grads).zip(&probs) {
            let h = entropy(p);
            total_entropy += h;
            for j in 0..logits.len() {
                // d H / d logit_j = -p_j (ln p_j + H) / t
                let dh = if p[j] > 1e-12 { -p[j] * (p[j].ln() + h) / t } else { 0.0 };
                logits[j] += lr * (grad[j] * scale + entropy_coeff * dh);
            }
        }

        let decay = self.config.baseline_decay;
        self.state.baseline = Some(decay * baseline + (1.0 - decay) * mean_reward);
        self.state.updates += 1;
        debug!(
            "Controller update {}: reward={:.4} baseline={:.4} entropy={:.4} lr={}",
            self.state.updates, mean_reward, baseline, total_entropy, lr
        );
        Ok(ControllerReport {
            used: used.len(),
            skipped,
            mean_reward: Some(mean_reward),
            entropy: Some(total_entropy),
        })
    }

    fn state(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn load_state(&mut self, state: &Value) -> Result<()> {
        let state: RlState = serde_json::from_value(state.clone())?;
        let shape: Vec<usize> = state.logits.iter().map(Vec::len).collect();
        if shape != self.space.decisions() {
            return Err(NasError::Checkpoint(
                "controller state does not match the search space".into(),
            ));
        }
        self.state = state;
        Ok(())
    }

    fn summary(&self, step: u64) -> String {
        let entropy: f64 = self.probabilities(step).iter().map(|p| entropy(p)).sum();
        format!(
            "rl updates={} baseline={} entropy={:.4} temperature={}",
            self.state.updates,
            self.state
                .baseline
                .map(|b| format!("{:.4}", b))
                .unwrap_or_else(|| "-".into()),
            entropy,
            self.temperature(step)
        )
    }
}

/// Softmax with temperature
fn softmax(logits: &[f64], temperature: f64) -> Vec<f64> {
    let scaled: Vec<f64> = logits.iter().map(|l| l / temperature).collect();
    let max_val = scaled.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp: Vec<f64> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f64 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}

fn sample_categorical(probs: &[f64], rng: &mut impl Rng) -> usize {
    let r: f64 = rng.gen();
    let mut cumsum = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

fn entropy(probs: &[f64]) -> f64 {
    -probs
        .iter()
        .filter(|&&p| p > 1e-10)
        .map(|&p| p * p.ln())
        .sum::<f64>()
}
