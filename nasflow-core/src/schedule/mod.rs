//! Schedule Engine — resolve hyperparameters against the global step
//!
//! Every component keeps its rules in a [`ScheduleSet`] and asks for the
//! value at the step it was handed. Nothing schedule-derived is cached.

mod rule;
mod step;

pub use rule::{ScheduleKind, ScheduleRule};
pub use step::{StepCounter, StepReader, StepUnit};

use crate::error::{NasError, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// Shape a schedulable attribute must resolve to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrShape {
    /// A single number
    Scalar,
    /// A number or an array of numbers
    Numeric,
}

/// Named rules belonging to one component
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleSet {
    rules: BTreeMap<String, ScheduleRule>,
}

impl ScheduleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `schedule_cfg` mapping of attribute name -> rule document
    pub fn parse(doc: &Value) -> Result<Self> {
        let map = match doc {
            Value::Null => return Ok(Self::new()),
            Value::Object(map) => map,
            other => {
                return Err(NasError::Config(format!(
                    "schedule_cfg must be a mapping, got {}",
                    other
                )))
            }
        };
        let mut rules = BTreeMap::new();
        for (name, rule_doc) in map {
            rules.insert(name.clone(), ScheduleRule::parse(name, rule_doc)?);
        }
        Ok(Self { rules })
    }

    /// Check every rule names a declared attribute of the right shape
    pub fn check_attributes(&self, declared: &[(&str, AttrShape)]) -> Result<()> {
        for (name, rule) in &self.rules {
            let shape = declared
                .iter()
                .find(|(attr, _)| attr == name)
                .map(|(_, shape)| *shape)
                .ok_or_else(|| NasError::schedule(name, "not a schedulable attribute"))?;
            let ok = match shape {
                AttrShape::Scalar => rule.is_scalar(),
                AttrShape::Numeric => rule.is_numeric(),
            };
            if !ok {
                return Err(NasError::schedule(
                    name,
                    format!("values do not fit the {:?} shape", shape),
                ));
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, name: impl Into<String>, rule: ScheduleRule) {
        self.rules.insert(name.into(), rule);
    }

    pub fn get(&self, name: &str) -> Option<&ScheduleRule> {
        self.rules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Scheduled scalar at `step`, or `base` when the attribute is unscheduled
    pub fn f64(&self, name: &str, step: u64, base: f64) -> f64 {
        self.rules
            .get(name)
            .and_then(|r| r.resolve_f64(step))
            .unwrap_or(base)
    }

    /// Scheduled count at `step`, or `base`. Fractional values (linear
    /// ramps, `4.0` literals) round to the nearest integer, negatives clamp
    /// to zero.
    pub fn u64(&self, name: &str, step: u64, base: u64) -> u64 {
        self.rules
            .get(name)
            .and_then(|r| r.resolve_f64(step))
            .map(|v| v.max(0.0).round() as u64)
            .unwrap_or(base)
    }

    /// Scheduled numeric vector at `step`, or `base`
    pub fn vec(&self, name: &str, step: u64, base: &[f64]) -> Vec<f64> {
        self.rules
            .get(name)
            .and_then(|r| r.resolve_vec(step))
            .unwrap_or_else(|| base.to_vec())
    }

    /// Snapshot of every scheduled value at `step`, for logging
    pub fn resolve_all(&self, step: u64) -> BTreeMap<String, Value> {
        self.rules
            .iter()
            .map(|(name, rule)| (name.clone(), rule.resolve(step)))
            .collect()
    }
}
