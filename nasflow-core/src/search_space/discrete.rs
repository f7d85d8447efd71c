//! Discrete cell space: one operation choice per cell

use super::SearchSpace;
use crate::error::{NasError, Result};
use crate::rollout::{Gene, Genotype, RolloutType};
use crate::weights::{ParamKey, SlotSpec};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DiscreteSpaceConfig {
    pub num_cells: u32,
    pub num_ops: u32,
    /// Optional op names, for logging only
    pub op_names: Vec<String>,
    pub rollout_type: Option<RolloutType>,
}

impl Default for DiscreteSpaceConfig {
    fn default() -> Self {
        Self {
            num_cells: 4,
            num_ops: 5,
            op_names: Vec::new(),
            rollout_type: None,
        }
    }
}

impl DiscreteSpaceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_cells == 0 || self.num_ops == 0 {
            return Err(NasError::Config(
                "discrete space needs at least one cell and one op".into(),
            ));
        }
        if !self.op_names.is_empty() && self.op_names.len() != self.num_ops as usize {
            return Err(NasError::Config(format!(
                "{} op names for {} ops",
                self.op_names.len(),
                self.num_ops
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DiscreteSearchSpace {
    pub config: DiscreteSpaceConfig,
}

impl DiscreteSearchSpace {
    pub fn new(config: DiscreteSpaceConfig) -> Self {
        Self { config }
    }

    fn cell_key(cell: u32) -> String {
        format!("cell_{}", cell)
    }

    pub fn op_name(&self, op: u32) -> String {
        self.config
            .op_names
            .get(op as usize)
            .cloned()
            .unwrap_or_else(|| format!("op{}", op))
    }
}

impl SearchSpace for DiscreteSearchSpace {
    fn rollout_type(&self) -> RolloutType {
        RolloutType::Discrete
    }

    fn decisions(&self) -> Vec<usize> {
        vec![self.config.num_ops as usize; self.config.num_cells as usize]
    }

    fn genotype_from_decisions(&self, decisions: &[usize]) -> Result<Genotype> {
        if decisions.len() != self.config.num_cells as usize {
            return Err(NasError::Genotype(format!(
                "expected {} decisions, got {}",
                self.config.num_cells,
                decisions.len()
            )));
        }
        let mut genotype = Genotype::new();
        for (cell, &op) in decisions.iter().enumerate() {
            if op >= self.config.num_ops as usize {
                return Err(NasError::Genotype(format!("op {} out of range", op)));
            }
            genotype.push(Self::cell_key(cell as u32), Gene::Choice(op as u32))?;
        }
        Ok(genotype)
    }

    fn decisions_of(&self, genotype: &Genotype) -> Result<Vec<usize>> {
        (0..self.config.num_cells)
            .map(|cell| {
                let key = Self::cell_key(cell);
                let op = genotype
                    .choice(&key)
                    .ok_or_else(|| NasError::Genotype(format!("missing '{}'", key)))?;
                if op >= self.config.num_ops {
                    return Err(NasError::Genotype(format!("op {} out of range for '{}'", op, key)));
                }
                Ok(op as usize)
            })
            .collect()
    }

    fn slot_specs(&self) -> Vec<SlotSpec> {
        let mut specs = vec![
            SlotSpec::parameter(ParamKey::common("stem")),
            SlotSpec::parameter(ParamKey::common("classifier")),
        ];
        for cell in 0..self.config.num_cells {
            for op in 0..self.config.num_ops {
                specs.push(SlotSpec::parameter(ParamKey::cell(cell, op, 0)));
            }
            specs.push(SlotSpec::buffer(ParamKey::Stats { cell }));
        }
        specs
    }

    fn active_keys(&self, genotype: &Genotype) -> Result<Vec<ParamKey>> {
        let decisions = self.decisions_of(genotype)?;
        let mut keys = vec![ParamKey::common("stem"), ParamKey::common("classifier")];
        for (cell, op) in decisions.into_iter().enumerate() {
            keys.push(ParamKey::cell(cell as u32, op as u32, 0));
            keys.push(ParamKey::Stats { cell: cell as u32 });
        }
        Ok(keys)
    }
}
