//! Elastic (once-for-all style) space: depth per cell, expansion and kernel
//! size per block.
//!
//! Blocks past a cell's depth are inactive. A block with expansion `e`
//! uses channel groups `0..e` of its kernel's slot family, so every smaller
//! expansion shares a prefix of the weights of the larger ones.

use super::{choice_index, SearchSpace};
use crate::error::{NasError, Result};
use crate::rollout::{Gene, Genotype, RolloutType};
use crate::weights::{ParamKey, SlotSpec};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OfaSpaceConfig {
    pub num_cells: u32,
    pub depth_choices: Vec<u32>,
    pub expansion_choices: Vec<u32>,
    pub kernel_choices: Vec<u32>,
    pub rollout_type: Option<RolloutType>,
}

impl Default for OfaSpaceConfig {
    fn default() -> Self {
        Self {
            num_cells: 3,
            depth_choices: vec![1, 2, 3],
            expansion_choices: vec![1, 3, 6],
            kernel_choices: vec![3, 5, 7],
            rollout_type: None,
        }
    }
}

impl OfaSpaceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_cells == 0 {
            return Err(NasError::Config("ofa space needs at least one cell".into()));
        }
        for (name, choices) in [
            ("depth_choices", &self.depth_choices),
            ("expansion_choices", &self.expansion_choices),
            ("kernel_choices", &self.kernel_choices),
        ] {
            if choices.is_empty() || choices.contains(&0) {
                return Err(NasError::Config(format!(
                    "{} must be non-empty and positive",
                    name
                )));
            }
            let mut sorted = choices.clone();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.len() != choices.len() {
                return Err(NasError::Config(format!("{} has duplicates", name)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OfaSearchSpace {
    pub config: OfaSpaceConfig,
    max_depth: u32,
    max_expansion: u32,
}

impl OfaSearchSpace {
    pub fn new(config: OfaSpaceConfig) -> Self {
        let max_depth = config.depth_choices.iter().copied().max().unwrap_or(1);
        let max_expansion = config.expansion_choices.iter().copied().max().unwrap_or(1);
        Self {
            config,
            max_depth,
            max_expansion,
        }
    }

    fn depth_key(cell: u32) -> String {
        format!("cell_{}", cell)
    }

    fn block_key(cell: u32, block: u32) -> String {
        format!("cell_{}_block_{}", cell, block)
    }

    fn op_index(&self, block: u32, kernel_idx: usize) -> u32 {
        block * self.config.kernel_choices.len() as u32 + kernel_idx as u32
    }

    /// (depth, [(expansion, kernel)]) for each cell, validated
    fn parse_cells(&self, genotype: &Genotype) -> Result<Vec<(u32, Vec<(u32, u32)>)>> {
        (0..self.config.num_cells)
            .map(|cell| {
                let key = Self::depth_key(cell);
                let depth = genotype
                    .choice(&key)
                    .ok_or_else(|| NasError::Genotype(format!("missing '{}'", key)))?;
                choice_index(&self.config.depth_choices, depth, &key)?;
                let blocks = (0..self.max_depth)
                    .map(|block| {
                        let key = Self::block_key(cell, block);
                        let (e, k) = genotype
                            .pair(&key)
                            .ok_or_else(|| NasError::Genotype(format!("missing pair '{}'", key)))?;
                        choice_index(&self.config.expansion_choices, e, &key)?;
                        choice_index(&self.config.kernel_choices, k, &key)?;
                        Ok((e, k))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok((depth, blocks))
            })
            .collect()
    }
}

impl SearchSpace for OfaSearchSpace {
    fn rollout_type(&self) -> RolloutType {
        RolloutType::Ofa
    }

    fn decisions(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for _ in 0..self.config.num_cells {
            out.push(self.config.depth_choices.len());
            for _ in 0..self.max_depth {
                out.push(self.config.expansion_choices.len());
                out.push(self.config.kernel_choices.len());
            }
        }
        out
    }

    fn genotype_from_decisions(&self, decisions: &[usize]) -> Result<Genotype> {
        let expected = self.decisions();
        if decisions.len() != expected.len() {
            return Err(NasError::Genotype(format!(
                "expected {} decisions, got {}",
                expected.len(),
                decisions.len()
            )));
        }
        if let Some(i) = decisions.iter().zip(&expected).position(|(d, n)| d >= n) {
            return Err(NasError::Genotype(format!("decision {} out of range", i)));
        }

        let mut genotype = Genotype::new();
        let mut it = decisions.iter();
        // lengths were checked above, so the iterator cannot run dry
        let mut next = || it.next().copied().unwrap_or(0);
        for cell in 0..self.config.num_cells {
            let depth = self.config.depth_choices[next()];
            genotype.push(Self::depth_key(cell), Gene::Choice(depth))?;
            for block in 0..self.max_depth {
                let e = self.config.expansion_choices[next()];
                let k = self.config.kernel_choices[next()];
                genotype.push(Self::block_key(cell, block), Gene::Pair(e, k))?;
            }
        }
        Ok(genotype)
    }

    fn decisions_of(&self, genotype: &Genotype) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        for (cell, (depth, blocks)) in self.parse_cells(genotype)?.into_iter().enumerate() {
            let key = Self::depth_key(cell as u32);
            out.push(choice_index(&self.config.depth_choices, depth, &key)?);
            for (e, k) in blocks {
                out.push(choice_index(&self.config.expansion_choices, e, &key)?);
                out.push(choice_index(&self.config.kernel_choices, k, &key)?);
            }
        }
        Ok(out)
    }

    fn slot_specs(&self) -> Vec<SlotSpec> {
        let mut specs = vec![
            SlotSpec::parameter(ParamKey::common("stem")),
            SlotSpec::parameter(ParamKey::common("classifier")),
        ];
        for cell in 0..self.config.num_cells {
            for block in 0..self.max_depth {
                for kernel_idx in 0..self.config.kernel_choices.len() {
                    let op = self.op_index(block, kernel_idx);
                    for group in 0..self.max_expansion {
                        specs.push(SlotSpec::parameter(ParamKey::cell(cell, op, group)));
                    }
                }
            }
            specs.push(SlotSpec::buffer(ParamKey::Stats { cell }));
        }
        specs
    }

    fn active_keys(&self, genotype: &Genotype) -> Result<Vec<ParamKey>> {
        let mut keys = vec![ParamKey::common("stem"), ParamKey::common("classifier")];
        for (cell, (depth, blocks)) in self.parse_cells(genotype)?.into_iter().enumerate() {
            let cell = cell as u32;
            for (block, (e, k)) in blocks.into_iter().enumerate().take(depth as usize) {
                let key = Self::block_key(cell, block as u32);
                let kernel_idx = choice_index(&self.config.kernel_choices, k, &key)?;
                let op = self.op_index(block as u32, kernel_idx);
                for group in 0..e {
                    keys.push(ParamKey::cell(cell, op, group));
                }
            }
            keys.push(ParamKey::Stats { cell });
        }
        Ok(keys)
    }
}
