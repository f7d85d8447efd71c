//! Component registry — the closed table of buildable types
//!
//! Building is two-phase. [`validate`] resolves every `(role, type)` pair,
//! settles the shared rollout type, parses each `schedule_cfg` and each
//! options block into its typed config. Only a fully validated configuration
//! reaches [`build`], so a bad document never constructs anything.

use crate::config::{ComponentSpec, Role, SearchConfig};
use crate::controller::{Controller, EnumerativeConfig, EnumerativeController, RlController, RlControllerConfig};
use crate::dataset::{Dataset, SyntheticConfig, SyntheticDataset};
use crate::error::{NasError, Result};
use crate::evaluator::{Evaluator, MepaConfig, MepaEvaluator};
use crate::final_model::{FinalModel, GenotypeExportConfig, GenotypeExporter};
use crate::objective::{ClassificationConfig, ClassificationObjective, Objective};
use crate::rollout::RolloutType;
use crate::schedule::{AttrShape, ScheduleSet};
use crate::search_space::{DiscreteSearchSpace, DiscreteSpaceConfig, OfaSearchSpace, OfaSpaceConfig, SearchSpace};
use crate::trainer::SearchTrainerConfig;
use crate::weights::{SupernetConfig, WeightsManager};
use log::info;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Typed options of one registered component type
#[derive(Debug, Clone)]
pub enum ComponentOptions {
    DiscreteSpace(DiscreteSpaceConfig),
    OfaSpace(OfaSpaceConfig),
    Synthetic(SyntheticConfig),
    Classification(ClassificationConfig),
    Supernet(SupernetConfig),
    Enumerative(EnumerativeConfig),
    Rl(RlControllerConfig),
    Mepa(MepaConfig),
    Simple(SearchTrainerConfig),
    GenotypeExport(GenotypeExportConfig),
}

impl ComponentOptions {
    fn validate(&self) -> Result<()> {
        match self {
            ComponentOptions::DiscreteSpace(c) => c.validate(),
            ComponentOptions::OfaSpace(c) => c.validate(),
            ComponentOptions::Supernet(c) => c.validate(),
            ComponentOptions::Mepa(c) => c.validate(),
            ComponentOptions::Simple(c) => c.validate(),
            _ => Ok(()),
        }
    }
}

type OptionsParser = fn(Map<String, Value>) -> std::result::Result<ComponentOptions, String>;

/// One row of the registry
#[derive(Debug)]
pub struct RegistryEntry {
    pub role: Role,
    pub type_name: &'static str,
    pub schedulable: &'static [(&'static str, AttrShape)],
    /// Rollout types the component works with; empty when it does not care
    pub rollout_types: &'static [RolloutType],
    parse: OptionsParser,
}

fn parse_as<T: DeserializeOwned>(options: Map<String, Value>) -> std::result::Result<T, String> {
    serde_json::from_value(Value::Object(options)).map_err(|e| e.to_string())
}

const BOTH: &[RolloutType] = &[RolloutType::Discrete, RolloutType::Ofa];

static REGISTRY: &[RegistryEntry] = &[
    RegistryEntry {
        role: Role::SearchSpace,
        type_name: "discrete",
        schedulable: &[],
        rollout_types: &[RolloutType::Discrete],
        parse: |o| parse_as(o).map(ComponentOptions::DiscreteSpace),
    },
    RegistryEntry {
        role: Role::SearchSpace,
        type_name: "ofa",
        schedulable: &[],
        rollout_types: &[RolloutType::Ofa],
        parse: |o| parse_as(o).map(ComponentOptions::OfaSpace),
    },
    RegistryEntry {
        role: Role::Dataset,
        type_name: "synthetic",
        schedulable: &[],
        rollout_types: &[],
        parse: |o| parse_as(o).map(ComponentOptions::Synthetic),
    },
    RegistryEntry {
        role: Role::Objective,
        type_name: "classification",
        schedulable: ClassificationObjective::SCHEDULABLE,
        rollout_types: &[],
        parse: |o| parse_as(o).map(ComponentOptions::Classification),
    },
    RegistryEntry {
        role: Role::WeightsManager,
        type_name: "supernet",
        schedulable: &[],
        rollout_types: BOTH,
        parse: |o| parse_as(o).map(ComponentOptions::Supernet),
    },
    RegistryEntry {
        role: Role::Controller,
        type_name: "enumerative",
        schedulable: &[],
        rollout_types: BOTH,
        parse: |o| parse_as(o).map(ComponentOptions::Enumerative),
    },
    RegistryEntry {
        role: Role::Controller,
        type_name: "rl",
        schedulable: RlController::SCHEDULABLE,
        rollout_types: BOTH,
        parse: |o| parse_as(o).map(ComponentOptions::Rl),
    },
    RegistryEntry {
        role: Role::Evaluator,
        type_name: "mepa",
        schedulable: MepaEvaluator::SCHEDULABLE,
        rollout_types: BOTH,
        parse: |o| parse_as(o).map(ComponentOptions::Mepa),
    },
    RegistryEntry {
        role: Role::Trainer,
        type_name: "simple",
        schedulable: SearchTrainerConfig::SCHEDULABLE,
        rollout_types: &[],
        parse: |o| parse_as(o).map(ComponentOptions::Simple),
    },
    RegistryEntry {
        role: Role::FinalModel,
        type_name: "genotype_export",
        schedulable: &[],
        rollout_types: &[],
        parse: |o| parse_as(o).map(ComponentOptions::GenotypeExport),
    },
];

pub fn lookup(role: Role, type_name: &str) -> Result<&'static RegistryEntry> {
    REGISTRY
        .iter()
        .find(|e| e.role == role && e.type_name == type_name)
        .ok_or_else(|| NasError::UnknownType {
            role: role.to_string(),
            type_name: type_name.to_string(),
        })
}

/// Registered type names for a role
pub fn types_for(role: Role) -> Vec<&'static str> {
    REGISTRY
        .iter()
        .filter(|e| e.role == role)
        .map(|e| e.type_name)
        .collect()
}

/// A component that passed validation, ready to construct
#[derive(Debug, Clone)]
pub struct ValidatedComponent {
    pub role: Role,
    pub type_name: &'static str,
    pub options: ComponentOptions,
    pub schedule: ScheduleSet,
}

#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub rollout_type: RolloutType,
    /// In build order
    pub components: Vec<ValidatedComponent>,
}

fn validate_component(entry: &'static RegistryEntry, spec: &ComponentSpec) -> Result<ValidatedComponent> {
    let mut options = spec.options.clone();
    let schedule = ScheduleSet::parse(&options.remove("schedule_cfg").unwrap_or(Value::Null))?;
    schedule.check_attributes(entry.schedulable)?;
    let parsed = (entry.parse)(options).map_err(|reason| NasError::InvalidOptions {
        role: spec.role.to_string(),
        type_name: spec.type_name.clone(),
        reason,
    })?;
    parsed.validate()?;
    Ok(ValidatedComponent {
        role: spec.role,
        type_name: entry.type_name,
        options: parsed,
        schedule,
    })
}

/// Check a whole configuration without constructing anything
pub fn validate(config: &SearchConfig) -> Result<ValidatedConfig> {
    let entries = config
        .components
        .values()
        .map(|spec| lookup(spec.role, &spec.type_name).map(|e| (spec.role, e)))
        .collect::<Result<BTreeMap<_, _>>>()?;

    let space_entry = entries
        .get(&Role::SearchSpace)
        .ok_or_else(|| NasError::Config("no search space configured".into()))?;
    let rollout_type = match config.agreed_rollout_type()? {
        Some(rt) => rt,
        None => *space_entry
            .rollout_types
            .first()
            .ok_or_else(|| NasError::Config("search space declares no rollout type".into()))?,
    };
    for (role, entry) in &entries {
        if !entry.rollout_types.is_empty() && !entry.rollout_types.contains(&rollout_type) {
            return Err(NasError::RolloutTypeMismatch(format!(
                "{} type '{}' does not support rollout_type {}",
                role, entry.type_name, rollout_type
            )));
        }
    }

    let mut resolved = config.clone();
    resolved.propagate_rollout_type(rollout_type);
    let components = resolved
        .components
        .values()
        .map(|spec| validate_component(entries[&spec.role], spec))
        .collect::<Result<Vec<_>>>()?;
    Ok(ValidatedConfig {
        rollout_type,
        components,
    })
}

/// Constructed search stack
pub struct Components {
    pub rollout_type: RolloutType,
    pub search_space: Arc<dyn SearchSpace>,
    pub dataset: Arc<dyn Dataset>,
    pub objective: Arc<dyn Objective>,
    pub weights: WeightsManager,
    pub controller: Box<dyn Controller>,
    pub evaluator: Box<dyn Evaluator>,
    pub trainer: SearchTrainerConfig,
    pub trainer_schedule: ScheduleSet,
    pub final_model: Option<Box<dyn FinalModel>>,
    /// Every component's rules, for logging resolved values
    pub schedules: BTreeMap<Role, ScheduleSet>,
}

impl std::fmt::Debug for Components {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Components")
            .field("rollout_type", &self.rollout_type)
            .field("search_space", &self.search_space)
            .field("controller", &self.controller)
            .field("evaluator", &self.evaluator)
            .finish()
    }
}

fn missing(role: Role) -> NasError {
    NasError::Config(format!("no {} configured", role))
}

/// Construct a validated configuration in dependency order
pub fn build(validated: ValidatedConfig) -> Result<Components> {
    let mut search_space: Option<Arc<dyn SearchSpace>> = None;
    let mut dataset: Option<Arc<dyn Dataset>> = None;
    let mut objective: Option<Arc<dyn Objective>> = None;
    let mut weights: Option<WeightsManager> = None;
    let mut controller: Option<Box<dyn Controller>> = None;
    let mut evaluator: Option<Box<dyn Evaluator>> = None;
    let mut trainer: Option<(SearchTrainerConfig, ScheduleSet)> = None;
    let mut final_model: Option<Box<dyn FinalModel>> = None;
    let mut schedules = BTreeMap::new();

    for component in validated.components {
        let ValidatedComponent {
            role,
            type_name,
            options,
            schedule,
        } = component;
        schedules.insert(role, schedule.clone());
        match options {
            ComponentOptions::DiscreteSpace(c) => search_space = Some(Arc::new(DiscreteSearchSpace::new(c))),
            ComponentOptions::OfaSpace(c) => search_space = Some(Arc::new(OfaSearchSpace::new(c))),
            ComponentOptions::Synthetic(c) => dataset = Some(Arc::new(SyntheticDataset::new(c)?)),
            ComponentOptions::Classification(c) => {
                objective = Some(Arc::new(ClassificationObjective::new(c, schedule)?))
            }
            ComponentOptions::Supernet(c) => {
                let space = search_space.clone().ok_or_else(|| missing(Role::SearchSpace))?;
                let data = dataset.as_ref().ok_or_else(|| missing(Role::Dataset))?;
                weights = Some(WeightsManager::new(space, c, data.input_dim())?);
            }
            ComponentOptions::Enumerative(c) => {
                let space = search_space.clone().ok_or_else(|| missing(Role::SearchSpace))?;
                controller = Some(Box::new(EnumerativeController::new(space, c)?));
            }
            ComponentOptions::Rl(c) => {
                let space = search_space.clone().ok_or_else(|| missing(Role::SearchSpace))?;
                controller = Some(Box::new(RlController::new(space, c, schedule)?));
            }
            ComponentOptions::Mepa(c) => {
                let wm = weights.clone().ok_or_else(|| missing(Role::WeightsManager))?;
                let data = dataset.clone().ok_or_else(|| missing(Role::Dataset))?;
                let obj = objective.clone().ok_or_else(|| missing(Role::Objective))?;
                evaluator = Some(Box::new(MepaEvaluator::new(c, schedule, wm, data, obj)?));
            }
            ComponentOptions::Simple(c) => trainer = Some((c, schedule)),
            ComponentOptions::GenotypeExport(c) => final_model = Some(Box::new(GenotypeExporter::new(c)?)),
        }
        info!("Built {} '{}'", role, type_name);
    }

    let (trainer, trainer_schedule) = trainer.ok_or_else(|| missing(Role::Trainer))?;
    Ok(Components {
        rollout_type: validated.rollout_type,
        search_space: search_space.ok_or_else(|| missing(Role::SearchSpace))?,
        dataset: dataset.ok_or_else(|| missing(Role::Dataset))?,
        objective: objective.ok_or_else(|| missing(Role::Objective))?,
        weights: weights.ok_or_else(|| missing(Role::WeightsManager))?,
        controller: controller.ok_or_else(|| missing(Role::Controller))?,
        evaluator: evaluator.ok_or_else(|| missing(Role::Evaluator))?,
        trainer,
        trainer_schedule,
        final_model,
        schedules,
    })
}

/// Validate, then build
pub fn build_all(config: &SearchConfig) -> Result<Components> {
    build(validate(config)?)
}
