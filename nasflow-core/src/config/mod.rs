//! Search configuration documents
//!
//! A document names one type per role (`<role>_type`) with its options
//! (`<role>_cfg`), plus an optional top-level `rollout_type`:
//!
//! ```yaml
//! rollout_type: discrete
//! search_space_type: discrete
//! search_space_cfg: {num_cells: 4, num_ops: 5}
//! controller_type: rl
//! controller_cfg:
//!   schedule_cfg:
//!     entropy_coeff: {type: value, boundary: [1, 60], value: [0.0, 1.0]}
//! ```

use crate::error::{NasError, Result};
use crate::rollout::RolloutType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Component roles, in build order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SearchSpace,
    Dataset,
    Objective,
    WeightsManager,
    Controller,
    Evaluator,
    Trainer,
    FinalModel,
}

impl Role {
    pub const ALL: [Role; 8] = [
        Role::SearchSpace,
        Role::Dataset,
        Role::Objective,
        Role::WeightsManager,
        Role::Controller,
        Role::Evaluator,
        Role::Trainer,
        Role::FinalModel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SearchSpace => "search_space",
            Role::Dataset => "dataset",
            Role::Objective => "objective",
            Role::WeightsManager => "weights_manager",
            Role::Controller => "controller",
            Role::Evaluator => "evaluator",
            Role::Trainer => "trainer",
            Role::FinalModel => "final_model",
        }
    }

    pub fn is_required(&self) -> bool {
        !matches!(self, Role::FinalModel)
    }

    /// Roles whose options carry the shared `rollout_type`
    pub fn carries_rollout_type(&self) -> bool {
        matches!(
            self,
            Role::SearchSpace | Role::Controller | Role::Evaluator | Role::WeightsManager
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = NasError;

    fn from_str(s: &str) -> Result<Self> {
        Role::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| NasError::Config(format!("unknown role '{}'", s)))
    }
}

/// One configured component: `{role, type, options}`
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSpec {
    pub role: Role,
    pub type_name: String,
    pub options: Map<String, Value>,
}

impl ComponentSpec {
    /// The `rollout_type` written in the options, if any
    pub fn stated_rollout_type(&self) -> Result<Option<RolloutType>> {
        match self.options.get("rollout_type") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => s.parse().map(Some),
            Some(other) => Err(NasError::Config(format!(
                "{}_cfg.rollout_type must be a string, got {}",
                self.role, other
            ))),
        }
    }
}

/// A parsed configuration document, not yet validated against the registry
#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub rollout_type: Option<RolloutType>,
    pub components: BTreeMap<Role, ComponentSpec>,
}

impl SearchConfig {
    /// Read a JSON or YAML document, chosen by file extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| NasError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let doc: Value = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text)?,
            _ => serde_json::from_str(&text).map_err(|e| NasError::Config(e.to_string()))?,
        };
        Self::from_value(&doc)
    }

    pub fn from_value(doc: &Value) -> Result<Self> {
        let map = doc
            .as_object()
            .ok_or_else(|| NasError::Config("configuration must be a mapping".into()))?;

        for key in map.keys() {
            let known = key == "rollout_type"
                || Role::ALL.iter().any(|r| {
                    key.strip_prefix(r.as_str())
                        .map(|rest| rest == "_type" || rest == "_cfg")
                        .unwrap_or(false)
                });
            if !known {
                return Err(NasError::Config(format!("unknown top-level key '{}'", key)));
            }
        }

        let rollout_type = match map.get("rollout_type") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.parse()?),
            Some(other) => {
                return Err(NasError::Config(format!("rollout_type must be a string, got {}", other)))
            }
        };

        let mut components = BTreeMap::new();
        for role in Role::ALL {
            let type_key = format!("{}_type", role);
            let cfg_key = format!("{}_cfg", role);
            let type_name = match map.get(&type_key) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => {
                    return Err(NasError::Config(format!("{} must be a string, got {}", type_key, other)))
                }
                None if map.contains_key(&cfg_key) => {
                    return Err(NasError::Config(format!("{} given without {}", cfg_key, type_key)))
                }
                None if role.is_required() => {
                    return Err(NasError::Config(format!("missing required {}", type_key)))
                }
                None => continue,
            };
            let options = match map.get(&cfg_key) {
                None | Some(Value::Null) => Map::new(),
                Some(Value::Object(o)) => o.clone(),
                Some(other) => {
                    return Err(NasError::Config(format!("{} must be a mapping, got {}", cfg_key, other)))
                }
            };
            components.insert(
                role,
                ComponentSpec {
                    role,
                    type_name,
                    options,
                },
            );
        }
        Ok(Self {
            rollout_type,
            components,
        })
    }

    pub fn component(&self, role: Role) -> Option<&ComponentSpec> {
        self.components.get(&role)
    }

    /// The one rollout type every typed component must agree on.
    ///
    /// The top-level value wins when present and every nested value must
    /// equal it. Without it, the nested values must agree with each other.
    /// `None` means nobody stated one.
    pub fn agreed_rollout_type(&self) -> Result<Option<RolloutType>> {
        let mut agreed = self.rollout_type;
        let mut source = "top level".to_string();
        for spec in self.components.values().filter(|s| s.role.carries_rollout_type()) {
            let Some(stated) = spec.stated_rollout_type()? else {
                continue;
            };
            match agreed {
                Some(current) if current != stated => {
                    return Err(NasError::RolloutTypeMismatch(format!(
                        "{}_cfg says {} but {} says {}",
                        spec.role, stated, source, current
                    )))
                }
                Some(_) => {}
                None => {
                    agreed = Some(stated);
                    source = format!("{}_cfg", spec.role);
                }
            }
        }
        Ok(agreed)
    }

    /// Write `rollout_type` into every typed component's options
    pub fn propagate_rollout_type(&mut self, rollout_type: RolloutType) {
        self.rollout_type = Some(rollout_type);
        for spec in self.components.values_mut().filter(|s| s.role.carries_rollout_type()) {
            spec.options.insert(
                "rollout_type".into(),
                Value::String(rollout_type.as_str().into()),
            );
        }
    }

    /// Override the trainer's epoch count
    pub fn set_epochs(&mut self, epochs: u64) -> Result<()> {
        let trainer = self
            .components
            .get_mut(&Role::Trainer)
            .ok_or_else(|| NasError::Config("no trainer configured".into()))?;
        trainer.options.insert("epochs".into(), Value::from(epochs));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> Value {
        json!({
            "search_space_type": "discrete",
            "dataset_type": "synthetic",
            "objective_type": "classification",
            "weights_manager_type": "supernet",
            "controller_type": "enumerative",
            "evaluator_type": "mepa",
            "trainer_type": "simple",
        })
    }

    #[test]
    fn test_parse_minimal_document() {
        let config = SearchConfig::from_value(&minimal()).unwrap();
        assert_eq!(config.components.len(), 7);
        assert_eq!(config.component(Role::Controller).unwrap().type_name, "enumerative");
        assert!(config.component(Role::FinalModel).is_none());
        assert_eq!(config.rollout_type, None);
    }

    #[test]
    fn test_missing_and_unknown_keys() {
        let mut doc = minimal();
        doc.as_object_mut().unwrap().remove("evaluator_type");
        assert!(SearchConfig::from_value(&doc).unwrap_err().to_string().contains("evaluator_type"));

        let mut doc = minimal();
        doc["controler_type"] = json!("rl");
        assert!(SearchConfig::from_value(&doc).is_err());

        let mut doc = minimal();
        doc["final_model_cfg"] = json!({"top_k": 2});
        assert!(SearchConfig::from_value(&doc).is_err());
    }

    #[test]
    fn test_rollout_type_agreement() {
        let mut doc = minimal();
        doc["controller_cfg"] = json!({"rollout_type": "discrete"});
        let config = SearchConfig::from_value(&doc).unwrap();
        assert_eq!(config.agreed_rollout_type().unwrap(), Some(RolloutType::Discrete));

        doc["rollout_type"] = json!("ofa");
        let config = SearchConfig::from_value(&doc).unwrap();
        assert!(matches!(
            config.agreed_rollout_type(),
            Err(NasError::RolloutTypeMismatch(_))
        ));
    }

    #[test]
    fn test_propagation_writes_nested_configs() {
        let mut config = SearchConfig::from_value(&minimal()).unwrap();
        config.propagate_rollout_type(RolloutType::Ofa);
        for role in [Role::SearchSpace, Role::Controller, Role::Evaluator, Role::WeightsManager] {
            assert_eq!(
                config.component(role).unwrap().options["rollout_type"],
                json!("ofa")
            );
        }
        assert!(!config.component(Role::Dataset).unwrap().options.contains_key("rollout_type"));
    }

    #[test]
    fn test_load_yaml_and_json() {
        let dir = std::env::temp_dir().join(format!("nasflow-config-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let yaml = dir.join("search.yaml");
        std::fs::write(
            &yaml,
            "rollout_type: discrete\nsearch_space_type: discrete\ndataset_type: synthetic\n\
             objective_type: classification\nweights_manager_type: supernet\n\
             controller_type: rl\nevaluator_type: mepa\ntrainer_type: simple\n\
             trainer_cfg:\n  epochs: 3\n",
        )
        .unwrap();
        let config = SearchConfig::load(&yaml).unwrap();
        assert_eq!(config.rollout_type, Some(RolloutType::Discrete));
        assert_eq!(config.component(Role::Trainer).unwrap().options["epochs"], json!(3));

        let json_path = dir.join("search.json");
        std::fs::write(&json_path, minimal().to_string()).unwrap();
        assert!(SearchConfig::load(&json_path).is_ok());
        assert!(SearchConfig::load(dir.join("missing.json")).unwrap_err().is_config());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
