//! Final model export — persist the best architectures found by a search

use crate::error::{NasError, Result};
use crate::rollout::Rollout;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::{Path, PathBuf};

pub trait FinalModel: Debug + Send + Sync {
    /// Write the selected architectures under `dir`; returns the file written
    fn export(&self, candidates: &[Rollout], dir: &Path) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GenotypeExportConfig {
    /// Number of best valid rollouts to keep
    pub top_k: usize,
    pub filename: String,
}

impl Default for GenotypeExportConfig {
    fn default() -> Self {
        Self {
            top_k: 1,
            filename: "final_genotypes.json".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedGenotype {
    pub genotype: String,
    pub reward: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenotypeExport {
    pub created_at: DateTime<Utc>,
    pub genotypes: Vec<ExportedGenotype>,
}

#[derive(Debug, Clone)]
pub struct GenotypeExporter {
    pub config: GenotypeExportConfig,
}

impl GenotypeExporter {
    pub fn new(config: GenotypeExportConfig) -> Result<Self> {
        if config.top_k == 0 {
            return Err(NasError::Config("top_k must be positive".into()));
        }
        if config.filename.is_empty() || config.filename.contains(['/', '\\']) {
            return Err(NasError::Config(format!("invalid export filename '{}'", config.filename)));
        }
        Ok(Self { config })
    }

    /// Best distinct genotypes, highest reward first
    pub fn select(&self, candidates: &[Rollout]) -> Vec<ExportedGenotype> {
        let mut scored: Vec<ExportedGenotype> = candidates
            .iter()
            .filter_map(|r| {
                r.scored_reward().map(|reward| ExportedGenotype {
                    genotype: r.genotype().to_string(),
                    reward,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.reward.partial_cmp(&a.reward).unwrap_or(std::cmp::Ordering::Equal));
        let mut seen = std::collections::HashSet::new();
        scored.retain(|g| seen.insert(g.genotype.clone()));
        scored.truncate(self.config.top_k);
        scored
    }
}

impl FinalModel for GenotypeExporter {
    fn export(&self, candidates: &[Rollout], dir: &Path) -> Result<PathBuf> {
        let genotypes = self.select(candidates);
        if genotypes.is_empty() {
            return Err(NasError::Runtime("no valid rollout to export".into()));
        }
        std::fs::create_dir_all(dir)?;
        let path = dir.join(&self.config.filename);
        let doc = GenotypeExport {
            created_at: Utc::now(),
            genotypes,
        };
        std::fs::write(&path, serde_json::to_string_pretty(&doc)?)?;
        info!(
            "Exported {} genotype(s) to {}, best reward {:.4}",
            doc.genotypes.len(),
            path.display(),
            doc.genotypes[0].reward
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::RolloutType;

    fn scored(text: &str, reward: Option<f64>) -> Rollout {
        let mut r = Rollout::new(RolloutType::Discrete, text.parse().unwrap());
        match reward {
            Some(v) => r.record_score(v).unwrap(),
            None => r.mark_invalid("crashed").unwrap(),
        }
        r
    }

    #[test]
    fn test_select_best_distinct() {
        let exporter = GenotypeExporter::new(GenotypeExportConfig {
            top_k: 2,
            ..GenotypeExportConfig::default()
        })
        .unwrap();
        let picks = exporter.select(&[
            scored("cell_0=0", Some(0.3)),
            scored("cell_0=1", Some(0.9)),
            scored("cell_0=1", Some(0.8)),
            scored("cell_0=2", None),
            scored("cell_0=3", Some(0.5)),
        ]);
        assert_eq!(picks.len(), 2);
        assert_eq!(picks[0].genotype, "cell_0=1");
        assert_eq!(picks[0].reward, 0.9);
        assert_eq!(picks[1].genotype, "cell_0=3");
    }

    #[test]
    fn test_export_writes_file() {
        let dir = std::env::temp_dir().join(format!("nasflow-export-test-{}", uuid::Uuid::new_v4()));
        let exporter = GenotypeExporter::new(GenotypeExportConfig::default()).unwrap();
        let path = exporter.export(&[scored("cell_0=2", Some(0.7))], &dir).unwrap();
        let doc: GenotypeExport = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc.genotypes[0].genotype, "cell_0=2");
        assert!(exporter.export(&[scored("cell_0=2", None)], &dir).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_invalid_config() {
        assert!(GenotypeExporter::new(GenotypeExportConfig {
            top_k: 0,
            ..GenotypeExportConfig::default()
        })
        .is_err());
        assert!(GenotypeExporter::new(GenotypeExportConfig {
            top_k: 1,
            filename: "../escape.json".into(),
        })
        .is_err());
    }
}
