//! Checkpoints — versioned, checksummed search snapshots
//!
//! Provides:
//! - One file per checkpoint holding trainer state, supernet pool,
//!   controller state and history together
//! - A manifest with SHA256 checksums, verified on load
//! - Atomic writes (temp file, fsync, rename) so a failed save never
//!   corrupts an earlier checkpoint
//! - Retention of the latest N checkpoints

use crate::error::{NasError, Result};
use crate::rollout::{Rollout, RolloutType};
use crate::trainer::{EpochRecord, TrainerState};
use crate::weights::PoolState;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

const MANIFEST: &str = "manifest.json";

/// Everything a resumed search needs, saved as one unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub rollout_type: RolloutType,
    pub trainer: TrainerState,
    pub pool: PoolState,
    pub controller: Value,
    pub history: Vec<EpochRecord>,
    pub best: Option<Rollout>,
}

/// Metadata for a single checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub checksum: String,
    pub size_bytes: u64,
    pub epoch: u64,
    pub global_step: u64,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub checkpoints: Vec<CheckpointMeta>,
    pub next_version: u64,
}

impl Default for CheckpointManifest {
    fn default() -> Self {
        Self {
            checkpoints: Vec::new(),
            next_version: 1,
        }
    }
}

/// Write `data` to `path` through a temp file in the same directory
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    manifest: CheckpointManifest,
}

impl CheckpointManager {
    /// Open a checkpoint directory, loading its manifest when present
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let manifest_path = dir.join(MANIFEST);
        let manifest = if manifest_path.exists() {
            let json = std::fs::read_to_string(&manifest_path)?;
            let manifest: CheckpointManifest = serde_json::from_str(&json)
                .map_err(|e| NasError::Checkpoint(format!("unreadable manifest: {}", e)))?;
            info!("Loaded checkpoint manifest with {} entries", manifest.checkpoints.len());
            manifest
        } else {
            CheckpointManifest::default()
        };
        Ok(Self { dir, manifest })
    }

    fn save_manifest(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.manifest)?;
        write_atomic(&self.dir.join(MANIFEST), &json)
    }

    /// Write a new checkpoint version
    pub fn save(&mut self, checkpoint: &Checkpoint) -> Result<CheckpointMeta> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| NasError::Checkpoint(format!("cannot create {}: {}", self.dir.display(), e)))?;
        let data = serde_json::to_vec(checkpoint)?;
        let version = self.manifest.next_version;
        let now = Utc::now();
        let filename = format!("checkpoint_v{:04}_{}.json", version, now.format("%Y%m%d_%H%M%S"));
        write_atomic(&self.dir.join(&filename), &data)
            .map_err(|e| NasError::Checkpoint(format!("writing {}: {}", filename, e)))?;

        let meta = CheckpointMeta {
            version,
            timestamp: now,
            checksum: checksum(&data),
            size_bytes: data.len() as u64,
            epoch: checkpoint.trainer.epoch,
            global_step: checkpoint.trainer.global_step,
            filename,
        };
        self.manifest.checkpoints.push(meta.clone());
        self.manifest.next_version += 1;
        if let Err(e) = self.save_manifest() {
            self.manifest.checkpoints.pop();
            self.manifest.next_version -= 1;
            let _ = std::fs::remove_file(self.dir.join(&meta.filename));
            return Err(NasError::Checkpoint(format!("writing manifest: {}", e)));
        }

        info!(
            "Created checkpoint v{}: epoch {} step {} ({} bytes)",
            version,
            meta.epoch,
            meta.global_step,
            data.len()
        );
        Ok(meta)
    }

    /// Load a checkpoint by version, verifying its checksum
    pub fn load(&self, version: u64) -> Result<Checkpoint> {
        let meta = self
            .manifest
            .checkpoints
            .iter()
            .find(|m| m.version == version)
            .ok_or_else(|| NasError::Checkpoint(format!("checkpoint v{} not found", version)))?;
        let data = std::fs::read(self.dir.join(&meta.filename))?;
        let actual = checksum(&data);
        if actual != meta.checksum {
            return Err(NasError::Checkpoint(format!(
                "checksum mismatch for v{}: expected {}, got {}",
                version, meta.checksum, actual
            )));
        }
        info!("Loaded checkpoint v{}: {} bytes, checksum OK", version, data.len());
        serde_json::from_slice(&data).map_err(|e| NasError::Checkpoint(e.to_string()))
    }

    /// The newest checkpoint, or `None` for an empty directory
    pub fn load_latest(&self) -> Result<Option<Checkpoint>> {
        match self.manifest.checkpoints.last() {
            Some(meta) => self.load(meta.version).map(Some),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> &[CheckpointMeta] {
        &self.manifest.checkpoints
    }

    pub fn len(&self) -> usize {
        self.manifest.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.checkpoints.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Checksum status of every checkpoint
    pub fn verify_all(&self) -> Vec<(u64, bool)> {
        self.manifest
            .checkpoints
            .iter()
            .map(|meta| {
                let ok = std::fs::read(self.dir.join(&meta.filename))
                    .map(|data| checksum(&data) == meta.checksum)
                    .unwrap_or(false);
                (meta.version, ok)
            })
            .collect()
    }

    /// Remove old checkpoints, keeping only the latest `keep`
    pub fn retain_latest(&mut self, keep: usize) -> Result<usize> {
        if self.manifest.checkpoints.len() <= keep {
            return Ok(0);
        }
        let remove_count = self.manifest.checkpoints.len() - keep;
        let removed: Vec<CheckpointMeta> = self.manifest.checkpoints.drain(..remove_count).collect();
        self.save_manifest()?;
        for meta in &removed {
            if let Err(e) = std::fs::remove_file(self.dir.join(&meta.filename)) {
                warn!("Could not remove {}: {}", meta.filename, e);
            }
        }
        info!("Removed {} old checkpoints, keeping latest {}", remove_count, keep);
        Ok(remove_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::{ParamKey, SlotKind, SlotState};
    use serde_json::json;

    fn test_dir() -> PathBuf {
        std::env::temp_dir().join(format!("nasflow-checkpoint-test-{}", uuid::Uuid::new_v4()))
    }

    fn checkpoint(epoch: u64) -> Checkpoint {
        Checkpoint {
            rollout_type: RolloutType::Discrete,
            trainer: TrainerState {
                epoch,
                global_step: epoch,
                controller_train_countdown: 1,
            },
            pool: PoolState {
                slots: vec![SlotState {
                    key: ParamKey::common("stem"),
                    kind: SlotKind::Parameter,
                    values: vec![epoch as f64, 0.5],
                }],
            },
            controller: json!({"cursor": epoch}),
            history: Vec::new(),
            best: None,
        }
    }

    #[test]
    fn test_save_and_load_latest() {
        let dir = test_dir();
        let mut mgr = CheckpointManager::open(&dir).unwrap();
        assert!(mgr.load_latest().unwrap().is_none());
        mgr.save(&checkpoint(1)).unwrap();
        mgr.save(&checkpoint(2)).unwrap();
        assert_eq!(mgr.len(), 2);

        let reopened = CheckpointManager::open(&dir).unwrap();
        let latest = reopened.load_latest().unwrap().unwrap();
        assert_eq!(latest.trainer.epoch, 2);
        assert_eq!(latest.pool.slots[0].values, vec![2.0, 0.5]);
        assert_eq!(reopened.load(1).unwrap().controller, json!({"cursor": 1}));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corruption_detected() {
        let dir = test_dir();
        let mut mgr = CheckpointManager::open(&dir).unwrap();
        let meta = mgr.save(&checkpoint(1)).unwrap();
        std::fs::write(dir.join(&meta.filename), b"{\"tampered\": true}").unwrap();
        assert!(matches!(mgr.load(1), Err(NasError::Checkpoint(_))));
        assert_eq!(mgr.verify_all(), vec![(1, false)]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_retain_latest() {
        let dir = test_dir();
        let mut mgr = CheckpointManager::open(&dir).unwrap();
        for epoch in 0..5 {
            mgr.save(&checkpoint(epoch)).unwrap();
        }
        assert_eq!(mgr.retain_latest(2).unwrap(), 3);
        assert_eq!(mgr.len(), 2);
        assert_eq!(mgr.load_latest().unwrap().unwrap().trainer.epoch, 4);
        assert!(mgr.verify_all().iter().all(|(_, ok)| *ok));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_failed_save_keeps_previous() {
        let dir = test_dir();
        let mut mgr = CheckpointManager::open(&dir).unwrap();
        mgr.save(&checkpoint(1)).unwrap();
        // a directory squatting on the manifest path makes the next save fail
        std::fs::remove_file(dir.join(MANIFEST)).unwrap();
        std::fs::create_dir_all(dir.join(MANIFEST)).unwrap();
        assert!(matches!(mgr.save(&checkpoint(2)), Err(NasError::Checkpoint(_))));
        assert_eq!(mgr.load(1).unwrap().trainer.epoch, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
