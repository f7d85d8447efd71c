//! Search trainer — the epoch loop that drives every other component
//!
//! Each epoch:
//! 1. `evaluator_steps` rounds of shared-weight training on controller samples
//! 2. controller training, on epochs selected by `controller_train_every`
//!    and `controller_train_begin`
//! 3. a derive pass every `test_every` epochs, tracking the best rollout
//!
//! Batches are barriers: all snapshots of a batch are resolved before the
//! next step begins, and a leaked snapshot aborts the run. Pause and abort
//! requests are honoured at epoch boundaries, where the pool, controller
//! and step counter are mutually consistent and can be checkpointed.

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::controller::ControllerReport;
use crate::error::{NasError, Result};
use crate::evaluator::{BatchReport, EvalPurpose};
use crate::registry::Components;
use crate::rollout::Rollout;
use crate::schedule::{AttrShape, StepCounter, StepReader, StepUnit};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Options of the `simple` trainer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SearchTrainerConfig {
    pub epochs: u64,
    pub step_unit: StepUnit,
    /// Shared-weight training rounds per epoch
    pub evaluator_steps: u64,
    pub evaluator_samples: usize,
    /// Controller update rounds on a training epoch
    pub controller_steps: u64,
    pub controller_samples: usize,
    pub controller_train_every: u64,
    pub controller_train_begin: u64,
    /// Derive every N epochs; 0 disables
    pub test_every: u64,
    pub derive_samples: usize,
    /// Checkpoint every N epochs; 0 only checkpoints on pause and completion
    pub save_every: u64,
    pub keep_checkpoints: usize,
}

impl Default for SearchTrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            step_unit: StepUnit::Epoch,
            evaluator_steps: 1,
            evaluator_samples: 4,
            controller_steps: 1,
            controller_samples: 4,
            controller_train_every: 1,
            controller_train_begin: 0,
            test_every: 5,
            derive_samples: 4,
            save_every: 5,
            keep_checkpoints: 3,
        }
    }
}

impl SearchTrainerConfig {
    pub const SCHEDULABLE: &'static [(&'static str, AttrShape)] = &[
        ("evaluator_samples", AttrShape::Scalar),
        ("controller_samples", AttrShape::Scalar),
        ("derive_samples", AttrShape::Scalar),
    ];

    pub fn validate(&self) -> Result<()> {
        if self.controller_train_every == 0 {
            return Err(NasError::Config("controller_train_every must be positive".into()));
        }
        if self.keep_checkpoints == 0 {
            return Err(NasError::Config("keep_checkpoints must be positive".into()));
        }
        if self.evaluator_samples == 0 || self.controller_samples == 0 || self.derive_samples == 0 {
            return Err(NasError::Config("sample counts must be positive".into()));
        }
        Ok(())
    }
}

/// Loop position saved with every checkpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Next epoch to run
    pub epoch: u64,
    pub global_step: u64,
    /// Epochs until the controller trains again
    pub controller_train_countdown: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeriveRecord {
    pub valid: usize,
    pub invalid: usize,
    pub mean_reward: Option<f64>,
    pub best_reward: Option<f64>,
}

impl From<&BatchReport> for DeriveRecord {
    fn from(batch: &BatchReport) -> Self {
        Self {
            valid: batch.valid,
            invalid: batch.invalid,
            mean_reward: batch.mean_reward,
            best_reward: batch.best_reward,
        }
    }
}

/// What happened in one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: u64,
    /// Global step when the epoch finished
    pub step: u64,
    pub supernet_loss: Option<f64>,
    /// Report of the last controller update, on training epochs
    pub controller: Option<ControllerReport>,
    pub derive: Option<DeriveRecord>,
    /// Every scheduled value at `step`, as `role.attribute`
    pub schedule: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Aborted,
}

impl fmt::Display for TrainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrainerStatus::Idle => "idle",
            TrainerStatus::Running => "running",
            TrainerStatus::Paused => "paused",
            TrainerStatus::Completed => "completed",
            TrainerStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Cloneable handle for requesting a pause or abort from another task
#[derive(Debug, Clone)]
pub struct TrainerControl {
    pause: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
}

impl TrainerControl {
    /// Stop at the next epoch boundary and checkpoint
    pub fn pause(&self) {
        self.pause.store(true, Ordering::Release);
    }

    /// Cancel in-flight jobs and stop without checkpointing
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::Acquire)
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    fn take_pause(&self) -> bool {
        self.pause.swap(false, Ordering::AcqRel)
    }
}

pub struct SearchTrainer {
    components: Components,
    steps: StepCounter,
    state: TrainerState,
    status: TrainerStatus,
    history: Vec<EpochRecord>,
    best: Option<Rollout>,
    checkpoints: Option<CheckpointManager>,
    output_dir: PathBuf,
    control: TrainerControl,
}

impl fmt::Debug for SearchTrainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchTrainer")
            .field("state", &self.state)
            .field("status", &self.status)
            .field("epochs", &self.components.trainer.epochs)
            .finish()
    }
}

impl SearchTrainer {
    /// `checkpoint_dir` enables saving and resuming; the final model is
    /// written under `output_dir`.
    pub fn new(components: Components, checkpoint_dir: Option<PathBuf>, output_dir: PathBuf) -> Result<Self> {
        components.trainer.validate()?;
        let checkpoints = checkpoint_dir.map(CheckpointManager::open).transpose()?;
        let control = TrainerControl {
            pause: Arc::new(AtomicBool::new(false)),
            abort: components.evaluator.abort_flag(),
        };
        info!(
            "Search trainer: {} epochs, step unit {:?}, rollout_type {}",
            components.trainer.epochs, components.trainer.step_unit, components.rollout_type
        );
        Ok(Self {
            components,
            steps: StepCounter::new(0),
            state: TrainerState::default(),
            status: TrainerStatus::Idle,
            history: Vec::new(),
            best: None,
            checkpoints,
            output_dir,
            control,
        })
    }

    pub fn control(&self) -> TrainerControl {
        self.control.clone()
    }

    pub fn status(&self) -> TrainerStatus {
        self.status
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn step(&self) -> u64 {
        self.steps.get()
    }

    pub fn step_reader(&self) -> StepReader {
        self.steps.reader()
    }

    pub fn history(&self) -> &[EpochRecord] {
        &self.history
    }

    pub fn best(&self) -> Option<&Rollout> {
        self.best.as_ref()
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    pub fn checkpoints(&self) -> Option<&CheckpointManager> {
        self.checkpoints.as_ref()
    }

    fn config(&self) -> &SearchTrainerConfig {
        &self.components.trainer
    }

    fn scheduled_count(&self, name: &str, step: u64, base: usize) -> usize {
        self.components.trainer_schedule.u64(name, step, base as u64).max(1) as usize
    }

    /// Step for the next inner round; only moves under `StepUnit::InnerStep`
    fn inner_step(&mut self) -> u64 {
        match self.config().step_unit {
            StepUnit::InnerStep => self.steps.advance(),
            StepUnit::Epoch => self.steps.get(),
        }
    }

    fn trains_controller(&self, epoch: u64) -> bool {
        let c = self.config();
        epoch >= c.controller_train_begin && epoch % c.controller_train_every == 0
    }

    /// Epochs from `epoch` to the next controller-training epoch after it
    fn countdown_after(&self, epoch: u64) -> u64 {
        let c = self.config();
        let start = (epoch + 1).max(c.controller_train_begin);
        let next = start.div_ceil(c.controller_train_every) * c.controller_train_every;
        next - epoch
    }

    fn resolved_schedules(&self, step: u64) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for (role, set) in &self.components.schedules {
            for (name, value) in set.resolve_all(step) {
                out.insert(format!("{}.{}", role, name), value);
            }
        }
        out
    }

    /// Run epochs until completion, a pause, or an abort.
    ///
    /// Job failures only invalidate their rollouts; an `Err` here means the
    /// run itself cannot continue.
    pub async fn run(&mut self) -> Result<TrainerStatus> {
        if matches!(self.status, TrainerStatus::Completed | TrainerStatus::Aborted) {
            return Err(NasError::Runtime(format!("trainer already {}", self.status)));
        }
        self.status = TrainerStatus::Running;
        info!(
            "Search running from epoch {} (step {}) to {}",
            self.state.epoch,
            self.steps.get(),
            self.config().epochs
        );

        while self.state.epoch < self.config().epochs {
            if self.control.abort_requested() {
                return Ok(self.abort("abort requested"));
            }
            if self.control.take_pause() {
                if let Err(e) = self.save_checkpoint() {
                    return Err(self.fail(e));
                }
                self.status = TrainerStatus::Paused;
                info!("Search paused before epoch {}", self.state.epoch);
                return Ok(TrainerStatus::Paused);
            }

            let epoch = self.state.epoch;
            let record = match self.run_epoch(epoch).await {
                Ok(Some(record)) => record,
                Ok(None) => return Ok(self.abort("abort requested mid-epoch")),
                Err(e) => return Err(self.fail(e)),
            };
            self.log_epoch(&record);
            self.history.push(record);
            self.state.epoch = epoch + 1;
            self.state.global_step = self.steps.get();

            let save_every = self.config().save_every;
            if save_every > 0 && self.state.epoch % save_every == 0 {
                if let Err(e) = self.save_checkpoint() {
                    return Err(self.fail(e));
                }
            }
        }

        if let Err(e) = self.finish().await {
            return Err(self.fail(e));
        }
        self.status = TrainerStatus::Completed;
        info!(
            "Search completed after {} epochs at step {}",
            self.state.epoch,
            self.steps.get()
        );
        Ok(TrainerStatus::Completed)
    }

    /// One epoch; `None` when an abort interrupted it
    async fn run_epoch(&mut self, epoch: u64) -> Result<Option<EpochRecord>> {
        if self.config().step_unit == StepUnit::Epoch {
            self.steps.advance_to(epoch + 1);
        }

        let mut losses = Vec::new();
        for _ in 0..self.config().evaluator_steps {
            let step = self.inner_step();
            let n = self.scheduled_count("evaluator_samples", step, self.config().evaluator_samples);
            let rollouts = self.components.controller.sample(n, step)?;
            let report = self.components.evaluator.update_evaluator(rollouts, step).await?;
            self.components.weights.check_leaks()?;
            if self.control.abort_requested() {
                return Ok(None);
            }
            if report.failed > 0 {
                warn!("Epoch {}: {}/{} supernet updates failed", epoch, report.failed, report.rollouts);
            }
            losses.extend(report.mean_loss);
        }

        let mut controller = None;
        if self.trains_controller(epoch) {
            for _ in 0..self.config().controller_steps {
                let step = self.inner_step();
                let n = self.scheduled_count("controller_samples", step, self.config().controller_samples);
                let rollouts = self.components.controller.sample(n, step)?;
                let batch = self
                    .components
                    .evaluator
                    .evaluate_rollouts(rollouts, EvalPurpose::Controller, step)
                    .await?;
                self.components.weights.check_leaks()?;
                if self.control.abort_requested() {
                    return Ok(None);
                }
                let report = self.components.controller.update(&batch.rollouts, step)?;
                debug!("Controller: {}", self.components.controller.summary(step));
                controller = Some(report);
            }
        }
        self.state.controller_train_countdown = self.countdown_after(epoch);

        let test_every = self.config().test_every;
        let derive = if test_every > 0 && epoch % test_every == 0 {
            let step = self.steps.get();
            let batch = self.derive(step).await?;
            if self.control.abort_requested() {
                return Ok(None);
            }
            Some(DeriveRecord::from(&batch))
        } else {
            None
        };

        let step = self.steps.get();
        Ok(Some(EpochRecord {
            epoch,
            step,
            supernet_loss: if losses.is_empty() {
                None
            } else {
                Some(losses.iter().sum::<f64>() / losses.len() as f64)
            },
            controller,
            derive,
            schedule: self.resolved_schedules(step),
        }))
    }

    /// Sample and score rollouts without feedback, keeping the best
    async fn derive(&mut self, step: u64) -> Result<BatchReport> {
        let n = self.scheduled_count("derive_samples", step, self.config().derive_samples);
        let rollouts = self.components.controller.sample(n, step)?;
        let batch = self
            .components
            .evaluator
            .evaluate_rollouts(rollouts, EvalPurpose::Derive, step)
            .await?;
        self.components.weights.check_leaks()?;
        if let Some(candidate) = batch.best() {
            let improved = match (&self.best, candidate.scored_reward()) {
                (None, Some(_)) => true,
                (Some(best), Some(reward)) => best.scored_reward().map(|b| reward > b).unwrap_or(true),
                _ => false,
            };
            if improved {
                info!("New best rollout: {}", candidate.summary());
                self.best = Some(candidate.clone());
            }
        }
        Ok(batch)
    }

    /// Final derive pass, final model export and a last checkpoint
    async fn finish(&mut self) -> Result<()> {
        let step = self.steps.get();
        let batch = self.derive(step).await?;
        if self.control.abort_requested() {
            return Err(NasError::Runtime("aborted during final derive".into()));
        }
        if let Some(final_model) = &self.components.final_model {
            let mut candidates = batch.rollouts;
            candidates.extend(self.best.clone());
            let path = final_model.export(&candidates, &self.output_dir)?;
            info!("Final model written to {}", path.display());
        }
        self.save_checkpoint()
    }

    fn abort(&mut self, reason: &str) -> TrainerStatus {
        self.control.abort();
        self.status = TrainerStatus::Aborted;
        error!("Search aborted at epoch {}: {}", self.state.epoch, reason);
        TrainerStatus::Aborted
    }

    fn fail(&mut self, e: NasError) -> NasError {
        self.abort(&e.to_string());
        e
    }

    fn log_epoch(&self, record: &EpochRecord) {
        let fmt_opt = |v: Option<f64>| v.map(|x| format!("{:.4}", x)).unwrap_or_else(|| "-".into());
        info!(
            "Epoch {}/{} step {}: supernet loss {} | controller reward {} | derive best {} | next controller update in {}",
            record.epoch + 1,
            self.config().epochs,
            record.step,
            fmt_opt(record.supernet_loss),
            fmt_opt(record.controller.as_ref().and_then(|c| c.mean_reward)),
            fmt_opt(record.derive.as_ref().and_then(|d| d.best_reward)),
            self.state.controller_train_countdown
        );
        if !record.schedule.is_empty() {
            debug!("Schedule at step {}: {:?}", record.step, record.schedule);
        }
    }

    /// Snapshot of everything a resumed run needs
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        let outstanding = self.components.weights.outstanding_snapshots();
        if outstanding > 0 {
            return Err(NasError::Runtime(format!(
                "cannot checkpoint with {} outstanding snapshots",
                outstanding
            )));
        }
        Ok(Checkpoint {
            rollout_type: self.components.rollout_type,
            trainer: TrainerState {
                global_step: self.steps.get(),
                ..self.state
            },
            pool: self.components.weights.export_state(),
            controller: self.components.controller.state()?,
            history: self.history.clone(),
            best: self.best.clone(),
        })
    }

    /// Save a checkpoint, retrying once on failure
    fn save_checkpoint(&mut self) -> Result<()> {
        if self.checkpoints.is_none() {
            return Ok(());
        }
        let checkpoint = self.checkpoint()?;
        let keep = self.config().keep_checkpoints;
        let Some(manager) = self.checkpoints.as_mut() else {
            return Ok(());
        };
        if let Err(e) = manager.save(&checkpoint) {
            warn!("Checkpoint failed ({}), retrying once", e);
            manager.save(&checkpoint)?;
        }
        manager.retain_latest(keep)?;
        Ok(())
    }

    /// Restore from the newest checkpoint. `false` when there is none.
    pub fn resume(&mut self) -> Result<bool> {
        let manager = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| NasError::Config("resuming needs a checkpoint directory".into()))?;
        match manager.load_latest()? {
            Some(checkpoint) => {
                self.restore(checkpoint)?;
                Ok(true)
            }
            None => {
                info!("No checkpoint in {}, starting fresh", manager.dir().display());
                Ok(false)
            }
        }
    }

    /// Restore pool, controller, step and history together, or none of them
    pub fn restore(&mut self, checkpoint: Checkpoint) -> Result<()> {
        if self.status == TrainerStatus::Running {
            return Err(NasError::Runtime("cannot restore a running trainer".into()));
        }
        if checkpoint.rollout_type != self.components.rollout_type {
            return Err(NasError::Checkpoint(format!(
                "checkpoint rollout_type {} does not match configured {}",
                checkpoint.rollout_type, self.components.rollout_type
            )));
        }
        let previous = self.components.controller.state()?;
        self.components.controller.load_state(&checkpoint.controller)?;
        if let Err(e) = self.components.weights.import_state(&checkpoint.pool) {
            self.components.controller.load_state(&previous)?;
            return Err(e);
        }
        self.steps.restore(checkpoint.trainer.global_step);
        self.state = checkpoint.trainer;
        self.history = checkpoint.history;
        self.best = checkpoint.best;
        self.status = TrainerStatus::Idle;
        info!(
            "Resumed at epoch {} step {} ({} epochs of history)",
            self.state.epoch,
            self.state.global_step,
            self.history.len()
        );
        Ok(())
    }
}
