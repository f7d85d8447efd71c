//! Evaluators — score rollouts on the shared supernet
//!
//! Every rollout becomes one [`EvaluatorJob`] on the [`WorkerPool`]: assemble
//! the sub-network, optionally train a private snapshot for a few surrogate
//! steps, measure it on the evaluation portion of the data, merge or discard
//! the snapshot, and ask the objective for a reward. A failing job only
//! invalidates its own rollout.

mod pool;

pub use pool::{PoolStats, WorkerPool};

use crate::dataset::{DataRange, Dataset};
use crate::error::{JobFailure, NasError, Result};
use crate::objective::Objective;
use crate::rollout::{reward_stats, Rollout, RolloutType};
use crate::schedule::{AttrShape, ScheduleSet};
use crate::weights::{evaluate, train_step, ModelOutput, ParamAccess, SnapshotHandle, WeightsManager};
use futures::future::{join_all, BoxFuture};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Why a batch is being evaluated; selects the surrogate policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalPurpose {
    /// Rewards feed the controller update
    Controller,
    /// Derive / test evaluation, no feedback
    Derive,
}

/// One unit of evaluator work
#[derive(Debug, Clone)]
pub struct EvaluatorJob {
    pub rollout: Rollout,
    pub worker: usize,
    pub surrogate_steps: u64,
    pub data_portion: DataRange,
    /// Where the reward is measured
    pub eval_portion: DataRange,
    /// Keep the surrogate-trained weights
    pub merge: bool,
    pub lr: f64,
    pub step: u64,
    /// Offset of the first batch drawn from `data_portion`
    pub cursor: u64,
}

/// A scored batch
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub rollouts: Vec<Rollout>,
    pub valid: usize,
    pub invalid: usize,
    pub mean_reward: Option<f64>,
    pub best_reward: Option<f64>,
}

impl BatchReport {
    fn from_rollouts(rollouts: Vec<Rollout>) -> Self {
        let stats = reward_stats(&rollouts);
        let valid = stats.map(|(_, _, n)| n).unwrap_or(0);
        Self {
            invalid: rollouts.len() - valid,
            valid,
            mean_reward: stats.map(|(mean, _, _)| mean),
            best_reward: stats.map(|(_, best, _)| best),
            rollouts,
        }
    }

    /// Best valid rollout of the batch
    pub fn best(&self) -> Option<&Rollout> {
        self.rollouts
            .iter()
            .filter(|r| r.scored_reward().is_some())
            .max_by(|a, b| {
                a.scored_reward()
                    .partial_cmp(&b.scored_reward())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

/// Outcome of shared-weight training
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub rollouts: usize,
    pub failed: usize,
    pub steps: u64,
    pub mean_loss: Option<f64>,
}

pub trait Evaluator: Debug + Send + Sync {
    fn rollout_type(&self) -> RolloutType;

    /// Score every rollout of a batch. Returns once all jobs have finished.
    fn evaluate_rollouts(
        &self,
        rollouts: Vec<Rollout>,
        purpose: EvalPurpose,
        step: u64,
    ) -> BoxFuture<'_, Result<BatchReport>>;

    /// Train the shared weights on the given rollouts
    fn update_evaluator(&self, rollouts: Vec<Rollout>, step: u64) -> BoxFuture<'_, Result<UpdateReport>>;

    /// Shared flag that cancels in-flight jobs between steps
    fn abort_flag(&self) -> Arc<AtomicBool>;

    fn pool_stats(&self) -> PoolStats;

    fn evaluate(&self, rollout: Rollout, purpose: EvalPurpose, step: u64) -> BoxFuture<'_, Result<Rollout>> {
        Box::pin(async move {
            let mut report = self.evaluate_rollouts(vec![rollout], purpose, step).await?;
            report
                .rollouts
                .pop()
                .ok_or_else(|| NasError::Runtime("evaluator returned no rollout".into()))
        })
    }
}

/// Options of the `mepa` evaluator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MepaConfig {
    pub workers: usize,
    pub batch_size: usize,
    /// Dataset fractions for shared-weight training, surrogate steps and
    /// reward evaluation
    pub data_portion: Vec<f64>,
    pub mepa_surrogate_steps: u64,
    pub mepa_as_surrogate: bool,
    pub controller_surrogate_steps: u64,
    pub controller_surrogate_merge: bool,
    /// Shared-weight training steps per rollout in `update_evaluator`
    pub mepa_steps: u64,
    /// Batches averaged for one reward
    pub eval_batches: u64,
    pub surrogate_lr: f64,
    pub mepa_lr: f64,
    pub rollout_type: Option<RolloutType>,
}

impl Default for MepaConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            batch_size: 32,
            data_portion: vec![0.5, 0.25, 0.25],
            mepa_surrogate_steps: 1,
            mepa_as_surrogate: false,
            controller_surrogate_steps: 1,
            controller_surrogate_merge: false,
            mepa_steps: 1,
            eval_batches: 1,
            surrogate_lr: 0.05,
            mepa_lr: 0.05,
            rollout_type: None,
        }
    }
}

impl MepaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.batch_size == 0 || self.eval_batches == 0 {
            return Err(NasError::Config(
                "workers, batch_size and eval_batches must be positive".into(),
            ));
        }
        if self.data_portion.len() != 3 {
            return Err(NasError::Config(format!(
                "data_portion needs 3 fractions, got {}",
                self.data_portion.len()
            )));
        }
        for lr in [self.surrogate_lr, self.mepa_lr] {
            if !lr.is_finite() || lr < 0.0 {
                return Err(NasError::Config("learning rates must be finite and non-negative".into()));
            }
        }
        Ok(())
    }
}

/// Everything a job needs, shared with the blocking worker threads
#[derive(Debug, Clone)]
struct JobContext {
    weights: WeightsManager,
    dataset: Arc<dyn Dataset>,
    objective: Arc<dyn Objective>,
    abort: Arc<AtomicBool>,
    batch_size: usize,
    eval_batches: u64,
}

struct Scored {
    reward: f64,
    perf: BTreeMap<String, f64>,
}

#[derive(Debug)]
pub struct MepaEvaluator {
    config: MepaConfig,
    schedule: ScheduleSet,
    pool: WorkerPool,
    ctx: JobContext,
    cursor: AtomicU64,
}

impl MepaEvaluator {
    pub const SCHEDULABLE: &'static [(&'static str, AttrShape)] = &[
        ("surrogate_lr", AttrShape::Scalar),
        ("mepa_lr", AttrShape::Scalar),
        ("mepa_surrogate_steps", AttrShape::Scalar),
        ("controller_surrogate_steps", AttrShape::Scalar),
        ("data_portion", AttrShape::Numeric),
    ];

    pub fn new(
        config: MepaConfig,
        schedule: ScheduleSet,
        weights: WeightsManager,
        dataset: Arc<dyn Dataset>,
        objective: Arc<dyn Objective>,
    ) -> Result<Self> {
        config.validate()?;
        schedule.check_attributes(Self::SCHEDULABLE)?;
        if dataset.input_dim() != weights.param_dim() {
            return Err(NasError::Config(format!(
                "dataset input_dim {} does not match supernet param_dim {}",
                dataset.input_dim(),
                weights.param_dim()
            )));
        }
        let pool = WorkerPool::new(config.workers)?;
        let evaluator = Self {
            ctx: JobContext {
                weights,
                dataset,
                objective,
                abort: Arc::new(AtomicBool::new(false)),
                batch_size: config.batch_size,
                eval_batches: config.eval_batches,
            },
            config,
            schedule,
            pool,
            cursor: AtomicU64::new(0),
        };
        // every rule row is checked; linear ramps between valid rows stay valid
        let mut checked_steps = vec![0];
        if let Some(rule) = evaluator.schedule.get("data_portion") {
            checked_steps.extend_from_slice(rule.boundaries());
        }
        for step in checked_steps {
            evaluator.portions(step)?;
        }
        let portions = evaluator.portions(0)?;
        info!(
            "MEPA evaluator: {} workers, portions train={:?} surrogate={:?} eval={:?}",
            evaluator.config.workers, portions[0], portions[1], portions[2]
        );
        Ok(evaluator)
    }

    /// Train, surrogate and evaluation ranges in force at `step`
    pub fn portions(&self, step: u64) -> Result<[DataRange; 3]> {
        let fractions = self.schedule.vec("data_portion", step, &self.config.data_portion);
        let ranges = self.ctx.dataset.split(&fractions)?;
        let [train, surrogate, eval]: [DataRange; 3] = ranges.try_into().map_err(|r: Vec<DataRange>| {
            NasError::Config(format!("data_portion needs 3 fractions, got {}", r.len()))
        })?;
        if eval.is_empty() {
            return Err(NasError::Config(format!(
                "reward evaluation portion of the data is empty at step {}",
                step
            )));
        }
        let wants_surrogate = self.config.mepa_surrogate_steps > 0 || self.config.controller_surrogate_steps > 0;
        if wants_surrogate && surrogate.is_empty() {
            return Err(NasError::Config(format!(
                "surrogate steps need a non-empty surrogate data portion (step {})",
                step
            )));
        }
        Ok([train, surrogate, eval])
    }

    pub fn weights(&self) -> &WeightsManager {
        &self.ctx.weights
    }

    /// Surrogate step count and merge policy for a purpose
    pub fn surrogate_policy(&self, purpose: EvalPurpose, step: u64) -> (u64, bool) {
        match purpose {
            EvalPurpose::Controller => (
                self.schedule.u64("controller_surrogate_steps", step, self.config.controller_surrogate_steps),
                self.config.controller_surrogate_merge,
            ),
            EvalPurpose::Derive => (
                self.schedule.u64("mepa_surrogate_steps", step, self.config.mepa_surrogate_steps),
                self.config.mepa_as_surrogate,
            ),
        }
    }

    fn next_cursor(&self, span: u64) -> u64 {
        self.cursor.fetch_add(span.max(1), Ordering::AcqRel)
    }

    fn check_rollout_types(&self, rollouts: &[Rollout]) -> Result<()> {
        match rollouts.iter().find(|r| r.rollout_type() != self.rollout_type()) {
            Some(r) => Err(NasError::RolloutTypeMismatch(format!(
                "evaluator serves {} rollouts, got {}",
                self.rollout_type(),
                r.rollout_type()
            ))),
            None => Ok(()),
        }
    }

    /// Dispatch one job per rollout and wait for all of them. `None` marks
    /// a rollout skipped because the run was aborted before dispatch.
    async fn dispatch<T, F>(&self, rollouts: &[Rollout], make_job: F) -> Result<Vec<Option<JobOutcome<T>>>>
    where
        T: Send + 'static,
        F: Fn(&Rollout) -> (EvaluatorJob, fn(&JobContext, EvaluatorJob) -> Result<T>),
    {
        let mut handles = Vec::with_capacity(rollouts.len());
        let mut dispatched = Vec::with_capacity(rollouts.len());
        for rollout in rollouts {
            if self.ctx.abort.load(Ordering::Acquire) {
                dispatched.push(false);
                continue;
            }
            let (job, work) = make_job(rollout);
            let ctx = self.ctx.clone();
            let handle = self
                .pool
                .spawn(move |worker| work(&ctx, EvaluatorJob { worker, ..job }))
                .await?;
            handles.push(handle);
            dispatched.push(true);
        }
        let mut results = join_all(handles).await.into_iter();
        Ok(dispatched
            .into_iter()
            .map(|was| if was { results.next() } else { None })
            .collect())
    }

    async fn run_batch(&self, mut rollouts: Vec<Rollout>, purpose: EvalPurpose, step: u64) -> Result<BatchReport> {
        self.check_rollout_types(&rollouts)?;
        let (surrogate_steps, merge) = self.surrogate_policy(purpose, step);
        let lr = self.schedule.f64("surrogate_lr", step, self.config.surrogate_lr);
        let [_, portion, eval_portion] = self.portions(step)?;

        let outcomes = self
            .dispatch(&rollouts, |rollout| {
                let job = EvaluatorJob {
                    rollout: rollout.clone(),
                    worker: 0,
                    surrogate_steps,
                    data_portion: portion,
                    eval_portion,
                    merge,
                    lr,
                    step,
                    cursor: self.next_cursor(surrogate_steps),
                };
                (job, run_job as fn(&JobContext, EvaluatorJob) -> Result<Scored>)
            })
            .await?;

        for (rollout, outcome) in rollouts.iter_mut().zip(outcomes) {
            match outcome {
                Some(Ok(Ok(scored))) => {
                    rollout.perf = scored.perf;
                    rollout.record_score(scored.reward)?;
                }
                other => {
                    let reason = failure_reason(rollout, other);
                    warn!("{}", reason);
                    rollout.mark_invalid(reason)?;
                }
            }
        }
        let report = BatchReport::from_rollouts(rollouts);
        debug!(
            "Evaluated {} rollouts for {:?}: {} valid, {} invalid",
            report.rollouts.len(),
            purpose,
            report.valid,
            report.invalid
        );
        Ok(report)
    }

    async fn run_update(&self, rollouts: Vec<Rollout>, step: u64) -> Result<UpdateReport> {
        self.check_rollout_types(&rollouts)?;
        let steps = self.config.mepa_steps;
        let lr = self.schedule.f64("mepa_lr", step, self.config.mepa_lr);
        let [portion, _, eval_portion] = self.portions(step)?;
        if steps == 0 || portion.is_empty() {
            return Ok(UpdateReport {
                rollouts: rollouts.len(),
                ..UpdateReport::default()
            });
        }

        let outcomes = self
            .dispatch(&rollouts, |rollout| {
                let job = EvaluatorJob {
                    rollout: rollout.clone(),
                    worker: 0,
                    surrogate_steps: steps,
                    data_portion: portion,
                    eval_portion,
                    merge: true,
                    lr,
                    step,
                    cursor: self.next_cursor(steps),
                };
                (job, run_update_job as fn(&JobContext, EvaluatorJob) -> Result<f64>)
            })
            .await?;

        let mut losses = Vec::new();
        let mut failed = 0;
        for (rollout, outcome) in rollouts.iter().zip(outcomes) {
            match outcome {
                Some(Ok(Ok(loss))) => losses.push(loss),
                other => {
                    failed += 1;
                    warn!("Supernet update skipped: {}", failure_reason(rollout, other));
                }
            }
        }
        let mean_loss = if losses.is_empty() {
            None
        } else {
            Some(losses.iter().sum::<f64>() / losses.len() as f64)
        };
        Ok(UpdateReport {
            rollouts: rollouts.len(),
            failed,
            steps: steps * losses.len() as u64,
            mean_loss,
        })
    }
}

type JobOutcome<T> = std::result::Result<Result<T>, tokio::task::JoinError>;

/// Log-ready reason for a job that produced no result
fn failure_reason<T>(rollout: &Rollout, outcome: Option<JobOutcome<T>>) -> String {
    let id = rollout.short_id();
    match outcome {
        Some(Ok(Ok(_))) => format!("rollout {} succeeded", id),
        Some(Ok(Err(e))) => e.to_string(),
        Some(Err(join)) => NasError::job(&id, JobFailure::Crashed, join.to_string()).to_string(),
        None => NasError::job(&id, JobFailure::Cancelled, "aborted before dispatch").to_string(),
    }
}

impl Evaluator for MepaEvaluator {
    fn rollout_type(&self) -> RolloutType {
        self.ctx.weights.space().rollout_type()
    }

    fn evaluate_rollouts(
        &self,
        rollouts: Vec<Rollout>,
        purpose: EvalPurpose,
        step: u64,
    ) -> BoxFuture<'_, Result<BatchReport>> {
        Box::pin(self.run_batch(rollouts, purpose, step))
    }

    fn update_evaluator(&self, rollouts: Vec<Rollout>, step: u64) -> BoxFuture<'_, Result<UpdateReport>> {
        Box::pin(self.run_update(rollouts, step))
    }

    fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ctx.abort)
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

/// Train, measure and score one rollout. Any error leaves the pool as it
/// was unless the job's policy is to merge.
fn run_job(ctx: &JobContext, job: EvaluatorJob) -> Result<Scored> {
    let id = job.rollout.short_id();
    let view = ctx.weights.assemble(&job.rollout)?;
    let output = if job.surrogate_steps > 0 {
        let mut handle = ctx.weights.snapshot(&view)?;
        let outcome = surrogate_train(ctx, &job, &mut handle)
            .and_then(|_| measure(ctx, &handle, &job.eval_portion, &id))
            .and_then(|output| {
                // an abort raised during the last batch still blocks the merge
                if job.merge {
                    check_abort(ctx, &id)?;
                }
                Ok(output)
            });
        match outcome {
            Ok(output) if job.merge => {
                ctx.weights.merge(handle)?;
                output
            }
            Ok(output) => {
                ctx.weights.discard(handle)?;
                output
            }
            Err(e) => {
                ctx.weights.discard(handle)?;
                return Err(e);
            }
        }
    } else {
        measure(ctx, &view, &job.eval_portion, &id)?
    };
    let reward = ctx.objective.reward(&output, job.step);
    if !reward.is_finite() {
        return Err(NasError::job(&id, JobFailure::Diverged, format!("reward={}", reward)));
    }
    debug!(
        "Worker {} scored {} in {} surrogate steps: reward={:.4}",
        job.worker, id, job.surrogate_steps, reward
    );
    Ok(Scored {
        reward,
        perf: ctx.objective.perf(&output),
    })
}

/// Authoritative shared-weight training for one rollout; returns the mean
/// training loss
fn run_update_job(ctx: &JobContext, job: EvaluatorJob) -> Result<f64> {
    let view = ctx.weights.assemble(&job.rollout)?;
    let mut handle = ctx.weights.snapshot(&view)?;
    let outcome = surrogate_train(ctx, &job, &mut handle).and_then(|loss| {
        check_abort(ctx, &job.rollout.short_id())?;
        Ok(loss)
    });
    match outcome {
        Ok(loss) => {
            ctx.weights.merge(handle)?;
            Ok(loss)
        }
        Err(e) => {
            ctx.weights.discard(handle)?;
            Err(e)
        }
    }
}

fn check_abort(ctx: &JobContext, id: &str) -> Result<()> {
    if ctx.abort.load(Ordering::Acquire) {
        return Err(NasError::job(id, JobFailure::Cancelled, "run aborted"));
    }
    Ok(())
}

/// Train the snapshot for the job's step count; returns the mean loss
fn surrogate_train(ctx: &JobContext, job: &EvaluatorJob, handle: &mut SnapshotHandle) -> Result<f64> {
    let id = job.rollout.short_id();
    let mut total = 0.0;
    for s in 0..job.surrogate_steps {
        check_abort(ctx, &id)?;
        let batch = ctx.dataset.batch(job.data_portion, ctx.batch_size, job.cursor + s);
        let output = train_step(handle, &batch, job.lr)
            .map_err(|e| NasError::job(&id, JobFailure::Backend, e.to_string()))?;
        if !output.is_finite() {
            return Err(NasError::job(&id, JobFailure::Diverged, format!("loss={}", output.loss)));
        }
        total += output.loss;
    }
    Ok(total / job.surrogate_steps.max(1) as f64)
}

fn measure<A: ParamAccess>(ctx: &JobContext, net: &A, portion: &DataRange, id: &str) -> Result<ModelOutput> {
    let mut outputs = Vec::with_capacity(ctx.eval_batches as usize);
    for b in 0..ctx.eval_batches {
        check_abort(ctx, id)?;
        let batch = ctx.dataset.batch(*portion, ctx.batch_size, b);
        let output = evaluate(net, &batch).map_err(|e| NasError::job(id, JobFailure::Backend, e.to_string()))?;
        if !output.is_finite() {
            return Err(NasError::job(id, JobFailure::Diverged, format!("loss={}", output.loss)));
        }
        outputs.push(output);
    }
    ModelOutput::mean(&outputs).ok_or_else(|| NasError::job(id, JobFailure::Backend, "no evaluation batches"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Batch, SyntheticConfig, SyntheticDataset};
    use crate::objective::{ClassificationConfig, ClassificationObjective};
    use crate::search_space::{DiscreteSearchSpace, DiscreteSpaceConfig, SearchSpace};
    use crate::weights::SupernetConfig;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::OnceLock;
    use std::time::Duration;

    /// Panics on its n-th reward call
    #[derive(Debug)]
    struct CrashOnce {
        calls: AtomicUsize,
        crash_at: usize,
    }

    impl Objective for CrashOnce {
        fn perf_names(&self) -> Vec<&'static str> {
            vec!["accuracy"]
        }
        fn perf(&self, output: &ModelOutput) -> BTreeMap<String, f64> {
            BTreeMap::from([("accuracy".to_string(), output.accuracy)])
        }
        fn reward(&self, output: &ModelOutput, _step: u64) -> f64 {
            if self.calls.fetch_add(1, Ordering::SeqCst) == self.crash_at {
                panic!("injected objective crash");
            }
            output.accuracy
        }
    }

    /// Slow enough for jobs to overlap
    #[derive(Debug)]
    struct Slow;

    impl Objective for Slow {
        fn perf_names(&self) -> Vec<&'static str> {
            Vec::new()
        }
        fn perf(&self, _output: &ModelOutput) -> BTreeMap<String, f64> {
            BTreeMap::new()
        }
        fn reward(&self, output: &ModelOutput, _step: u64) -> f64 {
            std::thread::sleep(Duration::from_millis(15));
            output.accuracy
        }
    }

    fn space() -> Arc<dyn SearchSpace> {
        Arc::new(DiscreteSearchSpace::new(DiscreteSpaceConfig {
            num_cells: 2,
            num_ops: 3,
            ..DiscreteSpaceConfig::default()
        }))
    }

    fn accuracy() -> Arc<dyn Objective> {
        Arc::new(ClassificationObjective::new(ClassificationConfig::default(), ScheduleSet::new()).unwrap())
    }

    fn synthetic() -> SyntheticDataset {
        SyntheticDataset::new(SyntheticConfig {
            num_samples: 64,
            input_dim: 4,
            label_noise: 0.0,
            seed: 3,
        })
        .unwrap()
    }

    fn try_evaluator_on(
        config: MepaConfig,
        schedule: ScheduleSet,
        objective: Arc<dyn Objective>,
        dataset: Arc<dyn Dataset>,
    ) -> Result<MepaEvaluator> {
        let weights = WeightsManager::new(space(), SupernetConfig::default(), 4).unwrap();
        MepaEvaluator::new(config, schedule, weights, dataset, objective)
    }

    fn evaluator_with(config: MepaConfig, schedule: ScheduleSet, objective: Arc<dyn Objective>) -> MepaEvaluator {
        try_evaluator_on(config, schedule, objective, Arc::new(synthetic())).unwrap()
    }

    #[derive(Debug, Clone, Copy)]
    enum Trip {
        /// Raise the evaluator's abort flag
        Abort,
        Panic,
    }

    /// Synthetic data that trips whenever a batch of the range starting at
    /// `watch` is drawn. With the default portions of 64 samples, training
    /// starts at 0, surrogate steps at 32 and evaluation at 48.
    #[derive(Debug)]
    struct Tripwire {
        inner: SyntheticDataset,
        watch: usize,
        trip: Trip,
        abort: OnceLock<Arc<AtomicBool>>,
    }

    impl Dataset for Tripwire {
        fn len(&self) -> usize {
            self.inner.len()
        }

        fn input_dim(&self) -> usize {
            self.inner.input_dim()
        }

        fn batch(&self, range: DataRange, batch_size: usize, cursor: u64) -> Batch {
            if range.start == self.watch {
                match self.trip {
                    Trip::Abort => {
                        if let Some(flag) = self.abort.get() {
                            flag.store(true, Ordering::Release);
                        }
                    }
                    Trip::Panic => panic!("injected batch failure"),
                }
            }
            self.inner.batch(range, batch_size, cursor)
        }
    }

    /// Evaluator over a [`Tripwire`] wired to its abort flag
    fn tripwired(config: MepaConfig, schedule: ScheduleSet, watch: usize, trip: Trip) -> MepaEvaluator {
        let data = Arc::new(Tripwire {
            inner: synthetic(),
            watch,
            trip,
            abort: OnceLock::new(),
        });
        let ev = try_evaluator_on(config, schedule, accuracy(), data.clone()).unwrap();
        data.abort.set(ev.abort_flag()).unwrap();
        ev
    }

    fn evaluator(config: MepaConfig) -> MepaEvaluator {
        evaluator_with(config, ScheduleSet::new(), accuracy())
    }

    fn rollouts(n: usize) -> Vec<Rollout> {
        let s = space();
        (0..n as u128)
            .map(|i| {
                let g = s.genotype_from_decisions(&s.decisions_at(i % s.size())).unwrap();
                Rollout::new(RolloutType::Discrete, g)
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crashing_job_only_invalidates_its_rollout() {
        let objective = Arc::new(CrashOnce {
            calls: AtomicUsize::new(0),
            crash_at: 1,
        });
        let ev = evaluator_with(MepaConfig::default(), ScheduleSet::new(), objective);
        let report = ev.evaluate_rollouts(rollouts(4), EvalPurpose::Controller, 1).await.unwrap();
        assert_eq!(report.valid, 3);
        assert_eq!(report.invalid, 1);
        let crashed = report.rollouts.iter().find(|r| !r.is_valid()).unwrap();
        assert!(crashed.failure().unwrap().contains("crashed"));
        assert!(report.mean_reward.is_some());
        ev.weights().check_leaks().unwrap();
        assert_eq!(ev.weights().outstanding_snapshots(), 0);

        // the pool keeps serving after the crash
        let again = ev.evaluate_rollouts(rollouts(2), EvalPurpose::Controller, 1).await.unwrap();
        assert_eq!(again.valid, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bound_holds_with_more_jobs_than_workers() {
        let config = MepaConfig {
            workers: 2,
            ..MepaConfig::default()
        };
        let ev = evaluator_with(config, ScheduleSet::new(), Arc::new(Slow));
        let report = ev.evaluate_rollouts(rollouts(8), EvalPurpose::Derive, 1).await.unwrap();
        assert_eq!(report.valid, 8);
        let stats = ev.pool_stats();
        assert!(stats.peak <= 2, "peak {} exceeds workers", stats.peak);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_controller_purpose_discards_surrogate_training() {
        let ev = evaluator(MepaConfig {
            controller_surrogate_steps: 3,
            controller_surrogate_merge: false,
            ..MepaConfig::default()
        });
        let before = ev.weights().export_state();
        let report = ev.evaluate_rollouts(rollouts(3), EvalPurpose::Controller, 1).await.unwrap();
        assert_eq!(report.valid, 3);
        assert_eq!(ev.weights().export_state(), before);
        assert!(report.rollouts[0].perf.contains_key("accuracy"));
    }

    #[tokio::test]
    async fn test_derive_as_surrogate_merges() {
        let ev = evaluator(MepaConfig {
            mepa_surrogate_steps: 2,
            mepa_as_surrogate: true,
            ..MepaConfig::default()
        });
        let before = ev.weights().export_state();
        let scored = ev.evaluate(rollouts(1).remove(0), EvalPurpose::Derive, 1).await.unwrap();
        assert!(scored.is_valid());
        assert_ne!(ev.weights().export_state(), before);
    }

    #[tokio::test]
    async fn test_update_evaluator_trains_shared_weights() {
        let ev = evaluator(MepaConfig {
            mepa_steps: 2,
            ..MepaConfig::default()
        });
        let before = ev.weights().export_state();
        let report = ev.update_evaluator(rollouts(3), 1).await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.steps, 6);
        assert!(report.mean_loss.unwrap() > 0.0);
        assert_ne!(ev.weights().export_state(), before);
        ev.weights().check_leaks().unwrap();
    }

    #[tokio::test]
    async fn test_abort_cancels_batch() {
        let ev = evaluator(MepaConfig::default());
        ev.abort_flag().store(true, Ordering::Release);
        let report = ev.evaluate_rollouts(rollouts(3), EvalPurpose::Controller, 1).await.unwrap();
        assert_eq!(report.valid, 0);
        assert!(report
            .rollouts
            .iter()
            .all(|r| r.failure().unwrap().contains("cancelled")));
        assert_eq!(report.mean_reward, None);
    }

    #[tokio::test]
    async fn test_abort_after_last_update_step_discards() {
        let ev = tripwired(
            MepaConfig {
                mepa_steps: 1,
                ..MepaConfig::default()
            },
            ScheduleSet::new(),
            0,
            Trip::Abort,
        );
        let before = ev.weights().export_state();
        let report = ev.update_evaluator(rollouts(1), 1).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.steps, 0);
        assert_eq!(report.mean_loss, None);
        assert_eq!(ev.weights().export_state(), before);
        ev.weights().check_leaks().unwrap();
        assert_eq!(ev.weights().outstanding_snapshots(), 0);
    }

    #[tokio::test]
    async fn test_abort_during_measurement_blocks_merge() {
        let ev = tripwired(
            MepaConfig {
                controller_surrogate_steps: 2,
                controller_surrogate_merge: true,
                ..MepaConfig::default()
            },
            ScheduleSet::new(),
            48,
            Trip::Abort,
        );
        let before = ev.weights().export_state();
        let scored = ev.evaluate(rollouts(1).remove(0), EvalPurpose::Controller, 1).await.unwrap();
        assert!(!scored.is_valid());
        assert!(scored.failure().unwrap().contains("cancelled"));
        assert_eq!(ev.weights().export_state(), before);
        ev.weights().check_leaks().unwrap();
        assert_eq!(ev.weights().outstanding_snapshots(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_mid_surrogate_training_leaves_pool_intact() {
        let ev = tripwired(
            MepaConfig {
                controller_surrogate_steps: 2,
                controller_surrogate_merge: true,
                ..MepaConfig::default()
            },
            ScheduleSet::new(),
            32,
            Trip::Panic,
        );
        let before = ev.weights().export_state();
        let report = ev.evaluate_rollouts(rollouts(2), EvalPurpose::Controller, 1).await.unwrap();
        assert_eq!(report.valid, 0);
        assert_eq!(report.invalid, 2);
        assert!(report
            .rollouts
            .iter()
            .all(|r| r.failure().unwrap().contains("crashed")));
        assert_eq!(ev.weights().export_state(), before);
        ev.weights().check_leaks().unwrap();
        assert_eq!(ev.weights().outstanding_snapshots(), 0);
        assert_eq!(ev.pool_stats().active, 0);
    }

    #[tokio::test]
    async fn test_scheduled_data_portion_moves_evaluation_range() {
        let schedule = ScheduleSet::parse(&json!({
            "data_portion": {
                "type": "value",
                "boundary": [1, 5],
                "value": [[0.5, 0.25, 0.25], [0.25, 0.25, 0.5]]
            }
        }))
        .unwrap();
        let config = MepaConfig {
            mepa_surrogate_steps: 0,
            ..MepaConfig::default()
        };
        let ev = tripwired(config, schedule, 32, Trip::Panic);
        assert_eq!(ev.portions(1).unwrap()[2], DataRange { start: 48, end: 64 });
        assert_eq!(ev.portions(5).unwrap()[0], DataRange { start: 0, end: 16 });
        assert_eq!(ev.portions(5).unwrap()[2], DataRange { start: 32, end: 64 });

        let early = ev.evaluate(rollouts(1).remove(0), EvalPurpose::Derive, 1).await.unwrap();
        assert!(early.is_valid());
        // from step 5 the evaluation range starts at the watched sample
        let late = ev.evaluate(rollouts(1).remove(0), EvalPurpose::Derive, 5).await.unwrap();
        assert!(late.failure().unwrap().contains("crashed"));
    }

    #[test]
    fn test_scheduled_data_portion_checked_at_build() {
        let schedule = ScheduleSet::parse(&json!({
            "data_portion": {"type": "value", "boundary": [1, 5], "value": [[0.5, 0.25, 0.25], [0.5, 0.5, 0.0]]}
        }))
        .unwrap();
        let err = try_evaluator_on(MepaConfig::default(), schedule, accuracy(), Arc::new(synthetic())).unwrap_err();
        assert!(err.to_string().contains("step 5"), "{}", err);

        let short = ScheduleSet::parse(&json!({
            "data_portion": {"type": "value", "boundary": [1], "value": [[0.5, 0.5]]}
        }))
        .unwrap();
        assert!(try_evaluator_on(MepaConfig::default(), short, accuracy(), Arc::new(synthetic())).is_err());
    }

    #[tokio::test]
    async fn test_wrong_rollout_type_rejected() {
        let ev = evaluator(MepaConfig::default());
        let r = Rollout::new(RolloutType::Ofa, "cell_0=1".parse().unwrap());
        assert!(matches!(
            ev.evaluate_rollouts(vec![r], EvalPurpose::Derive, 1).await,
            Err(NasError::RolloutTypeMismatch(_))
        ));
    }

    #[test]
    fn test_purpose_policies_are_independent() {
        let schedule = ScheduleSet::parse(&json!({
            "controller_surrogate_steps": {"type": "value", "boundary": [1, 5], "value": [0, 4]}
        }))
        .unwrap();
        let ev = evaluator_with(
            MepaConfig {
                mepa_surrogate_steps: 2,
                mepa_as_surrogate: true,
                controller_surrogate_merge: false,
                ..MepaConfig::default()
            },
            schedule,
            accuracy(),
        );
        assert_eq!(ev.surrogate_policy(EvalPurpose::Controller, 1), (0, false));
        assert_eq!(ev.surrogate_policy(EvalPurpose::Controller, 5), (4, false));
        assert_eq!(ev.surrogate_policy(EvalPurpose::Derive, 5), (2, true));
    }

    #[test]
    fn test_invalid_config() {
        let bad = MepaConfig {
            data_portion: vec![0.5, 0.5],
            ..MepaConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!(MepaConfig {
            workers: 0,
            ..MepaConfig::default()
        }
        .validate()
        .is_err());
    }
}
