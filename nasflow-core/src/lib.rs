//! nasflow — weight-sharing neural architecture search orchestration
//!
//! A search is assembled from registered components (search space, dataset,
//! objective, supernet weights manager, controller, evaluator, trainer) named
//! in a configuration document. Hyperparameters may be scheduled against a
//! single global step, rollouts are scored concurrently on a bounded worker
//! pool, and every candidate trains a private snapshot of the shared weights
//! that is merged back or discarded once its job ends.

pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod dataset;
pub mod error;
pub mod evaluator;
pub mod final_model;
pub mod objective;
pub mod registry;
pub mod rollout;
pub mod schedule;
pub mod search_space;
pub mod trainer;
pub mod weights;

pub use config::{Role, SearchConfig};
pub use error::{NasError, Result};
pub use registry::{build_all, Components};
pub use rollout::{Genotype, Rollout, RolloutType};
pub use schedule::{ScheduleRule, ScheduleSet, StepCounter, StepUnit};
pub use trainer::{SearchTrainer, TrainerStatus};
pub use weights::{SnapshotHandle, SubNetworkView, WeightsManager};
