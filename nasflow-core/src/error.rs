//! Error taxonomy for the search stack
//!
//! Configuration and schedule errors are fatal at load time, job errors are
//! contained inside the evaluator, checkpoint errors surface to the trainer.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, NasError>;

/// Why a single evaluator job failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFailure {
    /// The worker panicked or its task was lost
    Crashed,
    /// A surrogate step produced a non-finite loss
    Diverged,
    /// The run was aborted while the job was in flight
    Cancelled,
    /// The candidate network rejected its inputs
    Backend,
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobFailure::Crashed => "crashed",
            JobFailure::Diverged => "diverged",
            JobFailure::Cancelled => "cancelled",
            JobFailure::Backend => "backend",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum NasError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown {role} type '{type_name}'")]
    UnknownType { role: String, type_name: String },

    #[error("Invalid options for {role} '{type_name}': {reason}")]
    InvalidOptions {
        role: String,
        type_name: String,
        reason: String,
    },

    #[error("rollout_type mismatch: {0}")]
    RolloutTypeMismatch(String),

    #[error("Schedule error for '{attribute}': {reason}")]
    Schedule { attribute: String, reason: String },

    #[error("Genotype parse error: {0}")]
    Genotype(String),

    #[error("Job {failure} for rollout {rollout}: {detail}")]
    Job {
        rollout: String,
        failure: JobFailure,
        detail: String,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Resource leak: {count} snapshot(s) dropped without merge or discard")]
    ResourceLeak { count: usize },

    #[error("Unknown parameter slot: {0}")]
    UnknownSlot(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl NasError {
    /// Shorthand for a schedule error on a named attribute
    pub fn schedule(attribute: impl Into<String>, reason: impl Into<String>) -> Self {
        NasError::Schedule {
            attribute: attribute.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a failed evaluator job
    pub fn job(rollout: impl ToString, failure: JobFailure, detail: impl Into<String>) -> Self {
        NasError::Job {
            rollout: rollout.to_string(),
            failure,
            detail: detail.into(),
        }
    }

    /// Errors raised while loading configuration, before any compute
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            NasError::Config(_)
                | NasError::UnknownType { .. }
                | NasError::InvalidOptions { .. }
                | NasError::RolloutTypeMismatch(_)
                | NasError::Schedule { .. }
                | NasError::Genotype(_)
        )
    }
}

impl From<serde_json::Error> for NasError {
    fn from(err: serde_json::Error) -> Self {
        NasError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for NasError {
    fn from(err: serde_yaml::Error) -> Self {
        NasError::Config(err.to_string())
    }
}
