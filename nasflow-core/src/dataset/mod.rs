//! Datasets — the data side of surrogate steps and reward evaluation
//!
//! Loading real data is outside this crate; [`Dataset`] is the narrow
//! interface the evaluator draws batches through. [`SyntheticDataset`] is a
//! seeded linearly-separable problem used by the reference stack.

use crate::error::{NasError, Result};
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Half-open range of sample indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRange {
    pub start: usize,
    pub end: usize,
}

impl DataRange {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A batch of inputs with ±1 targets
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub inputs: Vec<DVector<f64>>,
    pub targets: Vec<f64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

pub trait Dataset: Debug + Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn input_dim(&self) -> usize;

    /// The `cursor`-th batch of `range`, wrapping around its end
    fn batch(&self, range: DataRange, batch_size: usize, cursor: u64) -> Batch;

    /// Split the dataset into consecutive ranges by fraction
    fn split(&self, fractions: &[f64]) -> Result<Vec<DataRange>> {
        let total: f64 = fractions.iter().sum();
        if fractions.iter().any(|f| !(0.0..=1.0).contains(f)) || total > 1.0 + 1e-9 {
            return Err(NasError::Config(format!(
                "data portions {:?} must be within [0, 1] and sum to at most 1",
                fractions
            )));
        }
        let n = self.len();
        let mut start = 0usize;
        let mut acc = 0.0;
        let mut ranges = Vec::with_capacity(fractions.len());
        for f in fractions {
            acc += f;
            let end = ((acc * n as f64).round() as usize).min(n);
            ranges.push(DataRange { start, end });
            start = end;
        }
        Ok(ranges)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyntheticConfig {
    pub num_samples: usize,
    pub input_dim: usize,
    /// Probability of flipping a label
    pub label_noise: f64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_samples: 512,
            input_dim: 8,
            label_noise: 0.05,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    pub config: SyntheticConfig,
    inputs: Vec<DVector<f64>>,
    targets: Vec<f64>,
}

impl SyntheticDataset {
    pub fn new(config: SyntheticConfig) -> Result<Self> {
        if config.num_samples == 0 || config.input_dim == 0 {
            return Err(NasError::Config(
                "synthetic dataset needs samples and a positive input_dim".into(),
            ));
        }
        if !(0.0..=0.5).contains(&config.label_noise) {
            return Err(NasError::Config("label_noise must be in [0, 0.5]".into()));
        }
        let mut rng = StdRng::seed_from_u64(config.seed);
        let separator = DVector::from_fn(config.input_dim, |_, _| rng.gen_range(-1.0..1.0));
        let mut inputs = Vec::with_capacity(config.num_samples);
        let mut targets = Vec::with_capacity(config.num_samples);
        for _ in 0..config.num_samples {
            let x = DVector::from_fn(config.input_dim, |_, _| rng.gen_range(-1.0..1.0));
            let mut y = if separator.dot(&x) >= 0.0 { 1.0 } else { -1.0 };
            if rng.gen_bool(config.label_noise) {
                y = -y;
            }
            inputs.push(x);
            targets.push(y);
        }
        Ok(Self {
            config,
            inputs,
            targets,
        })
    }
}

impl Dataset for SyntheticDataset {
    fn len(&self) -> usize {
        self.targets.len()
    }

    fn input_dim(&self) -> usize {
        self.config.input_dim
    }

    fn batch(&self, range: DataRange, batch_size: usize, cursor: u64) -> Batch {
        let span = range.len();
        if span == 0 || batch_size == 0 {
            return Batch::default();
        }
        let offset = (cursor as usize).wrapping_mul(batch_size) % span;
        let take = batch_size.min(span);
        let mut batch = Batch {
            inputs: Vec::with_capacity(take),
            targets: Vec::with_capacity(take),
        };
        for i in 0..take {
            let idx = range.start + (offset + i) % span;
            batch.inputs.push(self.inputs[idx].clone());
            batch.targets.push(self.targets[idx]);
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> SyntheticDataset {
        SyntheticDataset::new(SyntheticConfig {
            num_samples: 100,
            input_dim: 4,
            label_noise: 0.0,
            seed: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_deterministic_given_seed() {
        let a = dataset();
        let b = dataset();
        let range = DataRange { start: 0, end: 100 };
        let (ba, bb) = (a.batch(range, 8, 3), b.batch(range, 8, 3));
        assert_eq!(ba.targets, bb.targets);
        assert_eq!(ba.inputs, bb.inputs);
    }

    #[test]
    fn test_split_portions() {
        let ds = dataset();
        let ranges = ds.split(&[0.5, 0.25, 0.25]).unwrap();
        assert_eq!(ranges[0], DataRange { start: 0, end: 50 });
        assert_eq!(ranges[1], DataRange { start: 50, end: 75 });
        assert_eq!(ranges[2], DataRange { start: 75, end: 100 });
        assert!(ds.split(&[0.8, 0.5]).is_err());
        assert!(ds.split(&[-0.1]).is_err());
    }

    #[test]
    fn test_batches_stay_in_range_and_wrap() {
        let ds = dataset();
        let range = DataRange { start: 90, end: 100 };
        let batch = ds.batch(range, 4, 2);
        assert_eq!(batch.len(), 4);
        let oversized = ds.batch(range, 64, 0);
        assert_eq!(oversized.len(), 10);
        assert!(ds.batch(DataRange { start: 5, end: 5 }, 4, 0).is_empty());
    }

    #[test]
    fn test_invalid_config() {
        assert!(SyntheticDataset::new(SyntheticConfig {
            num_samples: 0,
            ..SyntheticConfig::default()
        })
        .is_err());
        assert!(SyntheticDataset::new(SyntheticConfig {
            label_noise: 0.9,
            ..SyntheticConfig::default()
        })
        .is_err());
    }
}
