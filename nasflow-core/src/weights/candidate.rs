//! Candidate network — the numeric stand-in behind a sub-network view
//!
//! A linear probe: every active parameter slot contributes `w · x`, the
//! prediction is their mean, the loss is squared error against ±1 targets.
//! Buffer slots track a running mean of the training loss. Real model
//! layers plug in behind the same [`ParamAccess`] seam.

use super::key::SlotKind;
use crate::dataset::Batch;
use crate::error::{NasError, Result};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Read access to the slots of one candidate
pub trait ParamAccess {
    fn num_slots(&self) -> usize;

    fn slot_kind(&self, i: usize) -> SlotKind;

    fn read_slot<R>(&self, i: usize, f: impl FnOnce(&DVector<f64>) -> R) -> R;
}

/// Write access, only granted on job-private copies
pub trait ParamAccessMut: ParamAccess {
    fn write_slot<R>(&mut self, i: usize, f: impl FnOnce(&mut DVector<f64>) -> R) -> R;
}

/// What one forward pass reports to the objective
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub loss: f64,
    pub accuracy: f64,
    pub num_params: usize,
}

impl ModelOutput {
    pub fn is_finite(&self) -> bool {
        self.loss.is_finite() && self.accuracy.is_finite()
    }

    /// Mean of several outputs; `None` for an empty slice
    pub fn mean(outputs: &[ModelOutput]) -> Option<ModelOutput> {
        let n = outputs.len();
        if n == 0 {
            return None;
        }
        Some(ModelOutput {
            loss: outputs.iter().map(|o| o.loss).sum::<f64>() / n as f64,
            accuracy: outputs.iter().map(|o| o.accuracy).sum::<f64>() / n as f64,
            num_params: outputs[0].num_params,
        })
    }
}

const STATS_MOMENTUM: f64 = 0.9;

fn parameter_slots<A: ParamAccess>(net: &A) -> Vec<usize> {
    (0..net.num_slots())
        .filter(|&i| net.slot_kind(i) == SlotKind::Parameter)
        .collect()
}

/// Predictions for a batch plus the parameter-slot indices used
fn predict<A: ParamAccess>(net: &A, batch: &Batch) -> Result<(Vec<f64>, Vec<usize>, usize)> {
    let params = parameter_slots(net);
    if params.is_empty() {
        return Err(NasError::Runtime("candidate has no parameter slots".into()));
    }
    let dim = batch.inputs.first().map(|x| x.len()).unwrap_or(0);
    let mut preds = vec![0.0; batch.len()];
    let mut num_params = 0;
    for &i in &params {
        net.read_slot(i, |w| {
            if w.len() != dim {
                return Err(NasError::Runtime(format!(
                    "slot width {} does not match input width {}",
                    w.len(),
                    dim
                )));
            }
            num_params += w.len();
            for (p, x) in preds.iter_mut().zip(&batch.inputs) {
                *p += w.dot(x);
            }
            Ok(())
        })?;
    }
    let scale = params.len() as f64;
    preds.iter_mut().for_each(|p| *p /= scale);
    Ok((preds, params, num_params))
}

fn summarize(preds: &[f64], batch: &Batch, num_params: usize) -> ModelOutput {
    let n = batch.len().max(1) as f64;
    let loss = preds
        .iter()
        .zip(&batch.targets)
        .map(|(p, y)| (p - y).powi(2))
        .sum::<f64>()
        / n;
    let correct = preds
        .iter()
        .zip(&batch.targets)
        .filter(|(p, y)| p.signum() == y.signum())
        .count();
    ModelOutput {
        loss,
        accuracy: correct as f64 / n,
        num_params,
    }
}

/// Forward pass without touching any slot
pub fn evaluate<A: ParamAccess>(net: &A, batch: &Batch) -> Result<ModelOutput> {
    if batch.is_empty() {
        return Err(NasError::Runtime("empty evaluation batch".into()));
    }
    let (preds, _, num_params) = predict(net, batch)?;
    Ok(summarize(&preds, batch, num_params))
}

/// Loss gradient for every slot, zero for buffers
pub fn gradients<A: ParamAccess>(net: &A, batch: &Batch) -> Result<(ModelOutput, Vec<DVector<f64>>)> {
    if batch.is_empty() {
        return Err(NasError::Runtime("empty training batch".into()));
    }
    let (preds, params, num_params) = predict(net, batch)?;
    let output = summarize(&preds, batch, num_params);
    let dim = batch.inputs[0].len();
    let scale = 2.0 / (batch.len() as f64 * params.len() as f64);

    let mut shared = DVector::zeros(dim);
    for ((p, y), x) in preds.iter().zip(&batch.targets).zip(&batch.inputs) {
        shared.axpy(scale * (p - y), x, 1.0);
    }
    let grads = (0..net.num_slots())
        .map(|i| match net.slot_kind(i) {
            SlotKind::Parameter => shared.clone(),
            SlotKind::Buffer => net.read_slot(i, |b| DVector::zeros(b.len())),
        })
        .collect();
    Ok((output, grads))
}

/// One SGD step on a private copy; also folds the loss into buffers
pub fn train_step<A: ParamAccessMut>(net: &mut A, batch: &Batch, lr: f64) -> Result<ModelOutput> {
    let (output, grads) = gradients(net, batch)?;
    for (i, grad) in grads.iter().enumerate() {
        match net.slot_kind(i) {
            SlotKind::Parameter => net.write_slot(i, |w| w.axpy(-lr, grad, 1.0)),
            SlotKind::Buffer => net.write_slot(i, |b| {
                if let Some(first) = b.get_mut(0) {
                    *first = STATS_MOMENTUM * *first + (1.0 - STATS_MOMENTUM) * output.loss;
                }
            }),
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Plain in-memory candidate for exercising the math
    struct Owned {
        slots: Vec<(SlotKind, DVector<f64>)>,
    }

    impl ParamAccess for Owned {
        fn num_slots(&self) -> usize {
            self.slots.len()
        }
        fn slot_kind(&self, i: usize) -> SlotKind {
            self.slots[i].0
        }
        fn read_slot<R>(&self, i: usize, f: impl FnOnce(&DVector<f64>) -> R) -> R {
            f(&self.slots[i].1)
        }
    }

    impl ParamAccessMut for Owned {
        fn write_slot<R>(&mut self, i: usize, f: impl FnOnce(&mut DVector<f64>) -> R) -> R {
            f(&mut self.slots[i].1)
        }
    }

    fn batch() -> Batch {
        Batch {
            inputs: vec![
                DVector::from_vec(vec![1.0, 0.0]),
                DVector::from_vec(vec![0.0, 1.0]),
                DVector::from_vec(vec![-1.0, 0.0]),
            ],
            targets: vec![1.0, -1.0, -1.0],
        }
    }

    fn net() -> Owned {
        Owned {
            slots: vec![
                (SlotKind::Parameter, DVector::from_vec(vec![0.1, 0.1])),
                (SlotKind::Parameter, DVector::from_vec(vec![0.0, 0.2])),
                (SlotKind::Buffer, DVector::zeros(1)),
            ],
        }
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut n = net();
        let b = batch();
        let before = evaluate(&n, &b).unwrap().loss;
        for _ in 0..50 {
            train_step(&mut n, &b, 0.5).unwrap();
        }
        let after = evaluate(&n, &b).unwrap();
        assert!(after.loss < before);
        assert_eq!(after.accuracy, 1.0);
        assert!(n.slots[2].1[0] > 0.0);
    }

    #[test]
    fn test_buffers_get_zero_gradient() {
        let (_, grads) = gradients(&net(), &batch()).unwrap();
        assert_eq!(grads.len(), 3);
        assert_eq!(grads[2], DVector::zeros(1));
        assert_ne!(grads[0], DVector::zeros(2));
    }

    #[test]
    fn test_width_mismatch_is_an_error() {
        let b = Batch {
            inputs: vec![DVector::from_vec(vec![1.0, 2.0, 3.0])],
            targets: vec![1.0],
        };
        assert!(evaluate(&net(), &b).is_err());
        assert!(evaluate(&net(), &Batch::default()).is_err());
    }

    #[test]
    fn test_mean_output() {
        let a = ModelOutput { loss: 1.0, accuracy: 0.5, num_params: 4 };
        let b = ModelOutput { loss: 3.0, accuracy: 1.0, num_params: 4 };
        let m = ModelOutput::mean(&[a, b]).unwrap();
        assert_eq!(m.loss, 2.0);
        assert_eq!(m.accuracy, 0.75);
        assert!(ModelOutput::mean(&[]).is_none());
    }
}
