//! Global step counter — one writer, many readers
//!
//! The trainer owns the only [`StepCounter`]; everything else holds a
//! [`StepReader`]. Each advance is a single atomic publish, so readers see
//! either the old or the new step, never a torn value.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What one unit of the global step counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepUnit {
    /// One step per epoch; epoch `e` runs at step `e + 1`
    #[default]
    Epoch,
    /// One step per controller step and per evaluator step
    InnerStep,
}

/// Writer handle. Deliberately not `Clone`.
#[derive(Debug)]
pub struct StepCounter {
    value: Arc<AtomicU64>,
}

/// Read-only handle
#[derive(Debug, Clone)]
pub struct StepReader {
    value: Arc<AtomicU64>,
}

impl StepCounter {
    pub fn new(start: u64) -> Self {
        Self {
            value: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Advance by one and return the new step
    pub fn advance(&mut self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Move forward to `step`; earlier values are ignored
    pub fn advance_to(&mut self, step: u64) -> u64 {
        self.value.fetch_max(step, Ordering::AcqRel).max(step)
    }

    /// Overwrite the counter, possibly backwards. Only for checkpoint restore,
    /// which must restore every step-dependent piece of state alongside.
    pub fn restore(&mut self, step: u64) {
        self.value.store(step, Ordering::Release);
    }

    pub fn reader(&self) -> StepReader {
        StepReader {
            value: Arc::clone(&self.value),
        }
    }
}

impl StepReader {
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_follow_writer() {
        let mut counter = StepCounter::new(0);
        let reader = counter.reader();
        assert_eq!(counter.advance(), 1);
        assert_eq!(counter.advance(), 2);
        assert_eq!(reader.get(), 2);
    }

    #[test]
    fn test_advance_to_is_monotonic() {
        let mut counter = StepCounter::new(10);
        assert_eq!(counter.advance_to(5), 10);
        assert_eq!(counter.advance_to(12), 12);
        assert_eq!(counter.get(), 12);
    }

    #[test]
    fn test_restore_moves_backwards() {
        let mut counter = StepCounter::new(40);
        let reader = counter.reader();
        counter.restore(7);
        assert_eq!(reader.get(), 7);
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_values() {
        let mut counter = StepCounter::new(0);
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let r = counter.reader();
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..10_000 {
                        let now = r.get();
                        assert!(now >= last);
                        last = now;
                    }
                })
            })
            .collect();
        for _ in 0..10_000 {
            counter.advance();
        }
        for handle in readers {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(), 10_000);
    }
}
