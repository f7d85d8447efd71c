//! Schedule rules — step functions and ramps over the global step
//!
//! A rule is parsed and validated once when the configuration is loaded and
//! is immutable afterwards. Resolution is a pure function of `(rule, step)`.

use crate::error::{NasError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a rule maps a step onto its values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Right-continuous step function
    Value,
    /// Same lookup as `Value`; names a training stage rather than a scalar
    Stage,
    /// Piecewise-linear interpolation, clamped outside the boundaries
    Linear,
}

/// Document form of a rule: `{type, boundary, value}`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    #[serde(rename = "type")]
    kind: ScheduleKind,
    boundary: Vec<u64>,
    value: Vec<Value>,
}

/// A validated schedule rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleRule {
    kind: ScheduleKind,
    boundaries: Vec<u64>,
    values: Vec<Value>,
    /// Numeric view of `values` for linear rules (scalars are length-1 rows)
    #[serde(skip)]
    numeric: Option<Vec<Vec<f64>>>,
    #[serde(skip)]
    scalar: bool,
}

impl ScheduleRule {
    /// Build and validate a rule for `attribute`
    pub fn new(
        attribute: &str,
        kind: ScheduleKind,
        boundaries: Vec<u64>,
        values: Vec<Value>,
    ) -> Result<Self> {
        if boundaries.is_empty() {
            return Err(NasError::schedule(attribute, "boundary list is empty"));
        }
        if boundaries.len() != values.len() {
            return Err(NasError::schedule(
                attribute,
                format!(
                    "{} boundaries but {} values",
                    boundaries.len(),
                    values.len()
                ),
            ));
        }
        if let Some(w) = boundaries.windows(2).find(|w| w[1] < w[0]) {
            return Err(NasError::schedule(
                attribute,
                format!("boundaries not monotonic: {} follows {}", w[1], w[0]),
            ));
        }

        let scalar = values.iter().all(Value::is_number);
        let numeric = match kind {
            ScheduleKind::Linear => Some(numeric_rows(attribute, &values)?),
            ScheduleKind::Value | ScheduleKind::Stage => None,
        };

        Ok(Self {
            kind,
            boundaries,
            values,
            numeric,
            scalar,
        })
    }

    /// Parse the `{type, boundary, value}` document form
    pub fn parse(attribute: &str, doc: &Value) -> Result<Self> {
        let raw: RawRule = serde_json::from_value(doc.clone())
            .map_err(|e| NasError::schedule(attribute, e.to_string()))?;
        Self::new(attribute, raw.kind, raw.boundary, raw.value)
    }

    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    pub fn boundaries(&self) -> &[u64] {
        &self.boundaries
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// True when every value is a plain number
    pub fn is_scalar(&self) -> bool {
        self.scalar
    }

    /// True when every value is a number or an array of numbers
    pub fn is_numeric(&self) -> bool {
        self.numeric.is_some() || numeric_rows("", &self.values).is_ok()
    }

    /// Resolve the value in force at `step`
    pub fn resolve(&self, step: u64) -> Value {
        // number of boundaries <= step; the active index is one less
        let passed = self.boundaries.partition_point(|&b| b <= step);
        match self.kind {
            ScheduleKind::Value | ScheduleKind::Stage => {
                self.values[passed.saturating_sub(1)].clone()
            }
            ScheduleKind::Linear => self.interpolate(step, passed),
        }
    }

    /// Resolve to a scalar, if the rule holds numbers
    pub fn resolve_f64(&self, step: u64) -> Option<f64> {
        self.resolve(step).as_f64()
    }

    /// Resolve to a numeric vector (a scalar becomes a length-1 vector)
    pub fn resolve_vec(&self, step: u64) -> Option<Vec<f64>> {
        as_row(&self.resolve(step))
    }

    fn interpolate(&self, step: u64, passed: usize) -> Value {
        let rows = match &self.numeric {
            Some(rows) => rows,
            None => return self.values[passed.saturating_sub(1)].clone(),
        };
        let last = rows.len() - 1;
        let row = if passed == 0 {
            rows[0].clone()
        } else if passed > last {
            rows[last].clone()
        } else {
            let (lo, hi) = (passed - 1, passed);
            let span = (self.boundaries[hi] - self.boundaries[lo]) as f64;
            let t = (step - self.boundaries[lo]) as f64 / span;
            rows[lo]
                .iter()
                .zip(&rows[hi])
                .map(|(a, b)| a + (b - a) * t)
                .collect()
        };
        if self.scalar {
            Value::from(row[0])
        } else {
            Value::from(row)
        }
    }
}

fn as_row(value: &Value) -> Option<Vec<f64>> {
    match value {
        Value::Number(n) => n.as_f64().map(|x| vec![x]),
        Value::Array(items) => items.iter().map(Value::as_f64).collect(),
        _ => None,
    }
}

fn numeric_rows(attribute: &str, values: &[Value]) -> Result<Vec<Vec<f64>>> {
    let rows: Vec<Vec<f64>> = values
        .iter()
        .map(|v| {
            as_row(v).ok_or_else(|| {
                NasError::schedule(attribute, format!("non-numeric value {} in linear rule", v))
            })
        })
        .collect::<Result<_>>()?;
    let width = rows[0].len();
    if width == 0 || rows.iter().any(|r| r.len() != width) {
        return Err(NasError::schedule(
            attribute,
            "linear rule values must share one non-empty shape",
        ));
    }
    let scalars = values.iter().filter(|v| v.is_number()).count();
    if scalars != 0 && scalars != values.len() {
        return Err(NasError::schedule(
            attribute,
            "linear rule mixes scalars and vectors",
        ));
    }
    Ok(rows)
}
