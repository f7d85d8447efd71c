//! Parameter slot addressing

use crate::error::{NasError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable address of one slot in the shared parameter pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParamKey {
    /// Used by every candidate (stem, classifier)
    Common(String),
    /// Structural slot: cell index, operation index, channel group
    Cell { cell: u32, op: u32, group: u32 },
    /// Running statistics of one cell
    Stats { cell: u32 },
}

impl ParamKey {
    pub fn common(name: impl Into<String>) -> Self {
        ParamKey::Common(name.into())
    }

    pub fn cell(cell: u32, op: u32, group: u32) -> Self {
        ParamKey::Cell { cell, op, group }
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKey::Common(name) => write!(f, "common.{}", name),
            ParamKey::Cell { cell, op, group } => write!(f, "cells.{}.op{}.g{}", cell, op, group),
            ParamKey::Stats { cell } => write!(f, "cells.{}.stats", cell),
        }
    }
}

impl FromStr for ParamKey {
    type Err = NasError;

    /// Inverse of `Display`
    fn from_str(s: &str) -> Result<Self> {
        let bad = || NasError::Config(format!("malformed parameter key '{}'", s));
        if let Some(name) = s.strip_prefix("common.") {
            if name.is_empty() {
                return Err(bad());
            }
            return Ok(ParamKey::common(name));
        }
        let rest = s.strip_prefix("cells.").ok_or_else(bad)?;
        let parts: Vec<&str> = rest.split('.').collect();
        let cell: u32 = parts[0].parse().map_err(|_| bad())?;
        match parts.as_slice() {
            [_, "stats"] => Ok(ParamKey::Stats { cell }),
            [_, op, group] => {
                let op = op.strip_prefix("op").and_then(|v| v.parse().ok()).ok_or_else(bad)?;
                let group = group.strip_prefix('g').and_then(|v| v.parse().ok()).ok_or_else(bad)?;
                Ok(ParamKey::cell(cell, op, group))
            }
            _ => Err(bad()),
        }
    }
}

/// Whether a slot is trained or only tracks statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    Parameter,
    Buffer,
}

/// Declaration of one slot by a search space
#[derive(Debug, Clone, PartialEq)]
pub struct SlotSpec {
    pub key: ParamKey,
    pub kind: SlotKind,
}

impl SlotSpec {
    pub fn parameter(key: ParamKey) -> Self {
        Self {
            key,
            kind: SlotKind::Parameter,
        }
    }

    pub fn buffer(key: ParamKey) -> Self {
        Self {
            key,
            kind: SlotKind::Buffer,
        }
    }
}
