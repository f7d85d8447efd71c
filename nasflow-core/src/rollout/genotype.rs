//! Genotype text encoding
//!
//! Grammar: comma-separated `key=value` assignments where a value is either
//! a choice index or an `(expansion, kernel)` pair:
//!
//! ```text
//! cell_0=1, cell_0_block_0=(1, 3)
//! ```

use crate::error::{NasError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// One assigned value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gene {
    Choice(u32),
    Pair(u32, u32),
}

impl fmt::Display for Gene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gene::Choice(c) => write!(f, "{}", c),
            Gene::Pair(a, b) => write!(f, "({}, {})", a, b),
        }
    }
}

/// Ordered key/value assignment describing one architecture
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Genotype {
    genes: Vec<(String, Gene)>,
}

impl Genotype {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an assignment; keys must be unique identifiers
    pub fn push(&mut self, key: impl Into<String>, gene: Gene) -> Result<()> {
        let key = key.into();
        if !is_identifier(&key) {
            return Err(NasError::Genotype(format!("invalid key '{}'", key)));
        }
        if self.get(&key).is_some() {
            return Err(NasError::Genotype(format!("duplicate key '{}'", key)));
        }
        self.genes.push((key, gene));
        Ok(())
    }

    pub fn with(mut self, key: impl Into<String>, gene: Gene) -> Result<Self> {
        self.push(key, gene)?;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<Gene> {
        self.genes.iter().find(|(k, _)| k == key).map(|(_, g)| *g)
    }

    pub fn choice(&self, key: &str) -> Option<u32> {
        match self.get(key)? {
            Gene::Choice(c) => Some(c),
            Gene::Pair(..) => None,
        }
    }

    pub fn pair(&self, key: &str) -> Option<(u32, u32)> {
        match self.get(key)? {
            Gene::Pair(a, b) => Some((a, b)),
            Gene::Choice(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Gene)> {
        self.genes.iter().map(|(k, g)| (k.as_str(), *g))
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }
}

impl fmt::Display for Genotype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, gene)) in self.genes.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", key, gene)?;
        }
        Ok(())
    }
}

impl FromStr for Genotype {
    type Err = NasError;

    fn from_str(s: &str) -> Result<Self> {
        let mut genotype = Genotype::new();
        for item in split_top_level(s)? {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| NasError::Genotype(format!("missing '=' in '{}'", item)))?;
            genotype.push(key.trim(), parse_gene(value.trim())?)?;
        }
        Ok(genotype)
    }
}

impl Serialize for Genotype {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Genotype {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

fn is_identifier(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split on commas that are not inside parentheses
fn split_top_level(s: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| NasError::Genotype(format!("unbalanced ')' in '{}'", s)))?
            }
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(NasError::Genotype(format!("unclosed '(' in '{}'", s)));
    }
    parts.push(&s[start..]);
    Ok(parts)
}

fn parse_gene(value: &str) -> Result<Gene> {
    let number = |text: &str| {
        text.trim()
            .parse::<u32>()
            .map_err(|_| NasError::Genotype(format!("expected an integer, got '{}'", text.trim())))
    };
    match value.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        Some(inner) => {
            let (a, b) = inner
                .split_once(',')
                .ok_or_else(|| NasError::Genotype(format!("expected a pair, got '{}'", value)))?;
            Ok(Gene::Pair(number(a)?, number(b)?))
        }
        None => Ok(Gene::Choice(number(value)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let text = "cell_0=1, cell_0_block_0=(1, 3)";
        let g: Genotype = text.parse().unwrap();
        assert_eq!(g.choice("cell_0"), Some(1));
        assert_eq!(g.pair("cell_0_block_0"), Some((1, 3)));
        assert_eq!(g.to_string(), text);
    }

    #[test]
    fn test_whitespace_normalized() {
        let g: Genotype = "cell_0 = 2 ,cell_0_block_0=( 6,7 ),".parse().unwrap();
        assert_eq!(g.to_string(), "cell_0=2, cell_0_block_0=(6, 7)");
        let again: Genotype = g.to_string().parse().unwrap();
        assert_eq!(again, g);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("cell_0".parse::<Genotype>().is_err());
        assert!("cell_0=x".parse::<Genotype>().is_err());
        assert!("cell_0=(1, 3".parse::<Genotype>().is_err());
        assert!("cell_0=1), x=2".parse::<Genotype>().is_err());
        assert!("cell_0=1, cell_0=2".parse::<Genotype>().is_err());
        assert!("cell-0=1".parse::<Genotype>().is_err());
        assert!("cell_0=(1)".parse::<Genotype>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let g: Genotype = "cell_0=1, cell_1=0".parse().unwrap();
        let json = serde_json::to_string(&g).unwrap();
        assert_eq!(json, "\"cell_0=1, cell_1=0\"");
        let back: Genotype = serde_json::from_str(&json).unwrap();
        assert_eq!(back, g);
    }
}
