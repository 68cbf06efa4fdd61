//! Dataset-wide minimum and maximum of the normalized variables.
//!
//! Statistics are a separate pass: every record has to be seen before any
//! record can be rescaled. The pass persists `MIN(var):value` and
//! `MAX(var):value` lines which the normalizer loads back.

use std::{collections::BTreeMap, fmt, fs};

use anyhow::Context;
use glob::glob;
use serde::{Deserialize, Serialize};

use crate::{error::PipelineError, record::TypedRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stat {
    Min,
    Max,
}

impl Stat {
    pub fn tag(self) -> &'static str {
        match self {
            Stat::Min => "MIN",
            Stat::Max => "MAX",
        }
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Running bounds of one variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMax {
    pub min: f64,
    pub max: f64,
}

impl MinMax {
    pub fn new(value: f64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    pub fn observe(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn merge(&mut self, other: MinMax) {
        self.observe(other.min);
        self.observe(other.max);
    }

    #[inline]
    pub fn range(&self) -> f64 {
        self.max - self.min
    }
}

/// Tracks [`MinMax`] for a fixed list of variables.
#[derive(Debug, Clone)]
pub struct StatsAccumulator {
    variables: Vec<String>,
    bounds: BTreeMap<String, MinMax>,
}

impl StatsAccumulator {
    pub fn new<S: AsRef<str>>(variables: &[S]) -> Self {
        Self {
            variables: variables.iter().map(|v| v.as_ref().to_string()).collect(),
            bounds: BTreeMap::new(),
        }
    }

    /// Folds the configured variables of `record` in. Absent, non-numeric
    /// and NaN values are ignored.
    pub fn observe(&mut self, record: &TypedRecord) {
        for variable in &self.variables {
            let Some(value) = record.get_f64(variable).filter(|v| !v.is_nan()) else {
                continue;
            };
            self.bounds
                .entry(variable.clone())
                .and_modify(|b| b.observe(value))
                .or_insert_with(|| MinMax::new(value));
        }
    }

    /// Folds in bounds computed elsewhere, e.g. by another map task.
    pub fn merge(&mut self, variable: &str, bounds: MinMax) {
        self.bounds
            .entry(variable.to_string())
            .and_modify(|b| b.merge(bounds))
            .or_insert(bounds);
    }

    pub fn bounds(&self) -> &BTreeMap<String, MinMax> {
        &self.bounds
    }

    pub fn into_bounds(self) -> BTreeMap<String, MinMax> {
        self.bounds
    }

    pub fn into_table(self) -> StatsTable {
        StatsTable::from_bounds(&self.bounds)
    }
}

/// `(variable, statistic) -> value`, read-only once loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsTable(BTreeMap<(String, Stat), f64>);

impl StatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bounds(bounds: &BTreeMap<String, MinMax>) -> Self {
        let mut table = Self::new();
        for (variable, b) in bounds {
            table.insert(variable, Stat::Min, b.min);
            table.insert(variable, Stat::Max, b.max);
        }
        table
    }

    pub fn insert(&mut self, variable: &str, stat: Stat, value: f64) {
        self.0.insert((variable.to_string(), stat), value);
    }

    pub fn get(&self, variable: &str, stat: Stat) -> Option<f64> {
        self.0.get(&(variable.to_string(), stat)).copied()
    }

    /// Both bounds of `variable`, if both were recorded.
    pub fn bounds(&self, variable: &str) -> Option<MinMax> {
        Some(MinMax {
            min: self.get(variable, Stat::Min)?,
            max: self.get(variable, Stat::Max)?,
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The persisted lines, `MIN(var):value` / `MAX(var):value`.
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.0
            .iter()
            .map(|((variable, stat), value)| encode_stat(variable, *stat, *value))
    }

    /// Reads every stats line of `text`; other lines are ignored.
    pub fn from_text(text: &str) -> Result<Self, PipelineError> {
        let mut table = Self::new();
        for line in text.lines() {
            if let Some((variable, stat, value)) = parse_stat(line)? {
                table.insert(&variable, stat, value);
            }
        }
        Ok(table)
    }

    /// Reads the stats lines of every file matching `pattern`.
    pub fn load(pattern: &str) -> anyhow::Result<Self> {
        let mut table = Self::new();
        for path in glob(pattern)?.flatten() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading stats from {}", path.display()))?;
            table.0.extend(Self::from_text(&text)?.0);
        }
        anyhow::ensure!(!table.is_empty(), "no statistics found in `{}`", pattern);
        Ok(table)
    }
}

pub fn encode_stat(variable: &str, stat: Stat, value: f64) -> String {
    format!("{}({}):{}", stat, variable, value)
}

/// Parses a stats line. Lines that do not start with a stats tag are not
/// stats lines and yield `Ok(None)`.
pub fn parse_stat(line: &str) -> Result<Option<(String, Stat, f64)>, PipelineError> {
    let line = line.trim();
    let (stat, rest) = if let Some(rest) = line.strip_prefix("MIN(") {
        (Stat::Min, rest)
    } else if let Some(rest) = line.strip_prefix("MAX(") {
        (Stat::Max, rest)
    } else {
        return Ok(None);
    };
    let (variable, value) = rest
        .split_once("):")
        .ok_or_else(|| PipelineError::parse("stats line", line))?;
    let value = value
        .trim()
        .parse()
        .map_err(|_| PipelineError::parse("stats value", line))?;
    Ok(Some((variable.to_string(), stat, value)))
}
