//! Dense matrix multiplication expressed as a key join.
//!
//! For `C = A × B`, every row of the multiplicand `A` is broadcast to all
//! output cells of its row, and every entry `B[k][j]` is sent to all output
//! cells of column `j`. The cell `(i, j)` then holds row `i` of `A` and
//! column `j` of `B`, and its value is their dot product.

use std::{fmt, str::FromStr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use clap::{Parser, ValueEnum};
use glob::Pattern;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    context::TaskContext,
    error::{ConfigErrors, PipelineError},
};

const COUNTERS: &str = "matrix";

/// `rows x cols` of a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dims {
    pub rows: u32,
    pub cols: u32,
}

impl Dims {
    pub fn new(rows: u32, cols: u32) -> Self {
        Self { rows, cols }
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

impl FromStr for Dims {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || PipelineError::parse("matrix dimensions (ROWSxCOLS)", s);
        let (rows, cols) = s.trim().split_once(['x', 'X']).ok_or_else(err)?;
        let rows: u32 = rows.trim().parse().map_err(|_| err())?;
        let cols: u32 = cols.trim().parse().map_err(|_| err())?;
        if rows == 0 || cols == 0 {
            return Err(err());
        }
        Ok(Self { rows, cols })
    }
}

/// The two inputs of the product, as named on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operand {
    Lhs,
    Rhs,
}

/// The part an operand plays in the product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The left factor, whose rows are broadcast.
    Multiplicand,
    /// The right factor, whose entries are sent one by one.
    Multiplier,
}

/// Command-line style arguments of the `matrix` workload.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[clap(no_binary_name = true)]
pub struct MatrixArgs {
    /// Dimensions of the lhs matrix, ROWSxCOLS
    #[clap(long)]
    pub lhs: Option<String>,
    /// Dimensions of the rhs matrix, ROWSxCOLS
    #[clap(long)]
    pub rhs: Option<String>,
    /// Glob pattern matching the input files of the lhs matrix
    #[clap(long)]
    pub lhs_input: Option<String>,
    /// Glob pattern matching the input files of the rhs matrix
    #[clap(long)]
    pub rhs_input: Option<String>,
    /// Which operand is the multiplicand (left factor)
    #[clap(long, value_enum, default_value = "lhs")]
    pub multiplicand: Operand,
}

impl MatrixArgs {
    pub fn validate(&self) -> Result<MatrixConfig, ConfigErrors> {
        let mut errors = ConfigErrors::new();
        let mut dims = |name: &str, spec: &Option<String>| match spec {
            None => {
                errors.push(format!("missing --{name} dimensions"));
                None
            }
            Some(spec) => spec
                .parse::<Dims>()
                .map_err(|e| errors.push(format!("--{name}: {e}")))
                .ok(),
        };
        let lhs = dims("lhs", &self.lhs);
        let rhs = dims("rhs", &self.rhs);

        let mut pattern = |name: &str, spec: &Option<String>| match spec {
            None => {
                errors.push(format!("missing --{name}"));
                None
            }
            Some(spec) => Pattern::new(spec)
                .map_err(|e| errors.push(format!("--{name}: {e}")))
                .ok(),
        };
        let lhs_input = pattern("lhs-input", &self.lhs_input);
        let rhs_input = pattern("rhs-input", &self.rhs_input);

        if let (Some(lhs), Some(rhs)) = (lhs, rhs) {
            let (a, b) = match self.multiplicand {
                Operand::Lhs => (lhs, rhs),
                Operand::Rhs => (rhs, lhs),
            };
            if a.cols != b.rows {
                errors.push(format!(
                    "cannot multiply {a} by {b}: the multiplicand has {} columns but the multiplier has {} rows",
                    a.cols, b.rows
                ));
            }
        }

        match (lhs, rhs, lhs_input, rhs_input) {
            (Some(lhs), Some(rhs), Some(lhs_input), Some(rhs_input)) if errors.is_empty() => {
                Ok(MatrixConfig {
                    lhs,
                    rhs,
                    lhs_input,
                    rhs_input,
                    multiplicand: self.multiplicand,
                })
            }
            _ => Err(errors),
        }
    }
}

/// Validated product settings; the dimensions are known to be compatible.
#[derive(Debug, Clone)]
pub struct MatrixConfig {
    pub lhs: Dims,
    pub rhs: Dims,
    pub lhs_input: Pattern,
    pub rhs_input: Pattern,
    pub multiplicand: Operand,
}

impl MatrixConfig {
    pub fn role(&self, operand: Operand) -> Role {
        if operand == self.multiplicand {
            Role::Multiplicand
        } else {
            Role::Multiplier
        }
    }

    pub fn dims(&self, operand: Operand) -> Dims {
        match operand {
            Operand::Lhs => self.lhs,
            Operand::Rhs => self.rhs,
        }
    }

    pub fn dims_of(&self, role: Role) -> Dims {
        match (role, self.multiplicand) {
            (Role::Multiplicand, Operand::Lhs) | (Role::Multiplier, Operand::Rhs) => self.lhs,
            _ => self.rhs,
        }
    }

    /// Dimensions of the product.
    pub fn output(&self) -> Dims {
        Dims::new(
            self.dims_of(Role::Multiplicand).rows,
            self.dims_of(Role::Multiplier).cols,
        )
    }

    /// The operand an input file belongs to, by path.
    pub fn operand_of(&self, path: &str) -> Option<Operand> {
        match (self.lhs_input.matches(path), self.rhs_input.matches(path)) {
            (true, false) => Some(Operand::Lhs),
            (false, true) => Some(Operand::Rhs),
            _ => None,
        }
    }
}

/// One cell of the product. Orders row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Coordinate {
    pub row: u32,
    pub col: u32,
}

impl Coordinate {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Fixed-width big-endian key, so byte order is row-major order.
    pub fn to_key(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(self.row);
        buf.put_u32(self.col);
        buf.freeze()
    }

    pub fn from_key(mut key: &[u8]) -> Result<Self, PipelineError> {
        if key.len() != 8 {
            return Err(PipelineError::Matrix(format!(
                "coordinate key must be 8 bytes, got {}",
                key.len()
            )));
        }
        let row = key.get_u32();
        let col = key.get_u32();
        Ok(Self { row, col })
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.row, self.col)
    }
}

/// What one output cell receives from the decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatrixCell {
    /// A whole multiplicand row.
    Broadcast { row: u32, values: Vec<f64> },
    /// One multiplier entry, tagged with the multiplier row it came from.
    Contribution { index: u32, value: f64 },
}

/// Parses an input row, `ROW\tv0,v1,...`.
pub fn parse_row(line: &str) -> Result<(u32, Vec<f64>), PipelineError> {
    let (row, values) = line
        .split_once('\t')
        .ok_or_else(|| PipelineError::parse("matrix row", line))?;
    let row = row
        .trim()
        .parse()
        .map_err(|_| PipelineError::parse("matrix row index", line))?;
    let values = values
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| PipelineError::parse("matrix row values", line))?;
    Ok((row, values))
}

/// Renders an input row, the inverse of [`parse_row`].
pub fn format_row(row: u32, values: &[f64]) -> String {
    format!("{}\t{}", row, values.iter().join(","))
}

/// Renders one product cell, `row,col\tvalue`.
pub fn format_cell(coord: Coordinate, value: f64) -> String {
    format!("{}\t{}", coord, value)
}

/// Parses a product cell written by [`format_cell`].
pub fn parse_cell(line: &str) -> Result<(Coordinate, f64), PipelineError> {
    let err = || PipelineError::parse("matrix cell", line);
    let (coord, value) = line.split_once('\t').ok_or_else(err)?;
    let (row, col) = coord.split_once(',').ok_or_else(err)?;
    Ok((
        Coordinate::new(
            row.trim().parse().map_err(|_| err())?,
            col.trim().parse().map_err(|_| err())?,
        ),
        value.trim().parse().map_err(|_| err())?,
    ))
}

/// Decomposes input rows into cells and folds cells into products.
pub struct MatrixEngine {
    config: MatrixConfig,
    ctx: TaskContext,
}

impl MatrixEngine {
    pub fn new(config: MatrixConfig, ctx: &TaskContext) -> Self {
        Self {
            config,
            ctx: ctx.clone(),
        }
    }

    pub fn config(&self) -> &MatrixConfig {
        &self.config
    }

    /// Cells emitted for row `row` of the operand playing `role`.
    ///
    /// Fails if the row does not fit the configured dimensions.
    pub fn decompose(
        &self,
        role: Role,
        row: u32,
        values: &[f64],
    ) -> Result<Vec<(Coordinate, MatrixCell)>, PipelineError> {
        let dims = self.config.dims_of(role);
        if row >= dims.rows || values.len() != dims.cols as usize {
            return Err(PipelineError::Matrix(format!(
                "row {row} with {} values does not fit a {dims} matrix",
                values.len()
            )));
        }

        let cells: Vec<(Coordinate, MatrixCell)> = match role {
            Role::Multiplicand => {
                let out_cols = self.config.dims_of(Role::Multiplier).cols;
                (0..out_cols)
                    .map(|col| {
                        (
                            Coordinate::new(row, col),
                            MatrixCell::Broadcast {
                                row,
                                values: values.to_vec(),
                            },
                        )
                    })
                    .collect()
            }
            Role::Multiplier => {
                let out_rows = self.config.dims_of(Role::Multiplicand).rows;
                values
                    .iter()
                    .enumerate()
                    .flat_map(|(col, &value)| {
                        (0..out_rows).map(move |out_row| {
                            (
                                Coordinate::new(out_row, col as u32),
                                MatrixCell::Contribution { index: row, value },
                            )
                        })
                    })
                    .collect()
            }
        };
        Ok(cells)
    }

    /// The value of the product at `coord`.
    ///
    /// Requires exactly one broadcast row and one contribution for each of
    /// its positions; anything else means cells were lost or duplicated
    /// upstream and the dot product would be wrong.
    pub fn accumulate(&self, coord: Coordinate, cells: Vec<MatrixCell>) -> Result<f64, PipelineError> {
        let mut broadcast = None;
        let mut contributions = Vec::with_capacity(cells.len());
        for cell in cells {
            match cell {
                MatrixCell::Broadcast { values, .. } => {
                    if broadcast.replace(values).is_some() {
                        return Err(PipelineError::Matrix(format!(
                            "cell {coord} received more than one multiplicand row"
                        )));
                    }
                }
                MatrixCell::Contribution { index, value } => contributions.push((index, value)),
            }
        }
        let row = broadcast.ok_or_else(|| {
            PipelineError::Matrix(format!("cell {coord} received no multiplicand row"))
        })?;

        contributions.sort_by_key(|(index, _)| *index);
        let positions_match = contributions.len() == row.len()
            && contributions
                .iter()
                .enumerate()
                .all(|(pos, (index, _))| *index as usize == pos);
        if !positions_match {
            return Err(PipelineError::Matrix(format!(
                "cell {coord}: multiplicand row has {} entries but {} multiplier entries arrived",
                row.len(),
                contributions.len()
            )));
        }

        let value = row
            .iter()
            .zip(&contributions)
            .map(|(a, (_, b))| a * b)
            .sum();
        self.ctx.increment(COUNTERS, "cells");
        trace!(parent: self.ctx.span(), %coord, value, "accumulated");
        Ok(value)
    }
}
