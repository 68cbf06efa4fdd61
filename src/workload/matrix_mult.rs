//! The `matrix` stage: one dense product in a single map/reduce round.
//!
//! Input files hold `row\tv0,v1,...` lines; which operand a file belongs to
//! is decided by matching its path against `--lhs-input` and `--rhs-input`.

use anyhow::{bail, Result};
use bytes::Bytes;
use tracing::{debug, warn};

use super::decode;
use crate::{
    error::PipelineError,
    matrix::{format_cell, parse_row, Coordinate, MatrixArgs, MatrixCell, MatrixEngine},
    utils::{parse_aux, string_from_bytes, string_to_bytes},
    KeyValue, MapOutput, TaskContext,
};

const COUNTERS: &str = "matrix";

fn engine(aux: &Bytes, ctx: &TaskContext) -> Result<MatrixEngine> {
    let config = parse_aux::<MatrixArgs>(aux)?
        .validate()
        .map_err(PipelineError::Config)?;
    Ok(MatrixEngine::new(config, ctx))
}

pub fn map(kv: KeyValue, aux: Bytes, ctx: &TaskContext) -> MapOutput {
    let engine = engine(&aux, ctx)?;
    let path = string_from_bytes(kv.key)?;
    let Some(operand) = engine.config().operand_of(&path) else {
        bail!("input `{}` matches neither or both operand patterns", path);
    };
    let role = engine.config().role(operand);

    let text = string_from_bytes(kv.value)?;
    let mut out = Vec::new();
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        let cells = parse_row(line).and_then(|(row, values)| engine.decompose(role, row, &values));
        match cells {
            Ok(cells) => {
                for (coord, cell) in cells {
                    out.push(Ok(KeyValue::new(
                        coord.to_key(),
                        Bytes::from(serde_json::to_vec(&cell)?),
                    )));
                }
            }
            Err(e) => {
                ctx.increment(COUNTERS, "malformed");
                warn!(parent: ctx.span(), %path, error = %e, "skipping matrix row");
            }
        }
    }
    debug!(parent: ctx.span(), %path, ?role, cells = out.len(), "decomposed");
    Ok(Box::new(out.into_iter()))
}

pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    aux: Bytes,
    ctx: &TaskContext,
) -> Result<Bytes> {
    let engine = engine(&aux, ctx)?;
    let coord = Coordinate::from_key(&key)?;
    let cells = values
        .map(|value| decode::<MatrixCell>(&value))
        .collect::<Result<Vec<_>>>()?;
    let value = engine.accumulate(coord, cells)?;
    Ok(string_to_bytes(format!("{}\n", format_cell(coord, value))))
}
