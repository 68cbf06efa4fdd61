//! The `stats` stage: dataset-wide bounds of every variable.
//!
//! Each map task folds its split into one partial [`MinMax`] per variable,
//! keyed by the variable name; the reducer combines the partials.

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{date_range, decode, emit_meta, non_empty, reduce_meta};
use crate::{
    codec::{decode_line, Line, MetaEntry, Metadata},
    date::{DateRange, META_KEY},
    error::{ConfigErrors, PipelineError},
    stats::{encode_stat, MinMax, Stat, StatsAccumulator},
    utils::{parse_aux, string_from_bytes},
    KeyValue, MapOutput, TaskContext,
};

const COUNTERS: &str = "stats";

/// Arguments shared by the stages that consume the joined dataset.
#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
#[clap(no_binary_name = true)]
pub struct VariableArgs {
    /// First day kept (inclusive), YYYY-MM-DD
    #[clap(long)]
    pub start: Option<String>,
    /// First day dropped (exclusive), YYYY-MM-DD
    #[clap(long)]
    pub end: Option<String>,
    /// A variable to process; repeatable
    #[clap(long = "variable")]
    pub variables: Vec<String>,
    /// Output file of the upstream stage carrying its metadata lines
    #[clap(long)]
    pub metadata: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VariableConfig {
    pub date_range: DateRange,
    pub variables: Vec<String>,
    pub metadata: Vec<String>,
}

impl VariableArgs {
    pub fn validate(&self) -> Result<VariableConfig, ConfigErrors> {
        let mut errors = ConfigErrors::new();
        match self.check(&mut errors) {
            Some(config) if errors.is_empty() => Ok(config),
            _ => Err(errors),
        }
    }

    /// Records every problem in `errors`; the config is only complete if
    /// nothing was recorded.
    pub(crate) fn check(&self, errors: &mut ConfigErrors) -> Option<VariableConfig> {
        let range = date_range(self.start.as_deref(), self.end.as_deref(), errors);
        non_empty("variable", &self.variables, errors);
        non_empty("metadata", &self.metadata, errors);
        range.map(|date_range| VariableConfig {
            date_range,
            variables: self.variables.clone(),
            metadata: self.metadata.clone(),
        })
    }
}

impl VariableConfig {
    /// Loads the upstream metadata and checks it was produced for this
    /// configuration.
    pub fn verified_metadata(&self) -> Result<Metadata> {
        let metadata = Metadata::load(&self.metadata)?;
        self.verify(&metadata)?;
        Ok(metadata)
    }

    /// Fails unless `metadata` carries this configuration's date range and
    /// variables.
    pub fn verify(&self, metadata: &Metadata) -> Result<(), PipelineError> {
        metadata.verify_date_range(&self.date_range)?;
        metadata.verify_factors(&self.variables)
    }
}

pub fn map(kv: KeyValue, aux: Bytes, ctx: &TaskContext) -> MapOutput {
    let config = parse_aux::<VariableArgs>(&aux)?
        .validate()
        .map_err(PipelineError::Config)?;
    let metadata = config.verified_metadata()?;

    let mut acc = StatsAccumulator::new(&config.variables);
    let text = string_from_bytes(kv.value)?;
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        match decode_line(line, &metadata.types) {
            Ok(Line::Record(_, record)) => acc.observe(&record),
            Ok(Line::Meta(_)) => {}
            Err(e) => {
                ctx.increment(COUNTERS, "malformed");
                warn!(parent: ctx.span(), error = %e, "skipping unreadable line");
            }
        }
    }
    debug!(parent: ctx.span(), variables = acc.bounds().len(), "folded split");

    let mut out = vec![
        Ok(emit_meta(&MetaEntry::date_range(&config.date_range))),
        Ok(emit_meta(&MetaEntry::Factors(config.variables.clone()))),
    ];
    for (variable, bounds) in acc.into_bounds() {
        out.push(Ok(KeyValue::new(
            Bytes::from(variable),
            Bytes::from(serde_json::to_vec(&bounds)?),
        )));
    }
    Ok(Box::new(out.into_iter()))
}

pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
    _ctx: &TaskContext,
) -> Result<Bytes> {
    if key.as_ref() == META_KEY.as_bytes() {
        return reduce_meta(values);
    }
    let variable = string_from_bytes(key)?;
    let mut combined: Option<MinMax> = None;
    for value in values {
        let bounds = decode::<MinMax>(&value)?;
        match combined.as_mut() {
            Some(acc) => acc.merge(bounds),
            None => combined = Some(bounds),
        }
    }

    let mut writer = BytesMut::new();
    if let Some(bounds) = combined {
        writer.put(encode_stat(&variable, Stat::Min, bounds.min).as_bytes());
        writer.put_u8(b'\n');
        writer.put(encode_stat(&variable, Stat::Max, bounds.max).as_bytes());
        writer.put_u8(b'\n');
    }
    Ok(writer.freeze())
}
