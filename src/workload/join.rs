//! The `join` stage: merges the daily records of every source into one
//! wide record per day.

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{date_range, day_of, decode, emit, emit_meta, non_empty, reduce_meta, source_name, write_records};
use crate::{
    codec::{decode_line, Line, MetaEntry, Metadata},
    date::{DateKey, DateRange},
    error::{ConfigErrors, PipelineError},
    merge::{Merger, SourcePart},
    utils::{parse_aux, string_from_bytes},
    KeyValue, MapOutput, TaskContext,
};

const COUNTERS: &str = "join";

#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
#[clap(no_binary_name = true)]
pub struct JoinArgs {
    /// First day kept (inclusive), YYYY-MM-DD
    #[clap(long)]
    pub start: Option<String>,
    /// First day dropped (exclusive), YYYY-MM-DD
    #[clap(long)]
    pub end: Option<String>,
    /// A variable of the model; recorded as the dataset's factor list
    #[clap(long = "factor")]
    pub factors: Vec<String>,
    /// Output file of an upstream stage carrying its metadata lines
    #[clap(long)]
    pub metadata: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct JoinConfig {
    pub date_range: DateRange,
    pub factors: Vec<String>,
    pub metadata: Vec<String>,
}

impl JoinArgs {
    pub fn validate(&self) -> Result<JoinConfig, ConfigErrors> {
        let mut errors = ConfigErrors::new();
        let range = date_range(self.start.as_deref(), self.end.as_deref(), &mut errors);
        non_empty("factor", &self.factors, &mut errors);
        non_empty("metadata", &self.metadata, &mut errors);
        match range {
            Some(date_range) if errors.is_empty() => Ok(JoinConfig {
                date_range,
                factors: self.factors.clone(),
                metadata: self.metadata.clone(),
            }),
            _ => Err(errors),
        }
    }
}

pub fn map(kv: KeyValue, aux: Bytes, ctx: &TaskContext) -> MapOutput {
    let config = parse_aux::<JoinArgs>(&aux)?
        .validate()
        .map_err(PipelineError::Config)?;
    let metadata = Metadata::load(&config.metadata)?;
    metadata.verify_date_range(&config.date_range)?;

    let source = source_name(&kv.key)?;
    let text = string_from_bytes(kv.value)?;

    let mut out = vec![
        Ok(emit_meta(&MetaEntry::date_range(&config.date_range))),
        Ok(emit_meta(&MetaEntry::Factors(config.factors.clone()))),
    ];
    out.extend(metadata.types.entries().map(|entry| Ok(emit_meta(&entry))));

    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        match decode_line(line, &metadata.types) {
            Ok(Line::Record(key, record)) => {
                let part = SourcePart {
                    source: source.clone(),
                    record,
                };
                out.push(emit(key, &part));
            }
            Ok(Line::Meta(_)) => {}
            Err(e) => {
                ctx.increment(COUNTERS, "malformed");
                warn!(parent: ctx.span(), %source, error = %e, "skipping unreadable line");
            }
        }
    }
    debug!(parent: ctx.span(), %source, emitted = out.len(), "mapped source");
    Ok(Box::new(out.into_iter()))
}

pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
    ctx: &TaskContext,
) -> Result<Bytes> {
    if DateKey::from_bytes(&key)?.is_meta() {
        return reduce_meta(values);
    }
    let day = day_of(&key)?;
    let parts = values
        .map(|value| decode::<SourcePart>(&value))
        .collect::<Result<Vec<_>>>()?;
    let joined = Merger::new(ctx).join(day, parts);
    Ok(write_records(DateKey::Day(day), joined.iter()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{record::TypedRecord, record::Value, utils::serialize_args};

    #[test]
    fn validation_reports_every_problem() {
        let errors = JoinArgs::try_parse_from(["--start", "2015-01-01"])
            .unwrap()
            .validate()
            .unwrap_err();
        assert_eq!(errors.messages().len(), 3, "{errors}");
    }

    #[test]
    fn reduce_joins_sources_of_a_day() {
        let part = |source: &str, field: &str, value: Value| {
            let mut record = TypedRecord::empty();
            record.insert(field, value);
            Bytes::from(
                serde_json::to_vec(&SourcePart {
                    source: source.into(),
                    record,
                })
                .unwrap(),
            )
        };
        let values = vec![
            part("weather", "temp", Value::Double(271.5)),
            part("crime", "crimes", Value::Int(4)),
        ];
        let aux = serialize_args(&["--start", "2015-01-01", "--end", "2015-02-01"]).unwrap();
        let out = reduce(
            Bytes::from_static(b"2015-01-05"),
            Box::new(values.into_iter()),
            aux,
            &TaskContext::detached(),
        )
        .unwrap();
        assert_eq!(
            string_from_bytes(out).unwrap(),
            "2015-01-05\tcrimes:4, temp:271.5, date:2015-01-05 00:00:00\n"
        );
    }
}
