//! The `normalize` stage: rescales the joined dataset with the bounds the
//! `stats` stage produced.

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{day_of, decode, emit, emit_meta, reduce_meta, stats::VariableArgs, write_records};
use crate::{
    codec::{decode_line, Line, MetaEntry, Metadata},
    date::DateKey,
    error::{ConfigErrors, PipelineError},
    normalize::Normalizer,
    record::TypedRecord,
    stats::StatsTable,
    utils::{parse_aux, string_from_bytes},
    KeyValue, MapOutput, TaskContext,
};

const COUNTERS: &str = "normalize";

#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
#[clap(no_binary_name = true)]
pub struct NormalizeArgs {
    #[clap(flatten)]
    #[serde(flatten)]
    pub dataset: VariableArgs,
    /// Glob matching the output files of the stats stage
    #[clap(long)]
    pub stats: Option<String>,
}

pub fn map(kv: KeyValue, aux: Bytes, ctx: &TaskContext) -> MapOutput {
    let args = parse_aux::<NormalizeArgs>(&aux)?;
    let mut errors = ConfigErrors::new();
    let config = args.dataset.check(&mut errors);
    if args.stats.is_none() {
        errors.push("missing --stats");
    }
    let (Some(config), Some(stats), true) = (config, args.stats.as_deref(), errors.is_empty()) else {
        return Err(PipelineError::Config(errors).into());
    };

    let metadata = config.verified_metadata()?;
    config.verify(&Metadata::load(&[stats])?)?;
    let normalizer = Normalizer::new(&config.variables, StatsTable::load(stats)?, ctx);

    let mut out = vec![
        Ok(emit_meta(&MetaEntry::date_range(&config.date_range))),
        Ok(emit_meta(&MetaEntry::Factors(config.variables.clone()))),
    ];
    out.extend(
        normalizer
            .output_types(&metadata.types)
            .entries()
            .map(|entry| Ok(emit_meta(&entry))),
    );

    let text = string_from_bytes(kv.value)?;
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        match decode_line(line, &metadata.types) {
            Ok(Line::Record(key, record)) => out.push(emit(key, &normalizer.normalize(&record)?)),
            Ok(Line::Meta(_)) => {}
            Err(e) => {
                ctx.increment(COUNTERS, "malformed");
                warn!(parent: ctx.span(), error = %e, "skipping unreadable line");
            }
        }
    }
    Ok(Box::new(out.into_iter()))
}

pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
    _ctx: &TaskContext,
) -> Result<Bytes> {
    if DateKey::from_bytes(&key)?.is_meta() {
        return reduce_meta(values);
    }
    let day = day_of(&key)?;
    let records = values
        .map(|value| decode::<TypedRecord>(&value))
        .collect::<Result<Vec<_>>>()?;
    Ok(write_records(DateKey::Day(day), &records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::serialize_args;

    #[test]
    fn missing_stats_is_a_configuration_error() {
        let aux = serialize_args(&[
            "--start",
            "2015-01-01",
            "--end",
            "2015-02-01",
            "--variable",
            "close",
            "--metadata",
            "nowhere/mr-out-0",
        ])
        .unwrap();
        let kv = KeyValue::new(Bytes::from_static(b"join/mr-out-0"), Bytes::new());
        let err = map(kv, aux, &TaskContext::detached()).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Config(_))
        ));
    }

    #[test]
    fn flattened_arguments_parse() {
        let args = NormalizeArgs::try_parse_from([
            "--variable",
            "close",
            "--variable",
            "temp",
            "--stats",
            "stats/mr-out-*",
        ])
        .unwrap();
        assert_eq!(args.dataset.variables, vec!["close", "temp"]);
        assert_eq!(args.stats.as_deref(), Some("stats/mr-out-*"));
    }
}
