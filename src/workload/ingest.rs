//! The per-source ingest stages: `stock`, `crime` and `weather`.
//!
//! Map parses the raw CSV of one source into daily-keyed records; reduce
//! collapses the rows of each day into one record.

use anyhow::Result;
use bytes::Bytes;
use tracing::debug;

use super::{day_of, decode, emit, emit_meta, reduce_meta, write_records};
use crate::{
    codec::{MetaEntry, TypeRegistry},
    date::DateKey,
    error::PipelineError,
    ingest::{CsvIngest, IngestArgs, Shape},
    merge::{Merger, Reduction},
    record::TypedRecord,
    utils::{parse_aux, string_from_bytes},
    KeyValue, MapOutput, TaskContext,
};

/// How the rows of a day are collapsed for `shape`.
pub fn reduction(shape: Shape) -> Reduction {
    match shape {
        Shape::Stock => Reduction::Average,
        Shape::Crime => Reduction::Sum,
        Shape::Weather => Reduction::WeatherAverage,
    }
}

fn map(shape: Shape, kv: KeyValue, aux: Bytes, ctx: &TaskContext) -> MapOutput {
    let args: IngestArgs = parse_aux(&aux)?;
    let config = args.validate(shape).map_err(PipelineError::Config)?;
    let ingest = CsvIngest::new(config, ctx);

    let text = string_from_bytes(kv.value)?;
    let records = ingest.parse_text(&text);
    debug!(parent: ctx.span(), source = shape.name(), records = records.len(), "parsed input");

    let mut out = vec![Ok(emit_meta(&MetaEntry::date_range(
        &ingest.config().date_range,
    )))];
    out.extend(
        TypeRegistry::from_schema(ingest.schema())
            .entries()
            .map(|entry| Ok(emit_meta(&entry))),
    );
    out.extend(records.iter().map(|(key, record)| emit(*key, record)));
    Ok(Box::new(out.into_iter()))
}

fn reduce(
    shape: Shape,
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    ctx: &TaskContext,
) -> Result<Bytes> {
    if DateKey::from_bytes(&key)?.is_meta() {
        return reduce_meta(values);
    }
    let day = day_of(&key)?;
    let records = values
        .map(|value| decode::<TypedRecord>(&value))
        .collect::<Result<Vec<_>>>()?;
    let merged = Merger::new(ctx).reduce_day(day, reduction(shape), records);
    Ok(write_records(DateKey::Day(day), merged.iter()))
}

pub fn map_stock(kv: KeyValue, aux: Bytes, ctx: &TaskContext) -> MapOutput {
    map(Shape::Stock, kv, aux, ctx)
}

pub fn reduce_stock(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
    ctx: &TaskContext,
) -> Result<Bytes> {
    reduce(Shape::Stock, key, values, ctx)
}

pub fn map_crime(kv: KeyValue, aux: Bytes, ctx: &TaskContext) -> MapOutput {
    map(Shape::Crime, kv, aux, ctx)
}

pub fn reduce_crime(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
    ctx: &TaskContext,
) -> Result<Bytes> {
    reduce(Shape::Crime, key, values, ctx)
}

pub fn map_weather(kv: KeyValue, aux: Bytes, ctx: &TaskContext) -> MapOutput {
    map(Shape::Weather, kv, aux, ctx)
}

pub fn reduce_weather(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
    ctx: &TaskContext,
) -> Result<Bytes> {
    reduce(Shape::Weather, key, values, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::serialize_args;

    fn aux() -> Bytes {
        serialize_args(&["--start", "2015-01-01", "--end", "2015-02-01", "--header"]).unwrap()
    }

    fn run_map(text: &str) -> Vec<KeyValue> {
        let kv = KeyValue::new(Bytes::from_static(b"in/crime/a.csv"), Bytes::from(text.to_string()));
        map_crime(kv, aux(), &TaskContext::detached())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn map_emits_metadata_and_daily_records() {
        let text = "ID,Case,Date\n\
                    1,A,01/02/2015 10:00:00 AM\n\
                    2,B,01/02/2015 11:30:00 PM\n\
                    3,C,03/02/2015 11:30:00 PM\n";
        let out = run_map(text);
        let meta: Vec<String> = out
            .iter()
            .filter(|kv| kv.key.as_ref() == b"#")
            .map(|kv| string_from_bytes(kv.value()).unwrap())
            .collect();
        assert!(meta.contains(&"Date range: 2015-01-01 to 2015-02-01".to_string()));
        assert!(meta.contains(&"Type: crimes=int".to_string()));

        let days: Vec<&[u8]> = out
            .iter()
            .filter(|kv| kv.key.as_ref() != b"#")
            .map(|kv| kv.key.as_ref())
            .collect();
        assert_eq!(days, vec![b"2015-01-02".as_ref(), b"2015-01-02".as_ref()]);
    }

    #[test]
    fn reduce_sums_crimes_per_day() {
        let text = "ID,Case,Date\n\
                    1,A,01/02/2015 10:00:00 AM\n\
                    2,B,01/02/2015 11:30:00 PM\n";
        let values: Vec<Bytes> = run_map(text)
            .into_iter()
            .filter(|kv| kv.key.as_ref() != b"#")
            .map(KeyValue::into_value)
            .collect();
        let out = reduce_crime(
            Bytes::from_static(b"2015-01-02"),
            Box::new(values.into_iter()),
            aux(),
            &TaskContext::detached(),
        )
        .unwrap();
        let line = string_from_bytes(out).unwrap();
        assert!(line.starts_with("2015-01-02\t"), "{line}");
        assert!(line.contains("crimes:2"), "{line}");
        assert!(line.contains("date:2015-01-02 00:00:00"), "{line}");
    }

    #[test]
    fn reduction_per_shape() {
        assert_eq!(reduction(Shape::Crime), Reduction::Sum);
        assert_eq!(reduction(Shape::Stock), Reduction::Average);
        assert_eq!(reduction(Shape::Weather), Reduction::WeatherAverage);
    }

    #[test]
    fn bad_arguments_fail_the_task() {
        let kv = KeyValue::new(Bytes::from_static(b"in/a.csv"), Bytes::new());
        let aux = serialize_args(&["--start", "2015-02-01", "--end", "2015-01-01"]).unwrap();
        assert!(map_stock(kv, aux, &TaskContext::detached()).is_err());
    }
}
