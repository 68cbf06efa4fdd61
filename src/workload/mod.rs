//! Converts pipeline stage names to actual application code.
//!
//! # Example
//!
//! To get the join stage:
//! ```
//! # use anyhow::Result;
//! use mrpipeline::workload;
//! # fn main() -> Result<()> {
//! let join = workload::named("join")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use anyhow::{bail, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    codec::{encode_meta, encode_record, MetaEntry, Metadata},
    date::{DateKey, DateRange},
    error::ConfigErrors,
    record::TypedRecord,
    utils::string_from_bytes,
    KeyValue, Workload,
};

pub mod ingest;
pub mod join;
pub mod matrix_mult;
pub mod normalize;
pub mod stats;

/// Gets the [`Workload`] named `name`.
///
/// Returns [`None`] if no application with the given name was found.
pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "stock" => Some(Workload {
            map_fn: ingest::map_stock,
            reduce_fn: ingest::reduce_stock,
        }),
        "crime" => Some(Workload {
            map_fn: ingest::map_crime,
            reduce_fn: ingest::reduce_crime,
        }),
        "weather" => Some(Workload {
            map_fn: ingest::map_weather,
            reduce_fn: ingest::reduce_weather,
        }),
        "join" => Some(Workload {
            map_fn: join::map,
            reduce_fn: join::reduce,
        }),
        "stats" => Some(Workload {
            map_fn: stats::map,
            reduce_fn: stats::reduce,
        }),
        "normalize" => Some(Workload {
            map_fn: normalize::map,
            reduce_fn: normalize::reduce,
        }),
        "matrix" => Some(Workload {
            map_fn: matrix_mult::map,
            reduce_fn: matrix_mult::reduce,
        }),
        _ => None,
    }
}

/// Gets the [`Workload`] named `name`.
///
/// Returns an [`anyhow::Error`] if no application with the given name was found.
pub fn named(name: &str) -> Result<Workload> {
    match try_named(name) {
        Some(app) => Ok(app),
        None => bail!("No app named `{}` found.", name),
    }
}

/// A keyed intermediate value, serialized as JSON.
fn emit<T: Serialize>(key: DateKey, value: &T) -> Result<KeyValue> {
    Ok(KeyValue::new(key.to_bytes(), Bytes::from(serde_json::to_vec(value)?)))
}

/// A metadata entry, routed to the `Meta` key.
fn emit_meta(entry: &MetaEntry) -> KeyValue {
    KeyValue::new(DateKey::Meta.to_bytes(), Bytes::from(entry.to_string()))
}

fn decode<T: DeserializeOwned>(value: &Bytes) -> Result<T> {
    Ok(serde_json::from_slice(value)?)
}

/// Reduces the metadata entries every map task emitted.
///
/// Equal entries collapse into one line; contradicting entries (two date
/// ranges, or two kinds for one field) fail the task.
fn reduce_meta(values: Box<dyn Iterator<Item = Bytes> + '_>) -> Result<Bytes> {
    let mut metadata = Metadata::new();
    for value in values {
        let entry: MetaEntry = string_from_bytes(value)?.parse()?;
        metadata.absorb(entry)?;
    }
    let mut writer = BytesMut::new();
    for entry in metadata.entries() {
        writer.put(encode_meta(&entry).as_bytes());
        writer.put_u8(b'\n');
    }
    Ok(writer.freeze())
}

/// Writes one record line per record.
fn write_records<'a, I>(key: DateKey, records: I) -> Bytes
where
    I: IntoIterator<Item = &'a TypedRecord>,
{
    let mut writer = BytesMut::new();
    for record in records {
        writer.put(encode_record(key, record).as_bytes());
        writer.put_u8(b'\n');
    }
    writer.freeze()
}

/// The day a data key stands for.
fn day_of(key: &Bytes) -> Result<chrono::NaiveDate> {
    match DateKey::from_bytes(key)?.day() {
        Some(day) => Ok(day),
        None => bail!("expected a day key, got the metadata key"),
    }
}

/// Name of the dataset an input file belongs to: its parent directory.
fn source_name(path: &Bytes) -> Result<String> {
    let path = string_from_bytes(path.clone())?;
    let source = Path::new(&path)
        .parent()
        .and_then(Path::file_name)
        .and_then(|name| name.to_str());
    match source {
        Some(source) => Ok(source.to_string()),
        None => bail!("cannot tell the source of input file `{}`", path),
    }
}

/// Shared validation of the `--start`/`--end` pair.
fn date_range(
    start: Option<&str>,
    end: Option<&str>,
    errors: &mut ConfigErrors,
) -> Option<DateRange> {
    DateRange::parse(start, end)
        .map_err(|problems| problems.into_iter().for_each(|p| errors.push(p)))
        .ok()
}

/// Shared validation of a non-empty repeated argument.
fn non_empty(name: &str, values: &[String], errors: &mut ConfigErrors) {
    if values.iter().all(|v| v.trim().is_empty()) {
        errors.push(format!("at least one --{name} is required"));
    }
}
