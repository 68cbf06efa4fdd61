//! Combining records that share a day.
//!
//! Two kinds of merge happen in the pipeline. Within one source, the rows
//! of a day collapse into one record (summed, averaged, or averaged with a
//! categorical weather condition). Across sources, the per-day records of
//! every source are joined into one wide record.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    context::TaskContext,
    record::{TypedRecord, Value, DATE_FIELD},
};

const COUNTERS: &str = "merge";

pub const WEATHER_ID: &str = "weather_id";
pub const WEATHER_MAIN: &str = "weather_main";
pub const WEATHER_DESCRIPTION: &str = "weather_description";

/// How the rows of one source collapse into a daily record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Field-wise sum, e.g. incident counts.
    Sum,
    /// Field-wise mean.
    Average,
    /// Field-wise mean plus the day's dominant weather condition.
    WeatherAverage,
}

/// The categorical weather reading of one observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeatherCondition {
    pub id: i64,
    pub main: String,
    pub description: String,
}

impl WeatherCondition {
    pub fn new(id: i64, main: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id,
            main: main.into(),
            description: description.into(),
        }
    }

    /// Reads the condition of `record`; `None` unless the id is present.
    pub fn from_record(record: &TypedRecord) -> Option<Self> {
        let id = record.get(WEATHER_ID).and_then(Value::as_i64)?;
        let text = |field| {
            record
                .get(field)
                .and_then(Value::as_text)
                .unwrap_or_default()
                .to_string()
        };
        Some(Self::new(id, text(WEATHER_MAIN), text(WEATHER_DESCRIPTION)))
    }

    fn write_to(self, record: &mut TypedRecord) {
        record.insert(WEATHER_ID, Value::Int(self.id));
        record.insert(WEATHER_MAIN, Value::Text(self.main));
        record.insert(WEATHER_DESCRIPTION, Value::Text(self.description));
    }
}

/// The most frequent condition. Ties go to the highest id, since higher
/// ids denote more severe weather.
pub fn dominant_condition<I>(conditions: I) -> Option<WeatherCondition>
where
    I: IntoIterator<Item = WeatherCondition>,
{
    let mut counts: HashMap<WeatherCondition, usize> = HashMap::new();
    for condition in conditions {
        *counts.entry(condition).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|(a, a_count), (b, b_count)| {
            a_count
                .cmp(b_count)
                .then(a.id.cmp(&b.id))
                .then_with(|| a.cmp(b))
        })
        .map(|(condition, _)| condition)
}

/// One source's record for a day, as shuffled to the join reducer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePart {
    pub source: String,
    pub record: TypedRecord,
}

/// Merges the records of a single day.
pub struct Merger {
    ctx: TaskContext,
}

impl Merger {
    pub fn new(ctx: &TaskContext) -> Self {
        Self { ctx: ctx.clone() }
    }

    /// Joins the records every source produced for `day`.
    ///
    /// Parts are applied in source-name order, so when two sources carry a
    /// field of the same name the value of the later source wins no matter
    /// in which order the parts arrived. Sources without a record for the
    /// day simply contribute no fields.
    pub fn join(&self, day: NaiveDate, mut parts: Vec<SourcePart>) -> Option<TypedRecord> {
        if parts.is_empty() {
            return None;
        }
        parts.sort_by(|a, b| a.source.cmp(&b.source));

        let mut joined = TypedRecord::empty();
        for part in &parts {
            for (name, value) in part.record.fields() {
                if name == DATE_FIELD {
                    continue;
                }
                if let Some(existing) = joined.get(name) {
                    if existing != value {
                        self.ctx.increment(COUNTERS, "join_conflict");
                        debug!(
                            parent: self.ctx.span(),
                            %day,
                            field = name,
                            source = %part.source,
                            "sources disagree, keeping the later source"
                        );
                    }
                }
            }
            joined.absorb(&part.record);
        }
        set_day(&mut joined, day);
        self.ctx.increment(COUNTERS, "joined_days");
        trace!(parent: self.ctx.span(), %day, sources = parts.len(), "joined");
        Some(joined)
    }

    /// Collapses the rows of one source for `day`.
    pub fn reduce_day(
        &self,
        day: NaiveDate,
        reduction: Reduction,
        records: Vec<TypedRecord>,
    ) -> Option<TypedRecord> {
        let count = records.len();
        let mut iter = records.iter();
        let mut acc = iter.next()?.copy_of();
        for record in iter {
            acc.add(record);
        }

        match reduction {
            Reduction::Sum => {}
            Reduction::Average => {
                acc.divide_scalar(count as f64);
            }
            Reduction::WeatherAverage => {
                acc.divide_scalar(count as f64);
                match dominant_condition(records.iter().filter_map(WeatherCondition::from_record)) {
                    Some(condition) => condition.write_to(&mut acc),
                    None => {
                        for field in [WEATHER_ID, WEATHER_MAIN, WEATHER_DESCRIPTION] {
                            acc.remove(field);
                        }
                    }
                }
            }
        }

        set_day(&mut acc, day);
        self.ctx.counters().add(COUNTERS, "rows_reduced", count as u64);
        Some(acc)
    }
}

fn set_day(record: &mut TypedRecord, day: NaiveDate) {
    if let Some(midnight) = day.and_hms_opt(0, 0, 0) {
        record.insert(DATE_FIELD, Value::Date(midnight));
    }
}
