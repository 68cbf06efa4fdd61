//! CSV ingestion: one delimited line in, one typed record (or a skip) out.

use std::{collections::BTreeMap, sync::Arc};

use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    context::TaskContext,
    date::{DateKey, DateRange},
    error::ConfigErrors,
    record::{RecordBuilder, Schema, TypedRecord, Value, ValueKind, DATE_FIELD},
};

const COUNTERS: &str = "ingest";

/// The source layouts the pipeline knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Stock,
    Crime,
    Weather,
}

/// A field of a source shape and the CSV column it is read from by default.
/// Fields without a column are filled in by the shape itself.
struct ShapeField {
    name: &'static str,
    kind: ValueKind,
    column: Option<usize>,
}

const fn col(name: &'static str, kind: ValueKind, column: usize) -> ShapeField {
    ShapeField {
        name,
        kind,
        column: Some(column),
    }
}

// Date,Open,High,Low,Close,Adj Close,Volume
const STOCK_FIELDS: &[ShapeField] = &[
    col(DATE_FIELD, ValueKind::Date, 0),
    col("open", ValueKind::Double, 1),
    col("high", ValueKind::Double, 2),
    col("low", ValueKind::Double, 3),
    col("close", ValueKind::Double, 4),
    col("adj_close", ValueKind::Double, 5),
    col("volume", ValueKind::Int, 6),
];

// One incident per row; the day's count is the number of rows.
const CRIME_FIELDS: &[ShapeField] = &[
    col(DATE_FIELD, ValueKind::Date, 2),
    ShapeField {
        name: "crimes",
        kind: ValueKind::Int,
        column: None,
    },
];

// Hourly observations.
const WEATHER_FIELDS: &[ShapeField] = &[
    col(DATE_FIELD, ValueKind::Date, 0),
    col("temp", ValueKind::Double, 1),
    col("temp_min", ValueKind::Double, 2),
    col("temp_max", ValueKind::Double, 3),
    col("pressure", ValueKind::Int, 4),
    col("humidity", ValueKind::Int, 5),
    col("wind_speed", ValueKind::Double, 6),
    col("wind_deg", ValueKind::Int, 7),
    col("rain", ValueKind::Double, 8),
    col("clouds", ValueKind::Int, 9),
    col("weather_id", ValueKind::Int, 10),
    col("weather_main", ValueKind::Text, 11),
    col("weather_description", ValueKind::Text, 12),
];

impl Shape {
    fn fields(self) -> &'static [ShapeField] {
        match self {
            Shape::Stock => STOCK_FIELDS,
            Shape::Crime => CRIME_FIELDS,
            Shape::Weather => WEATHER_FIELDS,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Shape::Stock => "stock",
            Shape::Crime => "crime",
            Shape::Weather => "weather",
        }
    }

    pub fn schema(self) -> Schema {
        Schema::from_fields(self.fields().iter().map(|f| (f.name, f.kind)))
    }

    /// Column index of every field that is read from the CSV.
    pub fn default_columns(self) -> BTreeMap<String, usize> {
        self.fields()
            .iter()
            .filter_map(|f| f.column.map(|c| (f.name.to_string(), c)))
            .collect()
    }

    pub fn default_date_format(self) -> &'static str {
        match self {
            Shape::Stock => "%Y-%m-%d",
            Shape::Crime => "%m/%d/%Y %I:%M:%S %p",
            Shape::Weather => "%Y-%m-%d %H:%M:%S %z UTC",
        }
    }

    fn constants(self) -> &'static [(&'static str, i64)] {
        match self {
            Shape::Crime => &[("crimes", 1)],
            _ => &[],
        }
    }
}

/// Command-line style arguments of the ingest workloads.
#[derive(Parser, Debug, Clone, Default, Serialize, Deserialize)]
#[clap(no_binary_name = true)]
pub struct IngestArgs {
    /// First day kept (inclusive), YYYY-MM-DD
    #[clap(long)]
    pub start: Option<String>,
    /// First day dropped (exclusive), YYYY-MM-DD
    #[clap(long)]
    pub end: Option<String>,
    /// Column separator, a single character or `tab`
    #[clap(long, default_value = ",")]
    pub separator: String,
    /// Skip the first line of every input file
    #[clap(long)]
    pub header: bool,
    /// Lines starting with this prefix are skipped
    #[clap(long)]
    pub comment_prefix: Option<String>,
    /// chrono format of the date column
    #[clap(long)]
    pub date_format: Option<String>,
    /// Override a column index, as NAME=INDEX
    #[clap(long = "column", value_name = "NAME=INDEX")]
    pub columns: Vec<String>,
}

impl IngestArgs {
    /// Checks the arguments against `shape`, collecting every problem.
    pub fn validate(&self, shape: Shape) -> Result<IngestConfig, ConfigErrors> {
        let mut errors = ConfigErrors::new();

        let date_range = DateRange::parse(self.start.as_deref(), self.end.as_deref())
            .map_err(|problems| problems.into_iter().for_each(|p| errors.push(p)))
            .ok();

        let separator = match self.separator.as_str() {
            "tab" | "\\t" | "\t" => Some(b'\t'),
            s if s.len() == 1 => Some(s.as_bytes()[0]),
            s => {
                errors.push(format!("separator must be a single character, got `{s}`"));
                None
            }
        };

        let schema = shape.schema();
        let mut columns = shape.default_columns();
        for spec in &self.columns {
            let Some((name, index)) = spec.split_once('=') else {
                errors.push(format!("column mapping `{spec}` is not NAME=INDEX"));
                continue;
            };
            let name = name.trim();
            match index.trim().parse::<usize>() {
                Ok(_) if schema.index_of(name).is_none() => {
                    errors.push(format!("{} records have no field `{name}`", shape.name()))
                }
                Ok(index) => {
                    columns.insert(name.to_string(), index);
                }
                Err(_) => errors.push(format!("column index `{index}` for `{name}` is not a number")),
            }
        }
        if !columns.contains_key(DATE_FIELD) {
            errors.push(format!("no column is mapped to `{DATE_FIELD}`"));
        }

        let comment_prefix = self.comment_prefix.clone().filter(|p| !p.is_empty());

        match (date_range, separator) {
            (Some(date_range), Some(separator)) if errors.is_empty() => Ok(IngestConfig {
                shape,
                separator,
                has_header: self.header,
                comment_prefix,
                date_format: self
                    .date_format
                    .clone()
                    .unwrap_or_else(|| shape.default_date_format().to_string()),
                columns,
                date_range,
            }),
            _ => Err(errors),
        }
    }
}

/// Validated ingest settings.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub shape: Shape,
    pub separator: u8,
    pub has_header: bool,
    pub comment_prefix: Option<String>,
    pub date_format: String,
    pub columns: BTreeMap<String, usize>,
    pub date_range: DateRange,
}

impl IngestConfig {
    /// A line needs at least this many columns to be parsed.
    pub fn required_columns(&self) -> usize {
        self.columns.values().max().map_or(0, |max| max + 1)
    }
}

/// Why a line produced no record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    Blank,
    Header,
    Comment,
    Malformed { found: usize, required: usize },
    OutOfRange(NaiveDate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Record(DateKey, TypedRecord),
    Skipped(Skip),
}

/// Parses source lines into records of one [`Shape`].
pub struct CsvIngest {
    config: IngestConfig,
    schema: Arc<Schema>,
    ctx: TaskContext,
}

impl CsvIngest {
    pub fn new(config: IngestConfig, ctx: &TaskContext) -> Self {
        let schema = Arc::new(config.shape.schema());
        Self {
            config,
            schema,
            ctx: ctx.clone(),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Parses every line of `text`, dropping skipped lines.
    pub fn parse_text(&self, text: &str) -> Vec<(DateKey, TypedRecord)> {
        text.lines()
            .enumerate()
            .filter_map(|(line_no, line)| match self.parse_line(line_no, line) {
                Ingested::Record(key, record) => Some((key, record)),
                Ingested::Skipped(_) => None,
            })
            .collect()
    }

    /// Parses the `line_no`-th (zero based) line of a file.
    pub fn parse_line(&self, line_no: usize, line: &str) -> Ingested {
        let skip = |reason: Skip, counter: &str| {
            self.ctx.increment(COUNTERS, counter);
            Ingested::Skipped(reason)
        };

        if line.trim().is_empty() {
            return skip(Skip::Blank, "blank");
        }
        if line_no == 0 && self.config.has_header {
            trace!(parent: self.ctx.span(), "skipping header line");
            return skip(Skip::Header, "header");
        }
        if let Some(prefix) = &self.config.comment_prefix {
            if line.starts_with(prefix.as_str()) {
                return skip(Skip::Comment, "comment");
            }
        }

        let columns = self.split(line);
        let required = self.config.required_columns();
        if columns.len() < required {
            warn!(
                parent: self.ctx.span(),
                line = line_no + 1,
                found = columns.len(),
                required,
                "skipping malformed line"
            );
            return skip(
                Skip::Malformed {
                    found: columns.len(),
                    required,
                },
                "malformed",
            );
        }

        let mut builder = RecordBuilder::new(self.schema.clone()).date_format(&self.config.date_format);
        for (name, &index) in &self.config.columns {
            builder.text(name, &columns[index]);
        }
        for &(name, value) in self.config.shape.constants() {
            builder.value(name, Value::Int(value));
        }
        let (record, warnings) = builder.build();
        for warning in &warnings {
            self.ctx.increment(COUNTERS, "parse_warning");
            warn!(parent: self.ctx.span(), line = line_no + 1, "{}", warning);
        }

        let day = record
            .get(DATE_FIELD)
            .and_then(Value::as_datetime)
            .map(|dt| dt.date())
            .unwrap_or(NaiveDate::MIN);
        if !self.config.date_range.contains(day) {
            debug!(parent: self.ctx.span(), line = line_no + 1, %day, "outside date range");
            return skip(Skip::OutOfRange(day), "filtered");
        }

        self.ctx.increment(COUNTERS, "records");
        Ingested::Record(DateKey::Day(day), record)
    }

    fn split(&self, line: &str) -> Vec<String> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.config.separator)
            .from_reader(line.as_bytes());
        let mut fields = csv::StringRecord::new();
        match reader.read_record(&mut fields) {
            Ok(true) => fields.iter().map(str::to_string).collect(),
            _ => Vec::new(),
        }
    }
}
