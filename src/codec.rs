//! Text formats persisted between pipeline stages.
//!
//! Record lines look like `2015-01-02\tclose:2058.2, volume:3`. Metadata
//! lines use the key `#` and carry the dataset's date-range tag, its
//! factor list and one `Type:` line per field, so the next stage can
//! re-parse the untyped text:
//!
//! ```text
//! #	Date range: 2015-01-01 to 2016-01-01
//! #	Factors: close, crimes, temp
//! #	Type: close=double
//! ```

use std::{collections::BTreeMap, fmt, fs, str::FromStr, sync::Arc};

use anyhow::Context;
use glob::glob;
use itertools::Itertools;

use crate::{
    date::{DateKey, DateRange, META_KEY},
    error::PipelineError,
    record::{Schema, TypedRecord, ValueKind},
};

/// Separates the key from the value in every persisted line.
pub const KEY_SEPARATOR: char = '\t';

/// Separates `name:value` entries inside a record line.
pub const FIELD_SEPARATOR: &str = ", ";

const DATE_RANGE_TAG: &str = "Date range: ";
const FACTORS_TAG: &str = "Factors: ";
const TYPE_TAG: &str = "Type: ";

/// Field name to value kind, needed to re-parse text records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeRegistry(BTreeMap<String, ValueKind>);

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_schema(schema: &Schema) -> Self {
        Self(
            schema
                .fields()
                .iter()
                .map(|f| (f.name.clone(), f.kind))
                .collect(),
        )
    }

    pub fn get(&self, field: &str) -> Option<ValueKind> {
        self.0.get(field).copied()
    }

    /// Declares or overrides a field kind.
    pub fn define(&mut self, field: impl Into<String>, kind: ValueKind) {
        self.0.insert(field.into(), kind);
    }

    /// Adds `field`, failing if it is already declared with another kind.
    pub fn declare(&mut self, field: &str, kind: ValueKind) -> Result<(), PipelineError> {
        match self.0.get(field) {
            Some(existing) if *existing != kind => Err(PipelineError::Consistency {
                tag: "field type",
                expected: format!("{field}={existing}"),
                found: format!("{field}={kind}"),
            }),
            _ => {
                self.0.insert(field.to_string(), kind);
                Ok(())
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ValueKind)> {
        self.0.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// One `Type:` entry per field.
    pub fn entries(&self) -> impl Iterator<Item = MetaEntry> + '_ {
        self.iter()
            .map(|(name, kind)| MetaEntry::Type(name.to_string(), kind))
    }
}

/// One metadata line.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MetaEntry {
    DateRange(String),
    Factors(Vec<String>),
    Type(String, ValueKind),
}

impl MetaEntry {
    pub fn date_range(range: &DateRange) -> Self {
        MetaEntry::DateRange(range.to_string())
    }
}

impl fmt::Display for MetaEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaEntry::DateRange(range) => write!(f, "{DATE_RANGE_TAG}{range}"),
            MetaEntry::Factors(factors) => {
                write!(f, "{FACTORS_TAG}{}", factors.join(FIELD_SEPARATOR))
            }
            MetaEntry::Type(name, kind) => write!(f, "{TYPE_TAG}{name}={kind}"),
        }
    }
}

impl FromStr for MetaEntry {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(range) = s.strip_prefix(DATE_RANGE_TAG) {
            let range: DateRange = range.parse()?;
            Ok(MetaEntry::date_range(&range))
        } else if let Some(factors) = s.strip_prefix(FACTORS_TAG) {
            Ok(MetaEntry::Factors(
                factors
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect(),
            ))
        } else if let Some(decl) = s.strip_prefix(TYPE_TAG) {
            let (name, kind) = decl
                .split_once('=')
                .ok_or_else(|| PipelineError::parse("type line", s))?;
            Ok(MetaEntry::Type(name.trim().to_string(), kind.parse()?))
        } else {
            Err(PipelineError::parse("metadata line", s))
        }
    }
}

/// A decoded persisted line.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Meta(MetaEntry),
    Record(DateKey, TypedRecord),
}

/// Renders `name:value, name:value` for the present fields of `record`.
pub fn encode_fields(record: &TypedRecord) -> String {
    record
        .fields()
        .map(|(name, value)| format!("{}:{}", name, escape(&value.to_string())))
        .join(FIELD_SEPARATOR)
}

/// Renders a full record line, without the trailing newline.
pub fn encode_record(key: DateKey, record: &TypedRecord) -> String {
    format!("{}{}{}", key, KEY_SEPARATOR, encode_fields(record))
}

/// Renders a metadata line, without the trailing newline.
pub fn encode_meta(entry: &MetaEntry) -> String {
    format!("{}{}{}", META_KEY, KEY_SEPARATOR, entry)
}

/// Parses the value part of a record line using `registry` for kinds.
pub fn decode_fields(text: &str, registry: &TypeRegistry) -> Result<TypedRecord, PipelineError> {
    let entries = split_unescaped(text)
        .into_iter()
        .filter(|e| !e.trim().is_empty())
        .map(|entry| {
            let (name, raw) = entry
                .split_once(':')
                .ok_or_else(|| PipelineError::parse("field entry", entry.as_str()))?;
            let name = name.trim();
            let kind = registry
                .get(name)
                .ok_or_else(|| PipelineError::parse("field without a registered type", name))?;
            Ok((name.to_string(), kind.parse_value(&unescape(raw))?))
        })
        .collect::<Result<Vec<_>, PipelineError>>()?;

    let schema = Schema::from_fields(entries.iter().map(|(n, v)| (n.clone(), v.kind())));
    let mut record = TypedRecord::new(Arc::new(schema));
    for (name, value) in entries {
        record.insert(&name, value);
    }
    Ok(record)
}

/// Parses one persisted line.
pub fn decode_line(line: &str, registry: &TypeRegistry) -> Result<Line, PipelineError> {
    let (key, value) = line
        .split_once(KEY_SEPARATOR)
        .ok_or_else(|| PipelineError::parse("record line", line))?;
    match key.parse::<DateKey>()? {
        DateKey::Meta => Ok(Line::Meta(value.parse()?)),
        key => Ok(Line::Record(key, decode_fields(value, registry)?)),
    }
}

/// Whether `line` is a metadata line.
pub fn is_meta_line(line: &str) -> bool {
    line.split_once(KEY_SEPARATOR)
        .is_some_and(|(key, _)| key == META_KEY)
}

/// Everything the metadata lines of one or more datasets say.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub date_range: Option<String>,
    pub factors: Option<Vec<String>>,
    pub types: TypeRegistry,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects the metadata lines of `text`, ignoring record lines.
    pub fn from_text(text: &str) -> Result<Self, PipelineError> {
        let mut metadata = Self::new();
        for line in text.lines().filter(|l| is_meta_line(l)) {
            let (_, entry) = line
                .split_once(KEY_SEPARATOR)
                .ok_or_else(|| PipelineError::parse("metadata line", line))?;
            metadata.absorb(entry.parse()?)?;
        }
        Ok(metadata)
    }

    /// Reads the metadata lines of every file matching each of `patterns`.
    pub fn load<S: AsRef<str>>(patterns: &[S]) -> anyhow::Result<Self> {
        let mut metadata = Self::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let mut matched = false;
            for path in glob(pattern)?.flatten() {
                matched = true;
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("reading metadata from {}", path.display()))?;
                metadata.merge(Self::from_text(&text)?)?;
            }
            anyhow::ensure!(matched, "no metadata file matches `{}`", pattern);
        }
        Ok(metadata)
    }

    /// Adds one entry. Two different date ranges, factor lists or kinds
    /// for one field are a consistency error.
    pub fn absorb(&mut self, entry: MetaEntry) -> Result<(), PipelineError> {
        match entry {
            MetaEntry::DateRange(range) => match &self.date_range {
                Some(existing) if *existing != range => Err(PipelineError::Consistency {
                    tag: "date range",
                    expected: existing.clone(),
                    found: range,
                }),
                _ => {
                    self.date_range = Some(range);
                    Ok(())
                }
            },
            MetaEntry::Factors(factors) => match &self.factors {
                Some(existing) if *existing != factors => Err(PipelineError::Consistency {
                    tag: "factors",
                    expected: existing.join(FIELD_SEPARATOR),
                    found: factors.join(FIELD_SEPARATOR),
                }),
                _ => {
                    self.factors = Some(factors);
                    Ok(())
                }
            },
            MetaEntry::Type(name, kind) => self.types.declare(&name, kind),
        }
    }

    pub fn merge(&mut self, other: Metadata) -> Result<(), PipelineError> {
        for entry in other.entries() {
            self.absorb(entry)?;
        }
        Ok(())
    }

    pub fn entries(&self) -> Vec<MetaEntry> {
        let mut out = Vec::new();
        if let Some(range) = &self.date_range {
            out.push(MetaEntry::DateRange(range.clone()));
        }
        if let Some(factors) = &self.factors {
            out.push(MetaEntry::Factors(factors.clone()));
        }
        out.extend(self.types.entries());
        out
    }

    /// Fails unless the dataset was produced for `expected`.
    pub fn verify_date_range(&self, expected: &DateRange) -> Result<(), PipelineError> {
        let expected = expected.to_string();
        match &self.date_range {
            Some(found) if *found == expected => Ok(()),
            found => Err(PipelineError::Consistency {
                tag: "date range",
                expected,
                found: found.clone().unwrap_or_else(|| "<none>".to_string()),
            }),
        }
    }

    /// Fails unless the dataset's factor list names the same variables as
    /// `expected`, in any order.
    pub fn verify_factors<S: AsRef<str>>(&self, expected: &[S]) -> Result<(), PipelineError> {
        let wanted: Vec<&str> = expected.iter().map(AsRef::as_ref).sorted().collect();
        match &self.factors {
            Some(found) if found.iter().map(String::as_str).sorted().eq(wanted.iter().copied()) => {
                Ok(())
            }
            found => Err(PipelineError::Consistency {
                tag: "factors",
                expected: wanted.join(FIELD_SEPARATOR),
                found: found
                    .as_ref()
                    .map(|f| f.join(FIELD_SEPARATOR))
                    .unwrap_or_else(|| "<none>".to_string()),
            }),
        }
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Splits on commas that are not escaped; escapes stay in place.
fn split_unescaped(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
        .into_iter()
        .map(|p| p.strip_prefix(' ').map(str::to_string).unwrap_or(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use chrono::NaiveDate;

    fn weather_day() -> TypedRecord {
        let mut r = TypedRecord::empty();
        let dt = NaiveDate::from_ymd_opt(2015, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        r.insert("date", Value::Date(dt));
        r.insert("temp", Value::Double(271.15));
        r.insert("humidity", Value::Int(80));
        r.insert("weather_description", "rain, heavy\\ish".into());
        r
    }

    #[test]
    fn record_line_round_trips_through_the_registry() {
        let record = weather_day();
        let key = record.date_key().unwrap();
        let registry = TypeRegistry::from_schema(record.schema());
        let line = encode_record(key, &record);
        assert!(line.starts_with("2015-01-02\tdate:2015-01-02 00:00:00, temp:271.15"));

        match decode_line(&line, &registry).unwrap() {
            Line::Record(k, back) => {
                assert_eq!(k, key);
                assert_eq!(back, record);
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn unregistered_field_is_an_error() {
        let registry = TypeRegistry::new();
        assert!(decode_fields("close:1.0", &registry).is_err());
    }

    #[test]
    fn meta_lines_parse() {
        let text = "#\tDate range: 2015-01-01 to 2016-01-01\n\
                    #\tFactors: close, crimes\n\
                    #\tType: close=double\n\
                    #\tType: crimes=int\n\
                    2015-01-02\tclose:1\n";
        let metadata = Metadata::from_text(text).unwrap();
        assert_eq!(metadata.date_range.as_deref(), Some("2015-01-01 to 2016-01-01"));
        assert_eq!(metadata.types.get("crimes"), Some(ValueKind::Int));
        assert_eq!(metadata.entries().len(), 4);
        assert_eq!(encode_meta(&metadata.entries()[1]), "#\tFactors: close, crimes");

        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2016, 1, 1).unwrap(),
        );
        metadata.verify_date_range(&range).unwrap();
        metadata.verify_factors(&["crimes", "close"]).unwrap();
        assert!(metadata.verify_factors(&["close"]).is_err());
    }

    #[test]
    fn mismatched_range_is_a_consistency_error() {
        let metadata = Metadata::from_text("#\tDate range: 2015-01-01 to 2015-06-01\n").unwrap();
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2016, 1, 1).unwrap(),
        );
        let err = metadata.verify_date_range(&range).unwrap_err();
        assert!(matches!(err, PipelineError::Consistency { tag: "date range", .. }));
    }

    #[test]
    fn conflicting_types_are_rejected() {
        let mut metadata = Metadata::new();
        metadata.absorb(MetaEntry::Type("close".into(), ValueKind::Double)).unwrap();
        assert!(metadata.absorb(MetaEntry::Type("close".into(), ValueKind::Int)).is_err());
    }
}
