use std::{fmt, sync::Arc};

use chrono::NaiveDateTime;

use super::{Schema, TypedRecord, Value, ValueKind, DATETIME_FORMAT};
use crate::date::parse_datetime;

/// A field that could not be parsed and was replaced by a default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    pub field: String,
    pub input: String,
    pub reason: &'static str,
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field `{}`: {} (`{}`)", self.field, self.reason, self.input)
    }
}

/// Builds a [`TypedRecord`] from raw text, one field at a time.
///
/// Parsing is lenient: a number that does not parse becomes zero and a
/// date that does not parse becomes the minimum date. Each substitution is
/// recorded as a [`ParseWarning`] and returned from [`RecordBuilder::build`].
#[derive(Debug)]
pub struct RecordBuilder<'a> {
    record: TypedRecord,
    date_format: &'a str,
    warnings: Vec<ParseWarning>,
}

impl<'a> RecordBuilder<'a> {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            record: TypedRecord::new(schema),
            date_format: DATETIME_FORMAT,
            warnings: Vec::new(),
        }
    }

    /// chrono format used for [`ValueKind::Date`] fields.
    pub fn date_format(mut self, format: &'a str) -> Self {
        self.date_format = format;
        self
    }

    /// Parses `raw` as the declared kind of `field`.
    pub fn text(&mut self, field: &str, raw: &str) -> &mut Self {
        let Some(kind) = self.record.schema().kind_of(field) else {
            self.warn(field, raw, "field not declared by the record shape");
            return self;
        };
        let trimmed = raw.trim();
        let value = match kind {
            ValueKind::Date => match parse_datetime(trimmed, self.date_format) {
                Some(dt) => Value::Date(dt),
                None => {
                    self.warn(field, raw, "unparseable date, using the minimum date");
                    Value::Date(NaiveDateTime::MIN)
                }
            },
            ValueKind::Int => match parse_int(trimmed) {
                Some(v) => Value::Int(v),
                None => {
                    self.warn(field, raw, "unparseable integer, using 0");
                    Value::Int(0)
                }
            },
            ValueKind::Double => match trimmed.parse::<f64>() {
                Ok(v) => Value::Double(v),
                Err(_) => {
                    self.warn(field, raw, "unparseable number, using 0.0");
                    Value::Double(0.0)
                }
            },
            ValueKind::Text => Value::Text(trimmed.to_string()),
        };
        // Kind was taken from the schema, so this cannot be rejected.
        let _ = self.record.set(field, value);
        self
    }

    /// Sets an already typed value.
    pub fn value(&mut self, field: &str, value: Value) -> &mut Self {
        let shown = value.to_string();
        if !self.record.set(field, value) {
            self.warn(field, &shown, "field not declared with this kind");
        }
        self
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn build(self) -> (TypedRecord, Vec<ParseWarning>) {
        (self.record, self.warnings)
    }

    fn warn(&mut self, field: &str, input: &str, reason: &'static str) {
        self.warnings.push(ParseWarning {
            field: field.to_string(),
            input: input.to_string(),
            reason,
        });
    }
}

/// Integers sometimes arrive as `12.0`; accept any finite number and
/// truncate it.
fn parse_int(s: &str) -> Option<i64> {
    s.parse::<i64>().ok().or_else(|| {
        s.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| v.trunc() as i64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::from_fields([
            ("date", ValueKind::Date),
            ("close", ValueKind::Double),
            ("volume", ValueKind::Int),
            ("main", ValueKind::Text),
        ]))
    }

    #[test]
    fn parses_each_kind() {
        let mut builder = RecordBuilder::new(schema()).date_format("%Y-%m-%d");
        builder
            .text("date", "2015-01-02")
            .text("close", " 2058.2 ")
            .text("volume", "3.0")
            .text("main", "Rain");
        let (record, warnings) = builder.build();
        assert!(warnings.is_empty());
        assert_eq!(record.get_f64("close"), Some(2058.2));
        assert_eq!(record.get("volume"), Some(&Value::Int(3)));
        assert_eq!(record.get("main"), Some(&Value::Text("Rain".into())));
        assert_eq!(record.date_key().unwrap().to_string(), "2015-01-02");
    }

    #[test]
    fn failures_degrade_to_defaults_with_warnings() {
        let mut builder = RecordBuilder::new(schema()).date_format("%Y-%m-%d");
        builder
            .text("date", "not a date")
            .text("close", "n/a")
            .text("volume", "")
            .text("open", "1.0");
        assert!(builder.has_warnings());
        let (record, warnings) = builder.build();
        assert_eq!(warnings.len(), 4);
        assert_eq!(record.get("close"), Some(&Value::Double(0.0)));
        assert_eq!(record.get("volume"), Some(&Value::Int(0)));
        assert_eq!(record.get("date"), Some(&Value::Date(NaiveDateTime::MIN)));
        assert!(warnings[3].to_string().contains("open"));
    }

    #[test]
    fn typed_values_must_match_the_shape() {
        let mut builder = RecordBuilder::new(schema());
        builder.value("volume", Value::Int(1)).value("close", Value::Int(1));
        let (record, warnings) = builder.build();
        assert_eq!(record.get("volume"), Some(&Value::Int(1)));
        assert!(record.get("close").is_none());
        assert_eq!(warnings.len(), 1);
    }
}
