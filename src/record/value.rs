use std::{fmt, str::FromStr};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Text form of [`Value::Date`] in record lines.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The kind of a field, as declared by a schema or a type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Date,
    Int,
    Double,
    Text,
}

impl ValueKind {
    #[inline]
    pub fn is_numeric(self) -> bool {
        matches!(self, ValueKind::Int | ValueKind::Double)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Date => "date",
            ValueKind::Int => "int",
            ValueKind::Double => "double",
            ValueKind::Text => "text",
        }
    }

    /// Parses `text` strictly as a value of this kind.
    pub fn parse_value(self, text: &str) -> Result<Value, PipelineError> {
        let trimmed = text.trim();
        match self {
            ValueKind::Date => NaiveDateTime::parse_from_str(trimmed, DATETIME_FORMAT)
                .map(Value::Date)
                .map_err(|_| PipelineError::parse("date value", text)),
            ValueKind::Int => trimmed
                .parse()
                .map(Value::Int)
                .map_err(|_| PipelineError::parse("int value", text)),
            ValueKind::Double => trimmed
                .parse()
                .map(Value::Double)
                .map_err(|_| PipelineError::parse("double value", text)),
            ValueKind::Text => Ok(Value::Text(text.to_string())),
        }
    }

    /// The value a failed lenient parse degrades to.
    pub fn zero(self) -> Value {
        match self {
            ValueKind::Date => Value::Date(NaiveDateTime::MIN),
            ValueKind::Int => Value::Int(0),
            ValueKind::Double => Value::Double(0.0),
            ValueKind::Text => Value::Text(String::new()),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "date" => Ok(ValueKind::Date),
            "int" => Ok(ValueKind::Int),
            "double" => Ok(ValueKind::Double),
            "text" => Ok(ValueKind::Text),
            _ => Err(PipelineError::parse("value kind", s)),
        }
    }
}

/// A single typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Date(NaiveDateTime),
    Int(i64),
    Double(f64),
    Text(String),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Date(_) => ValueKind::Date,
            Value::Int(_) => ValueKind::Int,
            Value::Double(_) => ValueKind::Double,
            Value::Text(_) => ValueKind::Text,
        }
    }

    /// Numeric view of the value, `None` for dates and text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Date(dt) => Some(*dt),
            _ => None,
        }
    }

    /// Combines two numeric values, keeping the kind of `self`.
    ///
    /// `Int` results are truncated toward zero. Integer division by zero and
    /// non-numeric operands return `None`.
    pub(crate) fn combine(&self, rhs: f64, op: Op) -> Option<Value> {
        match self {
            Value::Double(v) => Some(Value::Double(op.apply(*v, rhs))),
            Value::Int(v) => {
                if op == Op::Div && rhs == 0.0 {
                    return None;
                }
                let out = op.apply(*v as f64, rhs);
                out.is_finite().then(|| Value::Int(out.trunc() as i64))
            }
            _ => None,
        }
    }

    /// Exact integer arithmetic when both sides are `Int`.
    pub(crate) fn combine_int(&self, rhs: i64, op: Op) -> Option<Value> {
        let Value::Int(v) = self else {
            return None;
        };
        let out = match op {
            Op::Add => v.checked_add(rhs),
            Op::Sub => v.checked_sub(rhs),
            Op::Mul => v.checked_mul(rhs),
            Op::Div => v.checked_div(rhs),
        };
        out.map(Value::Int)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Date(dt) => write!(f, "{}", dt.format(DATETIME_FORMAT)),
            Value::Int(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Date(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Arithmetic applied by the record operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

impl Op {
    #[inline]
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Op::Add => a + b,
            Op::Sub => a - b,
            Op::Mul => a * b,
            Op::Div => a / b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_then_parse_keeps_the_value() {
        let values = [
            Value::Int(-42),
            Value::Double(0.1 + 0.2),
            Value::Double(1e-300),
            Value::Text("light rain".into()),
            Value::Date(
                NaiveDateTime::parse_from_str("2015-06-01 13:00:00", DATETIME_FORMAT).unwrap(),
            ),
        ];
        for value in values {
            let text = value.to_string();
            assert_eq!(value.kind().parse_value(&text).unwrap(), value);
        }
    }

    #[test]
    fn int_arithmetic_truncates_and_guards_zero() {
        assert_eq!(Value::Int(7).combine(2.0, Op::Div), Some(Value::Int(3)));
        assert_eq!(Value::Int(-7).combine(2.0, Op::Div), Some(Value::Int(-3)));
        assert_eq!(Value::Int(7).combine(0.0, Op::Div), None);
        assert_eq!(Value::Int(7).combine_int(0, Op::Div), None);
        assert_eq!(Value::Int(7).combine_int(5, Op::Add), Some(Value::Int(12)));
        assert_eq!(Value::Text("x".into()).combine(1.0, Op::Add), None);
    }

    #[test]
    fn kinds_parse_from_registry_text() {
        assert_eq!("double".parse::<ValueKind>().unwrap(), ValueKind::Double);
        assert_eq!("INT".parse::<ValueKind>().unwrap(), ValueKind::Int);
        assert!("float".parse::<ValueKind>().is_err());
    }
}
