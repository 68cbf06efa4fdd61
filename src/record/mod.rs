//! Typed, self-describing records.
//!
//! A [`TypedRecord`] is an ordered set of named [`Value`]s whose names and
//! kinds come from a shared [`Schema`]. Every pipeline stage reads, merges
//! and rewrites data through this type.

use std::{cmp::Ordering, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::date::DateKey;

mod builder;
mod schema;
mod value;

pub use builder::{ParseWarning, RecordBuilder};
pub use schema::{FieldDef, Schema};
pub use value::{Value, ValueKind, DATETIME_FORMAT};

use value::Op;

/// Name of the date field every source shape carries.
pub const DATE_FIELD: &str = "date";

/// A record whose fields are described by a [`Schema`].
///
/// Schemas are shared between records of the same shape and copied only
/// when a record redefines a field, so cloning a record never lets two
/// records observe each other's changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RecordRepr", into = "RecordRepr")]
pub struct TypedRecord {
    schema: Arc<Schema>,
    values: Vec<Option<Value>>,
}

impl TypedRecord {
    /// An empty record of the given shape.
    pub fn new(schema: Arc<Schema>) -> Self {
        let values = vec![None; schema.len()];
        Self { schema, values }
    }

    /// An empty record with no fields declared.
    pub fn empty() -> Self {
        Self::new(Arc::new(Schema::new()))
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.schema
            .index_of(field)
            .and_then(|idx| self.values[idx].as_ref())
    }

    /// The numeric value of `field`, `None` if absent or not numeric.
    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    /// Sets `field` if the schema declares it with the kind of `value`.
    ///
    /// Returns `false`, leaving the record unchanged, otherwise.
    #[must_use]
    pub fn set(&mut self, field: &str, value: Value) -> bool {
        match self.schema.index_of(field) {
            Some(idx) if self.schema.fields()[idx].kind == value.kind() => {
                self.values[idx] = Some(value);
                true
            }
            _ => false,
        }
    }

    /// Sets `field`, declaring it or changing its declared kind as needed.
    pub fn insert(&mut self, field: &str, value: Value) {
        let idx = match self.schema.index_of(field) {
            Some(idx) if self.schema.fields()[idx].kind == value.kind() => idx,
            _ => {
                let idx = Arc::make_mut(&mut self.schema).define(field, value.kind());
                if idx >= self.values.len() {
                    self.values.resize(idx + 1, None);
                }
                idx
            }
        };
        self.values[idx] = Some(value);
    }

    /// Clears `field`, keeping it declared.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.schema
            .index_of(field)
            .and_then(|idx| self.values[idx].take())
    }

    /// Present fields in schema order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.schema
            .fields()
            .iter()
            .zip(&self.values)
            .filter_map(|(def, value)| value.as_ref().map(|v| (def.name.as_str(), v)))
    }

    /// Number of present fields.
    pub fn len(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A fully independent copy.
    pub fn copy_of(&self) -> Self {
        self.clone()
    }

    /// The day of the `date` field.
    pub fn date_key(&self) -> Option<DateKey> {
        self.get(DATE_FIELD)
            .and_then(Value::as_datetime)
            .map(|dt| DateKey::Day(dt.date()))
    }

    pub fn add(&mut self, other: &TypedRecord) -> &mut Self {
        self.apply_record(other, Op::Add)
    }

    pub fn subtract(&mut self, other: &TypedRecord) -> &mut Self {
        self.apply_record(other, Op::Sub)
    }

    pub fn multiply(&mut self, other: &TypedRecord) -> &mut Self {
        self.apply_record(other, Op::Mul)
    }

    pub fn divide(&mut self, other: &TypedRecord) -> &mut Self {
        self.apply_record(other, Op::Div)
    }

    pub fn add_scalar(&mut self, scalar: f64) -> &mut Self {
        self.apply_scalar(scalar, Op::Add)
    }

    pub fn subtract_scalar(&mut self, scalar: f64) -> &mut Self {
        self.apply_scalar(scalar, Op::Sub)
    }

    pub fn multiply_scalar(&mut self, scalar: f64) -> &mut Self {
        self.apply_scalar(scalar, Op::Mul)
    }

    pub fn divide_scalar(&mut self, scalar: f64) -> &mut Self {
        self.apply_scalar(scalar, Op::Div)
    }

    /// Copies every present field of `other` into this record. Fields both
    /// records carry take the value of `other`.
    pub fn absorb(&mut self, other: &TypedRecord) -> &mut Self {
        for (name, value) in other.fields() {
            self.insert(name, value.clone());
        }
        self
    }

    /// Orders two records by a designated key field. Records missing the
    /// field sort first.
    pub fn cmp_by(&self, other: &TypedRecord, field: &str) -> Ordering {
        match (self.get(field), other.get(field)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => compare_values(a, b),
        }
    }

    fn apply_record(&mut self, other: &TypedRecord, op: Op) -> &mut Self {
        for (idx, def) in self.schema.fields().iter().enumerate() {
            let Some(lhs) = &self.values[idx] else {
                continue;
            };
            let Some(rhs) = other.get(&def.name) else {
                continue;
            };
            let combined = match (lhs, rhs) {
                (Value::Int(_), Value::Int(r)) => lhs.combine_int(*r, op),
                _ => rhs.as_f64().and_then(|r| lhs.combine(r, op)),
            };
            if let Some(value) = combined {
                self.values[idx] = Some(value);
            }
        }
        self
    }

    fn apply_scalar(&mut self, scalar: f64, op: Op) -> &mut Self {
        for slot in self.values.iter_mut() {
            if let Some(value) = slot {
                if let Some(combined) = value.combine(scalar, op) {
                    *value = combined;
                }
            }
        }
        self
    }
}

impl PartialEq for TypedRecord {
    /// Records are equal when they carry the same fields, in the same order,
    /// with equal values. Declared-but-absent fields do not count.
    fn eq(&self, other: &Self) -> bool {
        self.fields().eq(other.fields())
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Date(a), Value::Date(b)) => a.cmp(b),
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Text(a), Value::Text(b)) => a.cmp(b),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            _ => a.kind().cmp(&b.kind()),
        },
    }
}

#[derive(Serialize, Deserialize)]
struct RecordRepr(Vec<(String, Value)>);

impl From<RecordRepr> for TypedRecord {
    fn from(repr: RecordRepr) -> Self {
        let mut record = TypedRecord::new(Arc::new(Schema::from_fields(
            repr.0.iter().map(|(name, value)| (name.clone(), value.kind())),
        )));
        for (name, value) in repr.0 {
            record.insert(&name, value);
        }
        record
    }
}

impl From<TypedRecord> for RecordRepr {
    fn from(record: TypedRecord) -> Self {
        RecordRepr(
            record
                .fields()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn stock_schema() -> Arc<Schema> {
        Arc::new(Schema::from_fields([
            ("date", ValueKind::Date),
            ("close", ValueKind::Double),
            ("volume", ValueKind::Int),
            ("symbol", ValueKind::Text),
        ]))
    }

    fn stock(close: f64, volume: i64) -> TypedRecord {
        let mut r = TypedRecord::new(stock_schema());
        let dt = NaiveDate::from_ymd_opt(2015, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert!(r.set("date", Value::Date(dt)));
        assert!(r.set("close", Value::Double(close)));
        assert!(r.set("volume", Value::Int(volume)));
        assert!(r.set("symbol", "SPX".into()));
        r
    }

    #[test]
    fn unknown_fields_are_absent() {
        let r = stock(1.0, 2);
        assert!(r.get("open").is_none());
        assert!(r.get_f64("symbol").is_none());
        assert_eq!(r.get_f64("volume"), Some(2.0));
    }

    #[test]
    fn set_rejects_unknown_field_and_wrong_kind() {
        let mut r = stock(1.0, 2);
        assert!(!r.set("open", Value::Double(1.0)));
        assert!(!r.set("close", Value::Int(3)));
        assert_eq!(r.get("close"), Some(&Value::Double(1.0)));
    }

    #[test]
    fn copy_is_independent() {
        let original = stock(10.0, 100);
        let mut copy = original.copy_of();
        copy.add(&stock(1.0, 1)).insert("extra", Value::Int(1));

        assert_eq!(original.get("close"), Some(&Value::Double(10.0)));
        assert_eq!(original.get("volume"), Some(&Value::Int(100)));
        assert!(original.get("extra").is_none());
        assert!(original.schema().index_of("extra").is_none());
        assert_eq!(copy.get("close"), Some(&Value::Double(11.0)));
    }

    #[test]
    fn record_arithmetic_touches_numeric_fields_only() {
        let mut r = stock(10.0, 100);
        r.add(&stock(2.0, 50));
        assert_eq!(r.get("close"), Some(&Value::Double(12.0)));
        assert_eq!(r.get("volume"), Some(&Value::Int(150)));
        assert_eq!(r.get("symbol"), Some(&Value::Text("SPX".into())));

        r.subtract(&stock(2.0, 50)).multiply(&stock(3.0, 2));
        assert_eq!(r.get("close"), Some(&Value::Double(30.0)));
        assert_eq!(r.get("volume"), Some(&Value::Int(200)));

        r.divide(&stock(3.0, 0));
        assert_eq!(r.get("close"), Some(&Value::Double(10.0)));
        assert_eq!(r.get("volume"), Some(&Value::Int(200)));
    }

    #[test]
    fn scalar_arithmetic_keeps_kinds() {
        let mut r = stock(9.0, 9);
        r.divide_scalar(2.0);
        assert_eq!(r.get("close"), Some(&Value::Double(4.5)));
        assert_eq!(r.get("volume"), Some(&Value::Int(4)));
        r.add_scalar(1.0).multiply_scalar(2.0).subtract_scalar(1.0);
        assert_eq!(r.get("close"), Some(&Value::Double(10.0)));
        assert_eq!(r.get("volume"), Some(&Value::Int(9)));
    }

    #[test]
    fn arithmetic_ignores_fields_missing_from_other() {
        let mut r = stock(1.0, 1);
        let mut other = TypedRecord::empty();
        other.insert("close", Value::Double(4.0));
        r.add(&other);
        assert_eq!(r.get("close"), Some(&Value::Double(5.0)));
        assert_eq!(r.get("volume"), Some(&Value::Int(1)));
    }

    #[test]
    fn insert_redefines_kind() {
        let mut r = stock(1.0, 7);
        r.insert("volume", Value::Double(0.5));
        assert_eq!(r.schema().kind_of("volume"), Some(ValueKind::Double));
        assert_eq!(r.get("volume"), Some(&Value::Double(0.5)));
    }

    #[test]
    fn absorb_is_last_write_wins() {
        let mut a = stock(1.0, 1);
        let mut b = TypedRecord::empty();
        b.insert("close", Value::Double(2.0));
        b.insert("crimes", Value::Int(12));
        a.absorb(&b);
        assert_eq!(a.get("close"), Some(&Value::Double(2.0)));
        assert_eq!(a.get("crimes"), Some(&Value::Int(12)));
        assert_eq!(a.get("volume"), Some(&Value::Int(1)));
    }

    #[test]
    fn ordering_by_key_field() {
        let a = stock(1.0, 5);
        let b = stock(2.0, 3);
        assert_eq!(a.cmp_by(&b, "close"), Ordering::Less);
        assert_eq!(a.cmp_by(&b, "volume"), Ordering::Greater);
        assert_eq!(a.cmp_by(&b, "date"), Ordering::Equal);
        assert_eq!(TypedRecord::empty().cmp_by(&a, "close"), Ordering::Less);
    }

    #[test]
    fn serde_keeps_fields_and_kinds() {
        let r = stock(1.25, 3);
        let json = serde_json::to_string(&r).unwrap();
        let back: TypedRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
        assert_eq!(back.schema().kind_of("volume"), Some(ValueKind::Int));
    }
}
