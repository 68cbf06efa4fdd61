//! Min-max normalization of the configured variables.

use tracing::{trace, warn};

use crate::{
    codec::TypeRegistry,
    context::TaskContext,
    error::PipelineError,
    record::{TypedRecord, Value, ValueKind},
    stats::{MinMax, StatsTable},
};

const COUNTERS: &str = "normalize";

/// Rescales `value` into `[0, 1]` for values within `bounds`.
///
/// A zero-width range cannot be rescaled, so the value comes back as is.
pub fn rescale(value: f64, bounds: MinMax) -> f64 {
    let range = bounds.range();
    if range == 0.0 {
        value
    } else {
        (value - bounds.min) / range
    }
}

/// Rewrites records so every configured variable is a double in `[0, 1]`.
pub struct Normalizer {
    variables: Vec<String>,
    stats: StatsTable,
    ctx: TaskContext,
}

impl Normalizer {
    pub fn new<S: AsRef<str>>(variables: &[S], stats: StatsTable, ctx: &TaskContext) -> Self {
        Self {
            variables: variables.iter().map(|v| v.as_ref().to_string()).collect(),
            stats,
            ctx: ctx.clone(),
        }
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// A normalized copy of `record`.
    ///
    /// Absent variables are filled with `0.0`. Every configured variable is
    /// stored as a double afterwards, whether or not it was rescaled.
    pub fn normalize(&self, record: &TypedRecord) -> Result<TypedRecord, PipelineError> {
        let mut out = record.copy_of();
        for variable in &self.variables {
            let normalized = match record.get(variable) {
                None => {
                    self.ctx.increment(COUNTERS, "zero_filled");
                    0.0
                }
                Some(value) => match value.as_f64() {
                    Some(v) => {
                        let bounds = self.stats.bounds(variable).ok_or_else(|| {
                            PipelineError::Consistency {
                                tag: "statistics",
                                expected: format!("MIN({variable}) and MAX({variable})"),
                                found: "<none>".to_string(),
                            }
                        })?;
                        if bounds.range() == 0.0 {
                            self.ctx.increment(COUNTERS, "zero_range");
                            trace!(parent: self.ctx.span(), %variable, "zero range, value kept");
                        }
                        rescale(v, bounds)
                    }
                    None => {
                        self.ctx.increment(COUNTERS, "non_numeric");
                        warn!(
                            parent: self.ctx.span(),
                            %variable,
                            kind = %value.kind(),
                            "variable is not numeric, using 0.0"
                        );
                        0.0
                    }
                },
            };
            out.insert(variable, Value::Double(normalized));
        }
        Ok(out)
    }

    /// The registry of the normalized dataset: `input` with every
    /// configured variable declared as a double.
    pub fn output_types(&self, input: &TypeRegistry) -> TypeRegistry {
        let mut types = input.clone();
        for variable in &self.variables {
            types.define(variable.clone(), ValueKind::Double);
        }
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stat;

    fn table() -> StatsTable {
        let mut table = StatsTable::new();
        table.insert("close", Stat::Min, 1000.0);
        table.insert("close", Stat::Max, 3000.0);
        table.insert("crimes", Stat::Min, 7.0);
        table.insert("crimes", Stat::Max, 7.0);
        table
    }

    fn normalizer(vars: &[&str]) -> Normalizer {
        Normalizer::new(vars, table(), &TaskContext::detached())
    }

    fn with_close(close: f64) -> TypedRecord {
        let mut r = TypedRecord::empty();
        r.insert("close", Value::Double(close));
        r
    }

    #[test]
    fn rescales_into_unit_interval() {
        let n = normalizer(&["close"]);
        assert_eq!(n.normalize(&with_close(1000.0)).unwrap().get_f64("close"), Some(0.0));
        assert_eq!(n.normalize(&with_close(3000.0)).unwrap().get_f64("close"), Some(1.0));
        for v in [1000.0, 1234.5, 2500.0, 2999.9] {
            let out = n.normalize(&with_close(v)).unwrap().get_f64("close").unwrap();
            assert!((0.0..=1.0).contains(&out), "{v} -> {out}");
        }
    }

    #[test]
    fn zero_range_passes_value_through_as_double() {
        let n = normalizer(&["crimes"]);
        let mut r = TypedRecord::empty();
        r.insert("crimes", Value::Int(7));
        let out = n.normalize(&r).unwrap();
        assert_eq!(out.get("crimes"), Some(&Value::Double(7.0)));
        assert_eq!(out.schema().kind_of("crimes"), Some(ValueKind::Double));
    }

    #[test]
    fn absent_variables_become_zero_doubles() {
        let n = normalizer(&["close", "temp"]);
        let out = n.normalize(&with_close(2000.0)).unwrap();
        assert_eq!(out.get("temp"), Some(&Value::Double(0.0)));
        assert_eq!(out.get_f64("close"), Some(0.5));
    }

    #[test]
    fn input_record_is_left_alone() {
        let n = normalizer(&["close"]);
        let input = with_close(3000.0);
        let _ = n.normalize(&input).unwrap();
        assert_eq!(input.get_f64("close"), Some(3000.0));
    }

    #[test]
    fn missing_stats_for_present_value_is_an_error() {
        let n = normalizer(&["volume"]);
        let mut r = TypedRecord::empty();
        r.insert("volume", Value::Int(10));
        assert!(matches!(
            n.normalize(&r),
            Err(PipelineError::Consistency { tag: "statistics", .. })
        ));
    }

    #[test]
    fn output_registry_declares_doubles() {
        let n = normalizer(&["crimes", "temp"]);
        let mut input = TypeRegistry::new();
        input.define("crimes", ValueKind::Int);
        input.define("weather_main", ValueKind::Text);
        let out = n.output_types(&input);
        assert_eq!(out.get("crimes"), Some(ValueKind::Double));
        assert_eq!(out.get("temp"), Some(ValueKind::Double));
        assert_eq!(out.get("weather_main"), Some(ValueKind::Text));
    }
}
