use fnv::FnvHashMap;

use super::value::ValueKind;

/// One named, typed slot of a record shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub kind: ValueKind,
}

/// The ordered field table of a record shape.
///
/// Lookups by name go through a hash table built alongside the field list,
/// so a record never scans its fields to answer `get`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: Vec<FieldDef>,
    index: FnvHashMap<String, usize>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a schema from `(name, kind)` pairs. A repeated name keeps its
    /// first position and takes the last kind.
    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, ValueKind)>,
        S: Into<String>,
    {
        let mut schema = Self::new();
        for (name, kind) in fields {
            schema.define(name, kind);
        }
        schema
    }

    #[inline]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn kind_of(&self, name: &str) -> Option<ValueKind> {
        self.index_of(name).map(|i| self.fields[i].kind)
    }

    pub fn field(&self, idx: usize) -> Option<&FieldDef> {
        self.fields.get(idx)
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Adds `name` or changes its kind, returning its position.
    pub fn define(&mut self, name: impl Into<String>, kind: ValueKind) -> usize {
        let name = name.into();
        match self.index.get(&name) {
            Some(&idx) => {
                self.fields[idx].kind = kind;
                idx
            }
            None => {
                let idx = self.fields.len();
                self.index.insert(name.clone(), idx);
                self.fields.push(FieldDef { name, kind });
                idx
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_keeps_position_and_updates_kind() {
        let mut schema = Schema::from_fields([("date", ValueKind::Date), ("close", ValueKind::Int)]);
        assert_eq!(schema.define("close", ValueKind::Double), 1);
        assert_eq!(schema.define("volume", ValueKind::Int), 2);
        assert_eq!(schema.kind_of("close"), Some(ValueKind::Double));
        assert_eq!(schema.names().collect::<Vec<_>>(), vec!["date", "close", "volume"]);
        assert_eq!(schema.index_of("missing"), None);
    }
}
