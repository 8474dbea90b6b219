//! Field values and ordered field maps
//!
//! Actor state is an ordered mapping of field name to value. Nested maps are
//! diffed recursively; scalars and sequences are compared whole by value.
//!
//! The types here are recursive (a value can hold a map of values), so the
//! rkyv derives carry explicit serializer/validator bounds with the
//! recursive fields omitted, per rkyv's recursive-schema pattern.

use rkyv::{Archive, Deserialize, Serialize};

/// A single field value in an actor's state.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[archive(bound(
    serialize = "__S: rkyv::ser::Serializer + rkyv::ser::ScratchSpace",
    deserialize = "__D: rkyv::Fallible"
))]
#[archive_attr(derive(rkyv::bytecheck::CheckBytes))]
#[archive_attr(check_bytes(
    bound = "__C: rkyv::validation::ArchiveContext, <__C as rkyv::Fallible>::Error: std::error::Error"
))]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Ordered sequence, replaced whole when it changes.
    List(
        #[omit_bounds]
        #[archive_attr(omit_bounds)]
        Vec<Value>,
    ),
    /// Nested mapping, diffed field by field.
    Map(
        #[omit_bounds]
        #[archive_attr(omit_bounds)]
        FieldMap,
    ),
}

/// One named field. [`FieldMap`] keeps entries sorted by key.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[archive(bound(
    serialize = "__S: rkyv::ser::Serializer + rkyv::ser::ScratchSpace",
    deserialize = "__D: rkyv::Fallible"
))]
#[archive_attr(derive(rkyv::bytecheck::CheckBytes))]
#[archive_attr(check_bytes(
    bound = "__C: rkyv::validation::ArchiveContext, <__C as rkyv::Fallible>::Error: std::error::Error"
))]
struct FieldEntry {
    key: String,
    #[omit_bounds]
    #[archive_attr(omit_bounds)]
    value: Value,
}

/// Ordered mapping of field name to value.
///
/// Stored as a vector sorted by key so that rkyv archives deterministically
/// and lookups stay logarithmic.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[archive(bound(
    serialize = "__S: rkyv::ser::Serializer + rkyv::ser::ScratchSpace",
    deserialize = "__D: rkyv::Fallible"
))]
#[archive_attr(derive(rkyv::bytecheck::CheckBytes))]
#[archive_attr(check_bytes(
    bound = "__C: rkyv::validation::ArchiveContext, <__C as rkyv::Fallible>::Error: std::error::Error"
))]
pub struct FieldMap {
    #[omit_bounds]
    #[archive_attr(omit_bounds)]
    entries: Vec<FieldEntry>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a field by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .binary_search_by(|entry| entry.key.as_str().cmp(key))
            .ok()
            .map(|idx| &self.entries[idx].value)
    }

    /// Insert or replace a field, keeping entries sorted by key.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self
            .entries
            .binary_search_by(|entry| entry.key.cmp(&key))
        {
            Ok(idx) => self.entries[idx].value = value,
            Err(idx) => self.entries.insert(idx, FieldEntry { key, value }),
        }
    }

    /// Remove a field by name.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries
            .binary_search_by(|entry| entry.key.as_str().cmp(key))
            .ok()
            .map(|idx| self.entries.remove(idx).value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .map(|entry| (entry.key.as_str(), &entry.value))
    }
}

impl FromIterator<(String, Value)> for FieldMap {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut map = FieldMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}
