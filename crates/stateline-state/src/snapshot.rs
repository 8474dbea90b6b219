//! Snapshot and delta computation
//!
//! A [`Snapshot`] is the full authoritative state of one actor at a version.
//! [`diff`] computes the sparse change-set between two snapshots; applying it
//! to the older snapshot reconstructs the newer one exactly.

use crate::value::{FieldMap, Value};
use crate::StateError;
use rkyv::{Archive, Deserialize, Serialize};

/// Full state of one actor at a point in logical time. Immutable once created.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct Snapshot {
    /// Monotonically increasing state version.
    pub version: u64,
    /// Wall-clock milliseconds when the state was produced.
    pub timestamp: u64,
    pub fields: FieldMap,
}

impl Snapshot {
    pub fn new(version: u64, timestamp: u64, fields: FieldMap) -> Self {
        Self {
            version,
            timestamp,
            fields,
        }
    }

    /// Serialize to rkyv bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StateError> {
        rkyv::to_bytes::<_, 256>(self)
            .map(|b| b.to_vec())
            .map_err(|e| StateError::Serialization(e.to_string()))
    }

    /// Deserialize from rkyv bytes, validating the archive.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        let archived = rkyv::check_archived_root::<Self>(bytes)
            .map_err(|e| StateError::Deserialization(e.to_string()))?;
        archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|e| StateError::Deserialization(e.to_string()))
    }
}

/// Sparse change-set between two snapshots.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct Delta {
    /// Version the delta was computed against.
    pub base_version: u64,
    /// Version the delta produces when applied.
    pub result_version: u64,
    /// Timestamp of the resulting snapshot.
    pub timestamp: u64,
    /// Changed fields only, recursive for nested maps.
    pub changes: FieldMap,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StateError> {
        rkyv::to_bytes::<_, 256>(self)
            .map(|b| b.to_vec())
            .map_err(|e| StateError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        let archived = rkyv::check_archived_root::<Self>(bytes)
            .map_err(|e| StateError::Deserialization(e.to_string()))?;
        archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|e| StateError::Deserialization(e.to_string()))
    }
}

/// Outcome of diffing two snapshots: either a sparse delta, or the full new
/// snapshot when sparse encoding would not pay off.
#[derive(Debug, Clone, PartialEq)]
pub enum StatePayload {
    Delta(Delta),
    Full(Snapshot),
}

/// Tuning for the delta-vs-full decision.
#[derive(Debug, Clone)]
pub struct DiffConfig {
    /// A delta whose serialized size exceeds this fraction of the full
    /// snapshot's serialized size is replaced by the full snapshot.
    pub full_snapshot_ratio: f64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            full_snapshot_ratio: 0.5,
        }
    }
}

/// Compute the sparse difference between two snapshots.
///
/// Falls back to a full snapshot when the delta cannot represent the change
/// (a field was removed) or when its encoding would exceed the configured
/// fraction of the full snapshot's size.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Result<StatePayload, StateError> {
    diff_with_config(old, new, &DiffConfig::default())
}

pub fn diff_with_config(
    old: &Snapshot,
    new: &Snapshot,
    config: &DiffConfig,
) -> Result<StatePayload, StateError> {
    let changes = match diff_maps(&old.fields, &new.fields) {
        Some(changes) => changes,
        // Overwrite-merge cannot express removals; ship the whole state.
        None => return Ok(StatePayload::Full(new.clone())),
    };

    let delta = Delta {
        base_version: old.version,
        result_version: new.version,
        timestamp: new.timestamp,
        changes,
    };

    if !delta.is_empty() {
        let delta_len = delta.to_bytes()?.len();
        let full_len = new.to_bytes()?.len();
        if delta_len as f64 > full_len as f64 * config.full_snapshot_ratio {
            return Ok(StatePayload::Full(new.clone()));
        }
    }

    Ok(StatePayload::Delta(delta))
}

/// Apply a delta to the snapshot it was computed against.
///
/// Pure merge: every path in the delta overwrites the same path in a copy of
/// the base; untouched paths carry over. Fails when the delta's base version
/// does not match the snapshot.
pub fn apply(snapshot: &Snapshot, delta: &Delta) -> Result<Snapshot, StateError> {
    if delta.base_version != snapshot.version {
        return Err(StateError::VersionMismatch {
            base: delta.base_version,
            actual: snapshot.version,
        });
    }

    let mut fields = snapshot.fields.clone();
    merge_maps(&mut fields, &delta.changes);

    Ok(Snapshot {
        version: delta.result_version,
        timestamp: delta.timestamp,
        fields,
    })
}

/// Recursive structural comparison of two field maps.
///
/// Returns the sparse change-set, or `None` when a key present in `old` is
/// missing from `new` (not representable by overwrite-merge).
fn diff_maps(old: &FieldMap, new: &FieldMap) -> Option<FieldMap> {
    for (key, _) in old.iter() {
        if new.get(key).is_none() {
            return None;
        }
    }

    let mut changes = FieldMap::new();
    for (key, new_value) in new.iter() {
        match old.get(key) {
            Some(Value::Map(old_inner)) => {
                if let Value::Map(new_inner) = new_value {
                    let inner = diff_maps(old_inner, new_inner)?;
                    if !inner.is_empty() {
                        changes.insert(key, Value::Map(inner));
                    }
                } else {
                    changes.insert(key, new_value.clone());
                }
            }
            Some(old_value) => {
                if old_value != new_value {
                    changes.insert(key, new_value.clone());
                }
            }
            None => {
                changes.insert(key, new_value.clone());
            }
        }
    }
    Some(changes)
}

fn merge_maps(base: &mut FieldMap, changes: &FieldMap) {
    for (key, change) in changes.iter() {
        match (base.get(key), change) {
            (Some(Value::Map(existing)), Value::Map(inner)) => {
                let mut merged = existing.clone();
                merge_maps(&mut merged, inner);
                base.insert(key, Value::Map(merged));
            }
            _ => base.insert(key, change.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(version: u64, fields: FieldMap) -> Snapshot {
        Snapshot::new(version, 1_000 + version, fields)
    }

    // Sized like a real actor record: a one-field delta must come out well
    // under the full-snapshot fallback ratio despite the delta's fixed
    // version/timestamp overhead.
    fn base_fields() -> FieldMap {
        let mut pos = FieldMap::new();
        pos.insert("x", Value::Float(1.0));
        pos.insert("y", Value::Float(2.0));

        let mut fields = FieldMap::new();
        fields.insert("hp", Value::Int(100));
        fields.insert("mana", Value::Int(40));
        fields.insert("name", Value::Str("karn-the-bold".into()));
        fields.insert("zone", Value::Str("emberfall-harbor-district".into()));
        fields.insert("guild", Value::Str("order-of-the-silent-tide".into()));
        fields.insert("position", Value::Map(pos));
        fields.insert(
            "loadout",
            Value::List(vec![
                Value::Str("tidebreaker-spear".into()),
                Value::Str("lantern-of-echoes".into()),
                Value::Str("stormcloak".into()),
            ]),
        );
        fields
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let s = snapshot(4, base_fields());
        let payload = diff(&s, &s).unwrap();
        match payload {
            StatePayload::Delta(d) => {
                assert!(d.is_empty());
                assert_eq!(d.base_version, 4);
                assert_eq!(d.result_version, 4);
            }
            StatePayload::Full(_) => panic!("identical snapshots must diff sparse"),
        }
    }

    #[test]
    fn diff_captures_only_changed_fields() {
        let old = snapshot(4, base_fields());
        let mut fields = base_fields();
        fields.insert("hp", Value::Int(95));
        let new = snapshot(5, fields);

        match diff(&old, &new).unwrap() {
            StatePayload::Delta(d) => {
                assert_eq!(d.changes.len(), 1);
                assert_eq!(d.changes.get("hp"), Some(&Value::Int(95)));
            }
            StatePayload::Full(_) => panic!("single scalar change must diff sparse"),
        }
    }

    #[test]
    fn nested_map_changes_diff_recursively() {
        let old = snapshot(4, base_fields());
        let mut fields = base_fields();
        let mut pos = FieldMap::new();
        pos.insert("x", Value::Float(1.0));
        pos.insert("y", Value::Float(7.5));
        fields.insert("position", Value::Map(pos));
        let new = snapshot(5, fields);

        match diff(&old, &new).unwrap() {
            StatePayload::Delta(d) => {
                let Some(Value::Map(inner)) = d.changes.get("position") else {
                    panic!("expected nested map change");
                };
                assert_eq!(inner.len(), 1);
                assert_eq!(inner.get("y"), Some(&Value::Float(7.5)));
            }
            StatePayload::Full(_) => panic!("nested change must diff sparse"),
        }
    }

    #[test]
    fn apply_reconstructs_new_snapshot() {
        let old = snapshot(4, base_fields());
        let mut fields = base_fields();
        fields.insert("hp", Value::Int(42));
        let mut pos = FieldMap::new();
        pos.insert("x", Value::Float(-3.0));
        pos.insert("y", Value::Float(2.0));
        fields.insert("position", Value::Map(pos));
        let new = snapshot(5, fields);

        let StatePayload::Delta(delta) = diff(&old, &new).unwrap() else {
            panic!("expected sparse delta");
        };
        let rebuilt = apply(&old, &delta).unwrap();
        assert_eq!(rebuilt, new);
    }

    #[test]
    fn apply_rejects_wrong_base_version() {
        let old = snapshot(4, base_fields());
        let delta = Delta {
            base_version: 7,
            result_version: 8,
            timestamp: 0,
            changes: FieldMap::new(),
        };

        match apply(&old, &delta) {
            Err(StateError::VersionMismatch { base, actual }) => {
                assert_eq!(base, 7);
                assert_eq!(actual, 4);
            }
            other => panic!("expected VersionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn removed_field_falls_back_to_full() {
        let old = snapshot(4, base_fields());
        let mut fields = base_fields();
        fields.remove("name");
        let new = snapshot(5, fields);

        match diff(&old, &new).unwrap() {
            StatePayload::Full(full) => assert_eq!(full, new),
            StatePayload::Delta(_) => panic!("removal is not delta-representable"),
        }
    }

    #[test]
    fn oversized_delta_falls_back_to_full() {
        let mut old_fields = FieldMap::new();
        let mut new_fields = FieldMap::new();
        for i in 0..16 {
            old_fields.insert(format!("slot{i}"), Value::Int(i));
            // Change every field so the delta approaches full size.
            new_fields.insert(format!("slot{i}"), Value::Int(i + 1));
        }
        let old = snapshot(1, old_fields);
        let new = snapshot(2, new_fields);

        match diff(&old, &new).unwrap() {
            StatePayload::Full(full) => assert_eq!(full.version, 2),
            StatePayload::Delta(d) => panic!("expected full fallback, got {} changes", d.changes.len()),
        }
    }

    #[test]
    fn snapshot_roundtrips_through_bytes() {
        let s = snapshot(9, base_fields());
        let bytes = s.to_bytes().unwrap();
        let back = Snapshot::from_bytes(&bytes).unwrap();
        assert_eq!(back, s);
    }
}
