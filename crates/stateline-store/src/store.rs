//! Durable record storage
//!
//! The storage technology is an external collaborator; the core talks to it
//! through [`StateStore`]. [`MemoryStore`] is the reference implementation
//! used by tests and single-process deployments.

use crate::StoreError;
use async_trait::async_trait;
use stateline_state::Snapshot;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Server-durable representation of one player's snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub player_id: String,
    pub snapshot: Snapshot,
    pub version: u64,
    pub checksum: u32,
}

impl PersistedRecord {
    /// Build a record from a snapshot, computing its checksum.
    pub fn new(player_id: impl Into<String>, snapshot: Snapshot) -> Result<Self, StoreError> {
        let bytes = snapshot
            .to_bytes()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            player_id: player_id.into(),
            version: snapshot.version,
            checksum: crc32fast::hash(&bytes),
            snapshot,
        })
    }
}

/// Durable-storage interface.
///
/// `put` updates an existing record and succeeds only when the stored
/// version still equals `expected_version`; version check and write are one
/// atomic unit per record. `create` inserts the first record for a player
/// and conflicts when any record already exists, whatever its version.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, player_id: &str) -> Result<Option<PersistedRecord>, StoreError>;

    async fn put(&self, record: PersistedRecord, expected_version: u64) -> Result<(), StoreError>;

    async fn create(&self, record: PersistedRecord) -> Result<(), StoreError>;
}

/// In-memory store with a per-record critical section.
///
/// The outer map lock is held only to locate the record's own mutex, so
/// commits for different players never serialize against each other.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Arc<Mutex<PersistedRecord>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, player_id: &str) -> Result<Option<PersistedRecord>, StoreError> {
        let cell = {
            let records = self.records.read().await;
            records.get(player_id).cloned()
        };
        match cell {
            Some(cell) => Ok(Some(cell.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, record: PersistedRecord, expected_version: u64) -> Result<(), StoreError> {
        let cell = {
            let records = self.records.read().await;
            records.get(&record.player_id).cloned()
        };

        match cell {
            Some(cell) => {
                let mut stored = cell.lock().await;
                if stored.version != expected_version {
                    return Err(StoreError::Conflict {
                        expected: expected_version,
                        current: stored.version,
                    });
                }
                *stored = record;
                Ok(())
            }
            // Updating a record that was never created is always a conflict.
            None => Err(StoreError::Conflict {
                expected: expected_version,
                current: 0,
            }),
        }
    }

    async fn create(&self, record: PersistedRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&record.player_id) {
            let current = existing.lock().await.version;
            return Err(StoreError::Conflict {
                expected: 0,
                current,
            });
        }
        records.insert(record.player_id.clone(), Arc::new(Mutex::new(record)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stateline_state::{FieldMap, Value};

    fn snapshot(version: u64) -> Snapshot {
        let mut fields = FieldMap::new();
        fields.insert("hp", Value::Int(100));
        Snapshot::new(version, 0, fields)
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let store = MemoryStore::new();
        let record = PersistedRecord::new("p1", snapshot(0)).unwrap();
        store.create(record.clone()).await.unwrap();

        let loaded = store.get("p1").await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn create_conflicts_when_a_record_exists() {
        let store = MemoryStore::new();
        store
            .create(PersistedRecord::new("p1", snapshot(0)).unwrap())
            .await
            .unwrap();

        // Even a version-0 record is never silently replaced.
        match store
            .create(PersistedRecord::new("p1", snapshot(0)).unwrap())
            .await
        {
            Err(StoreError::Conflict { current, .. }) => assert_eq!(current, 0),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn updating_a_missing_record_conflicts() {
        let store = MemoryStore::new();
        let record = PersistedRecord::new("ghost", snapshot(0)).unwrap();
        assert!(matches!(
            store.put(record, 0).await,
            Err(StoreError::Conflict { current: 0, .. })
        ));
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let store = MemoryStore::new();
        store
            .create(PersistedRecord::new("p1", snapshot(0)).unwrap())
            .await
            .unwrap();
        store
            .put(PersistedRecord::new("p1", snapshot(1)).unwrap(), 0)
            .await
            .unwrap();

        let stale = PersistedRecord::new("p1", snapshot(2)).unwrap();
        match store.put(stale, 0).await {
            Err(StoreError::Conflict { expected, current }) => {
                assert_eq!(expected, 0);
                assert_eq!(current, 1);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_player_is_none() {
        let store = MemoryStore::new();
        assert!(store.get("ghost").await.unwrap().is_none());
    }
}
