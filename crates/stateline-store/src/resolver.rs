//! Conflict-safe commits
//!
//! Applies incoming deltas to durable records under optimistic concurrency:
//! a commit lands only if its base version still matches the record, and a
//! loser gets the winning snapshot back so it can recompute.

use crate::store::{PersistedRecord, StateStore};
use crate::StoreError;
use stateline_state::snapshot::{apply, diff, StatePayload};
use stateline_state::{Delta, FieldMap, Snapshot, StateError, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Bounded recompute-and-retry budget for [`Resolver::commit_with_retry`].
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum CommitError {
    /// The delta raced another commit. Carries the authoritative snapshot so
    /// the caller can recompute; never silently overwritten.
    #[error("version conflict: delta base {base}, authoritative version {}", current.version)]
    VersionConflict { base: u64, current: Snapshot },

    /// Structurally invalid delta, rejected before any durable write.
    #[error("invalid delta: {0}")]
    Validation(String),

    #[error("no persisted state for player {0}")]
    UnknownPlayer(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// A successful commit: the bumped version and the snapshot it produced.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub new_version: u64,
    pub snapshot: Snapshot,
}

/// Applies deltas to persisted records with commit-time version checks.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn StateStore>,
}

impl Resolver {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Create the initial record for a player. Fails if one already exists.
    pub async fn create(&self, player_id: &str, snapshot: Snapshot) -> Result<(), CommitError> {
        validate_fields(&snapshot.fields)?;
        let record = PersistedRecord::new(player_id, snapshot)?;
        self.store.create(record).await?;
        Ok(())
    }

    /// Fetch the current authoritative record, if any.
    pub async fn current(&self, player_id: &str) -> Result<Option<PersistedRecord>, CommitError> {
        Ok(self.store.get(player_id).await?)
    }

    /// Commit a delta against the player's persisted record.
    ///
    /// Atomic: version bump, checksum recomputation, and the durable write
    /// land as one unit or not at all.
    pub async fn commit(&self, player_id: &str, delta: &Delta) -> Result<CommitOutcome, CommitError> {
        validate_delta(delta)?;

        let record = self
            .store
            .get(player_id)
            .await?
            .ok_or_else(|| CommitError::UnknownPlayer(player_id.to_string()))?;

        if delta.base_version != record.version {
            warn!(
                player = player_id,
                base = delta.base_version,
                current = record.version,
                "commit rejected, stale base version"
            );
            return Err(CommitError::VersionConflict {
                base: delta.base_version,
                current: record.snapshot,
            });
        }

        let next = apply(&record.snapshot, delta)?;
        let updated = PersistedRecord::new(player_id, next.clone())?;

        match self.store.put(updated, record.version).await {
            Ok(()) => {
                debug!(player = player_id, version = next.version, "commit applied");
                Ok(CommitOutcome {
                    new_version: next.version,
                    snapshot: next,
                })
            }
            Err(StoreError::Conflict { .. }) => {
                // Raced another commit between get and put; hand back the winner.
                let current = self
                    .store
                    .get(player_id)
                    .await?
                    .ok_or_else(|| CommitError::UnknownPlayer(player_id.to_string()))?;
                Err(CommitError::VersionConflict {
                    base: delta.base_version,
                    current: current.snapshot,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the player's snapshot wholesale (resync path; a full-state
    /// transfer arriving outside the delta stream).
    pub async fn commit_snapshot(
        &self,
        player_id: &str,
        fields: FieldMap,
        timestamp: u64,
    ) -> Result<CommitOutcome, CommitError> {
        validate_fields(&fields)?;
        let record = self
            .store
            .get(player_id)
            .await?
            .ok_or_else(|| CommitError::UnknownPlayer(player_id.to_string()))?;

        let next = Snapshot::new(record.version + 1, timestamp, fields);
        let updated = PersistedRecord::new(player_id, next.clone())?;
        match self.store.put(updated, record.version).await {
            Ok(()) => Ok(CommitOutcome {
                new_version: next.version,
                snapshot: next,
            }),
            Err(StoreError::Conflict { current, .. }) => {
                let winner = self
                    .store
                    .get(player_id)
                    .await?
                    .ok_or_else(|| CommitError::UnknownPlayer(player_id.to_string()))?;
                debug!(player = player_id, current, "snapshot replace raced a commit");
                Err(CommitError::VersionConflict {
                    base: record.version,
                    current: winner.snapshot,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drive the player's state to `desired`, recomputing the delta against
    /// each conflicting winner, up to a bounded number of attempts.
    pub async fn commit_with_retry(
        &self,
        player_id: &str,
        desired: FieldMap,
        timestamp: u64,
    ) -> Result<CommitOutcome, CommitError> {
        let mut base = self
            .store
            .get(player_id)
            .await?
            .ok_or_else(|| CommitError::UnknownPlayer(player_id.to_string()))?
            .snapshot;

        for attempt in 0..DEFAULT_RETRY_ATTEMPTS {
            let target = Snapshot::new(base.version + 1, timestamp, desired.clone());
            let result = match diff(&base, &target)? {
                StatePayload::Delta(delta) => self.commit(player_id, &delta).await,
                StatePayload::Full(full) => {
                    self.commit_snapshot(player_id, full.fields, timestamp).await
                }
            };
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(CommitError::VersionConflict { current, .. }) => {
                    debug!(
                        player = player_id,
                        attempt,
                        winner = current.version,
                        "commit conflict, recomputing against winner"
                    );
                    base = current;
                }
                Err(e) => return Err(e),
            }
        }
        let current = self
            .store
            .get(player_id)
            .await?
            .ok_or_else(|| CommitError::UnknownPlayer(player_id.to_string()))?;
        Err(CommitError::VersionConflict {
            base: current.version,
            current: current.snapshot,
        })
    }
}

/// Shape validation: version arithmetic, field-path names, numeric ranges.
/// Game-legality checks belong to the rules engine, not here.
fn validate_delta(delta: &Delta) -> Result<(), CommitError> {
    if delta.result_version != delta.base_version + 1 {
        return Err(CommitError::Validation(format!(
            "result version {} does not follow base {}",
            delta.result_version, delta.base_version
        )));
    }
    validate_fields(&delta.changes)
}

fn validate_fields(fields: &FieldMap) -> Result<(), CommitError> {
    for (key, value) in fields.iter() {
        if key.is_empty() {
            return Err(CommitError::Validation("empty field path".into()));
        }
        validate_value(key, value)?;
    }
    Ok(())
}

fn validate_value(key: &str, value: &Value) -> Result<(), CommitError> {
    match value {
        Value::Float(f) if !f.is_finite() => Err(CommitError::Validation(format!(
            "non-finite number at {key}"
        ))),
        Value::Map(inner) => validate_fields(inner),
        Value::List(items) => {
            for item in items {
                validate_value(key, item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
