//! Server-side persistence for Stateline
//!
//! Durable records of player state behind a storage trait, and the conflict
//! resolver that applies incoming deltas under optimistic concurrency.

pub mod resolver;
pub mod store;

pub use resolver::{CommitError, CommitOutcome, Resolver};
pub use store::{MemoryStore, PersistedRecord, StateStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("version conflict: expected {expected}, current {current}")]
    Conflict { expected: u64, current: u64 },

    #[error("storage backend error: {0}")]
    Backend(String),
}
