//! State model and delta engine for Stateline
//!
//! Provides versioned snapshots of actor state, sparse deltas between them,
//! and compression for bandwidth efficiency. Serialization uses rkyv.

pub mod compress;
pub mod snapshot;
pub mod value;

pub use compress::{CompressionAlgorithm, Compressor};
pub use snapshot::{apply, diff, diff_with_config, Delta, DiffConfig, Snapshot, StatePayload};
pub use value::{FieldMap, Value};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("version mismatch: delta base {base} against snapshot version {actual}")]
    VersionMismatch { base: u64, actual: u64 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),
}
