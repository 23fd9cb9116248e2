//! Error types for the cache engine.
//!
//! One enum covers the three failure families the engine can surface:
//! configuration mistakes, snapshot-preparation corruption, and I/O from
//! the embedded snapshot store. Lookup misses and size-limited inserts are
//! not errors; they are silent per the cache contract.

use std::io;

/// Errors surfaced by the cache engine.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An invalid configuration value, such as an unknown compression
    /// algorithm name.
    #[error("invalid cache configuration: {0}")]
    Config(String),

    /// Two different states were observed for the same
    /// `(object_id, actual_version)` pair while preparing a snapshot.
    ///
    /// The snapshot write is aborted; the in-memory cache stays usable.
    #[error(
        "cache corrupted: object {oid} has two different states for version {version}"
    )]
    Corrupted {
        /// The object id with conflicting states.
        oid: u64,
        /// The version both states claim to represent.
        version: u64,
    },

    /// A failure from the embedded snapshot store.
    #[error("snapshot store error: {0}")]
    Snapshot(#[from] rusqlite::Error),

    /// A filesystem failure while opening or replacing the snapshot file.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
