//! # statecache
//!
//! A process-local cache of serialized object states, built for a
//! relational storage adapter that keeps a working set of versioned
//! objects close to the process. The cache is byte-bounded, scan
//! resistant, thread safe, and can persist itself into a SQLite snapshot
//! file so a restarted process comes back warm.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           LocalCache                             │
//! │                                                                  │
//! │  lookup / insert            checkpoints           save / restore │
//! │        │                  (atomic swap)                 │        │
//! │        ▼                                                ▼        │
//! │  ┌──────────────── Mutex<Bucket> ───────────────┐  ┌──────────┐  │
//! │  │  eden ──▶ probation ──▶ protected            │  │ snapshot │  │
//! │  │  (segmented LRU, frequency-aware admission)  │  │  SQLite  │  │
//! │  └──────────────────────────────────────────────┘  └──────────┘  │
//! │        │                                                         │
//! │        ▼                                                         │
//! │  zlib / bz2 codec (runs outside the lock)                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key ideas
//!
//! | Concern | Approach |
//! |---------|----------|
//! | Replacement | Three-generation segmented LRU (eden / probation / protected) with TinyLFU-style admission |
//! | Capacity | Byte-accurate accounting against a configured limit, enforced after every operation |
//! | Lookup | Dual-key protocol: a preferred and a fallback version; fallback hits are copied forward |
//! | Compression | Tagged zlib/bz2 values (`.z` / `.b` markers); never double-compresses |
//! | Persistence | Monotonic merge into a shared SQLite snapshot; frequencies accumulate across saves |
//!
//! # Example
//!
//! ```
//! use statecache::{CacheConfig, CacheKey, CacheValue, LocalCache};
//!
//! let cache = LocalCache::new(CacheConfig {
//!     limit_mb: 1,
//!     compression: String::from("none"),
//!     ..CacheConfig::default()
//! })
//! .unwrap();
//!
//! cache.insert(CacheKey::new(1, 10), CacheValue::new(Some(b"abc".to_vec()), 10));
//! let (state, version) = cache.lookup(1, 10, None).unwrap();
//! assert_eq!(state.as_deref(), Some(&b"abc"[..]));
//! assert_eq!(version, 10);
//! ```
//!
//! # Persistence
//!
//! With [`CacheConfig::dir`] set, [`LocalCache::save`] merges the bucket
//! into `<dir>/<prefix>statecache.sqlite3` and [`LocalCache::restore`]
//! reads it back into a fresh cache, returning the delta maps an outer
//! invalidation layer consumes. The snapshot file may be shared by
//! several processes; writes are serialized by SQLite's immediate-mode
//! lock and versions only ever advance.

/// Byte-weight budget tracking shared by the generations and the bucket.
pub mod accountant;

/// The segmented-LRU bucket: map, generations, frequencies, statistics.
pub mod bucket;

/// The public cache engine.
pub mod cache;

/// Tagged zlib/bz2/none value compression.
pub mod codec;

/// Cache configuration.
pub mod config;

/// Key and value types for cached object states.
pub mod entry;

/// Error types.
pub mod error;

/// Doubly linked LRU list over a slot arena.
///
/// Internal infrastructure for the generation rings; the map stores slot
/// indices instead of references.
pub(crate) mod list;

/// SQLite snapshot persistence.
pub mod snapshot;

pub use bucket::{Bucket, CacheStats, Generation};
pub use cache::{DeltaMap, LocalCache};
pub use codec::Codec;
pub use config::CacheConfig;
pub use entry::{entry_weight, CacheKey, CacheValue};
pub use error::{CacheError, Result};
