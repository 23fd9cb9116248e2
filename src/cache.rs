//! The public cache engine.
//!
//! [`LocalCache`] wraps the segmented bucket in a single exclusive mutex
//! and layers on the pieces the bucket does not know about: the dual-key
//! lookup protocol, value compression and the per-value size gate, the
//! atomically-swapped checkpoint pair, and snapshot persistence.
//!
//! # Locking
//!
//! One `parking_lot::Mutex` protects the bucket. Critical sections contain
//! no I/O: decompression runs after the lock is released, and the snapshot
//! paths copy what they need under the lock, then talk to SQLite on their
//! own short-lived connection.
//!
//! The checkpoint pair lives outside the mutex in an `ArcSwapOption`, so
//! readers always observe either the prior pair or the new pair, never a
//! torn value.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::bucket::{Bucket, CacheStats, Generation};
use crate::codec::Codec;
use crate::config::CacheConfig;
use crate::entry::{entry_weight, CacheKey, CacheValue};
use crate::error::{CacheError, Result};
use crate::snapshot::{self, WriteBatch};

/// Map from object id to the exact version cached for it, returned by
/// [`LocalCache::restore`].
pub type DeltaMap = HashMap<u64, u64>;

/// A process-local object-state cache with a durable snapshot.
pub struct LocalCache {
    config: CacheConfig,
    codec: Codec,
    limit: u64,
    value_limit: usize,
    bucket: Mutex<Bucket<CacheKey, CacheValue>>,
    checkpoints: ArcSwapOption<(u64, u64)>,
}

impl core::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalCache")
            .field("limit", &self.limit)
            .field("entries", &self.len())
            .finish()
    }
}

impl LocalCache {
    /// Creates a cache from its configuration.
    ///
    /// Fails if the configured compression algorithm is unknown.
    pub fn new(config: CacheConfig) -> Result<Self> {
        let codec = Codec::from_name(&config.compression)?;
        let limit = config.limit_bytes();
        let value_limit = config.object_max;
        Ok(LocalCache {
            config,
            codec,
            limit,
            value_limit,
            bucket: Mutex::new(Bucket::new(limit, entry_weight)),
            checkpoints: ArcSwapOption::const_empty(),
        })
    }

    /// Looks up `oid` at the preferred version `v1`, falling back to `v2`.
    ///
    /// A hit on the fallback key is copied to the preferred key so the
    /// next lookup hits without consulting `v2`. Returns the decompressed
    /// state and the exact version that produced it.
    pub fn lookup(&self, oid: u64, v1: u64, v2: Option<u64>) -> Option<(Option<Vec<u8>>, u64)> {
        let preferred = CacheKey::new(oid, v1);
        let mut keys = vec![preferred];
        if let Some(v2) = v2 {
            keys.push(CacheKey::new(oid, v2));
        }

        let value = {
            let mut bucket = self.bucket.lock();
            let mut found = bucket.get_and_promote(&keys);
            if let Some(v2) = v2 {
                let fallback = CacheKey::new(oid, v2);
                if !found.contains_key(&preferred) {
                    if let Some(value) = found.get(&fallback).cloned() {
                        // A hit on the backup data. Move it to the
                        // preferred location.
                        bucket.set(preferred, value.clone());
                        found.insert(preferred, value);
                    }
                }
            }
            found.remove(&preferred)
        }?;

        // The lock is released; decompress on our own time.
        let actual_version = value.actual_version;
        match value.state {
            Some(bytes) => match Codec::decode(bytes) {
                Ok(state) => Some((Some(state), actual_version)),
                Err(err) => {
                    warn!(oid, version = v1, %err, "dropping undecodable cached state");
                    None
                }
            },
            None => Some((None, actual_version)),
        }
    }

    /// Inserts a state under `key`.
    ///
    /// The state is compressed first; values whose compressed size reaches
    /// the per-value limit are silently discarded, as is everything when
    /// the cache limit is zero.
    pub fn insert(&self, key: CacheKey, value: CacheValue) {
        if self.limit == 0 {
            return;
        }
        let state = value.state.map(|bytes| self.codec.encode(bytes));
        if state
            .as_ref()
            .is_some_and(|bytes| bytes.len() >= self.value_limit)
        {
            // Too big to cache.
            return;
        }
        let mut bucket = self.bucket.lock();
        bucket.set(key, CacheValue::new(state, value.actual_version));
    }

    /// Applies [`insert`](Self::insert) to every pair.
    pub fn insert_many<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (CacheKey, CacheValue)>,
    {
        for (key, value) in entries {
            self.insert(key, value);
        }
    }

    /// Atomically replaces the checkpoint pair.
    pub fn store_checkpoints(&self, cp0: u64, cp1: u64) {
        debug_assert!(cp0 >= cp1, "checkpoint pair out of order");
        self.checkpoints.store(Some(Arc::new((cp0, cp1))));
    }

    /// Returns the current checkpoint pair, if one was stored.
    pub fn get_checkpoints(&self) -> Option<(u64, u64)> {
        self.checkpoints.load_full().map(|pair| *pair)
    }

    /// Discards every entry and the checkpoint pair.
    pub fn flush_all(&self) {
        let mut bucket = self.bucket.lock();
        bucket.clear();
        self.checkpoints.store(None);
    }

    /// Current hit/miss counters and occupancy.
    pub fn stats(&self) -> CacheStats {
        self.bucket.lock().stats()
    }

    /// Zeroes the hit/miss counters.
    pub fn reset_stats(&self) {
        self.bucket.lock().reset_stats();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.bucket.lock().len()
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.bucket.lock().is_empty()
    }

    /// Total byte weight of live entries.
    pub fn size(&self) -> u64 {
        self.bucket.lock().size()
    }

    /// Snapshot of the live keys.
    pub fn iter_keys(&self) -> Vec<CacheKey> {
        let bucket = self.bucket.lock();
        bucket.iter_entries().map(|(key, ..)| *key).collect()
    }

    /// Snapshot of the live `(key, value)` pairs.
    pub fn iter_items(&self) -> Vec<(CacheKey, CacheValue)> {
        let bucket = self.bucket.lock();
        bucket
            .iter_entries()
            .map(|(key, value, ..)| (*key, value.clone()))
            .collect()
    }

    /// Snapshot of the live values.
    pub fn iter_values(&self) -> Vec<CacheValue> {
        let bucket = self.bucket.lock();
        bucket
            .iter_entries()
            .map(|(_, value, ..)| value.clone())
            .collect()
    }

    /// Releases nothing; the cache owns no external resources between
    /// snapshot calls.
    pub fn close(&self) {}

    /// Writes the snapshot file, merging with whatever another process
    /// already persisted.
    ///
    /// Returns the snapshot path when a write was attempted, `None` when
    /// persistence is disabled or the cache is empty. A corrupted bucket
    /// aborts the write and is logged here rather than propagated; the
    /// in-memory cache stays usable.
    pub fn save(&self, overwrite: bool) -> Result<Option<PathBuf>> {
        let Some(dir) = self.config.dir.as_deref() else {
            return Ok(None);
        };
        if self.size() == 0 {
            return Ok(None);
        }

        let (mut conn, path) = snapshot::connect(dir, &self.config.prefix, overwrite)?;
        let batch = {
            let bucket = self.bucket.lock();
            WriteBatch {
                eden: bucket.items_to_write(Generation::Eden),
                protected: bucket.items_to_write(Generation::Protected),
                probation: bucket.items_to_write(Generation::Probation),
            }
        };

        match snapshot::write(&mut conn, &batch, self.get_checkpoints(), self.limit) {
            Ok(written) => {
                let stats = self.stats();
                info!(
                    written,
                    path = %path.display(),
                    hits = stats.hits,
                    misses = stats.misses,
                    ratio = stats.ratio(),
                    "saved cache snapshot"
                );
            }
            Err(err @ CacheError::Corrupted { .. }) => {
                // A poisoned snapshot must not take the caller down.
                error!(%err, "failed to save cache snapshot");
            }
            Err(err) => return Err(err),
        }
        Ok(Some(path))
    }

    /// Loads the snapshot file into this (freshly created) cache.
    ///
    /// Returns the two delta maps described by the snapshot's checkpoints,
    /// or `None` when persistence is disabled or no snapshot was ever
    /// written.
    pub fn restore(&self) -> Result<Option<(DeltaMap, DeltaMap)>> {
        let Some(dir) = self.config.dir.as_deref() else {
            return Ok(None);
        };
        let (conn, path) = snapshot::connect(dir, &self.config.prefix, false)?;
        let Some(contents) = snapshot::read(&conn, self.limit)? else {
            return Ok(None);
        };

        if let Some((cp0, cp1)) = contents.checkpoints {
            self.store_checkpoints(cp0, cp1);
        }
        let row_count = contents.rows.len();
        {
            let mut bucket = self.bucket.lock();
            bucket.bulk_update(contents.rows);
        }
        info!(
            rows = row_count,
            path = %path.display(),
            "restored cache snapshot"
        );
        Ok(Some((contents.delta_after0, contents.delta_after1)))
    }
}
