//! Cache configuration.
//!
//! A plain struct with public fields, filled in by whatever outer layer
//! owns option parsing. The cache itself only validates what it consumes:
//! the compression name is checked when the codec is constructed, and the
//! byte limit is derived here.
//!
//! # Sizing
//!
//! `limit_mb` counts decimal megabytes: 1 MB is 1,000,000 bytes, not 2^20.
//! The snapshot file is trimmed against the same byte limit, so the on-disk
//! working set and the in-memory working set stay comparable in size.
//!
//! # Examples
//!
//! ```
//! use statecache::config::CacheConfig;
//!
//! let config = CacheConfig {
//!     limit_mb: 100,
//!     ..CacheConfig::default()
//! };
//! assert_eq!(config.limit_bytes(), 100_000_000);
//! ```

use std::path::PathBuf;

/// Configuration for a [`LocalCache`](crate::LocalCache).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache size limit in decimal megabytes (1 MB = 1,000,000 bytes).
    pub limit_mb: usize,

    /// Maximum byte size of an individual cached value, measured after
    /// compression. Larger values are silently dropped.
    pub object_max: usize,

    /// Compression algorithm name: `"zlib"`, `"bz2"` or `"none"`.
    pub compression: String,

    /// Directory holding the snapshot file. `None` disables persistence.
    pub dir: Option<PathBuf>,

    /// Prefix scoping the snapshot file name, so several caches can share
    /// one directory.
    pub prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            limit_mb: 10,
            object_max: 16384,
            compression: String::from("zlib"),
            dir: None,
            prefix: String::new(),
        }
    }
}

impl CacheConfig {
    /// Returns the configured limit in bytes.
    pub fn limit_bytes(&self) -> u64 {
        1_000_000 * self.limit_mb as u64
    }
}
