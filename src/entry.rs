//! Key and value types for cached object states.

/// A versioned object identifier: the map key.
///
/// `version` is the *requested* version the entry is indexed under; the
/// exact version that produced the cached state lives in
/// [`CacheValue::actual_version`] and may differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Object id.
    pub oid: u64,
    /// Requested version id.
    pub version: u64,
}

impl CacheKey {
    /// Builds a key from its parts.
    pub fn new(oid: u64, version: u64) -> Self {
        CacheKey { oid, version }
    }
}

/// A cached object state.
///
/// `state == None` is a tombstone left behind by an undone transaction;
/// storing it is legal and it answers lookups like any other value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValue {
    /// The serialized (possibly compressed) object state.
    pub state: Option<Vec<u8>>,
    /// The exact version that produced `state`.
    pub actual_version: u64,
}

impl CacheValue {
    /// Builds a value from its parts.
    pub fn new(state: Option<Vec<u8>>, actual_version: u64) -> Self {
        CacheValue {
            state,
            actual_version,
        }
    }

    /// Byte length of the state; zero for tombstones.
    pub fn state_len(&self) -> usize {
        self.state.as_ref().map_or(0, Vec::len)
    }
}

/// Byte weight of an entry: two 64-bit ids for the key, the state bytes
/// plus one 64-bit id for the value.
pub fn entry_weight(_key: &CacheKey, value: &CacheValue) -> u64 {
    32 + value.state_len() as u64 + 16
}
