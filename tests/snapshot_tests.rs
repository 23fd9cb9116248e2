//! Snapshot persistence tests.
//!
//! Each test works against a scratch directory; the snapshot file inside
//! it is shared between cache instances the way several processes would
//! share it in production.

use statecache::bucket::Generation;
use statecache::snapshot::{self, WriteBatch};
use statecache::{CacheConfig, CacheError, CacheKey, CacheValue, LocalCache};

fn make_cache(dir: &std::path::Path, limit_mb: usize, compression: &str) -> LocalCache {
    LocalCache::new(CacheConfig {
        limit_mb,
        compression: String::from(compression),
        dir: Some(dir.to_path_buf()),
        ..CacheConfig::default()
    })
    .unwrap()
}

fn state(bytes: &[u8]) -> Option<Vec<u8>> {
    Some(bytes.to_vec())
}

fn item(
    oid: u64,
    version: u64,
    payload: &[u8],
    frequency: u32,
) -> (CacheKey, CacheValue, Generation, u32) {
    (
        CacheKey::new(oid, version),
        CacheValue::new(Some(payload.to_vec()), version),
        Generation::Eden,
        frequency,
    )
}

// ============================================================================
// ROUND-TRIP
// ============================================================================

#[test]
fn basic_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    let cache = make_cache(dir.path(), 1, "none");
    cache.insert(CacheKey::new(1, 10), CacheValue::new(state(b"abc"), 10));
    assert_eq!(cache.lookup(1, 10, None), Some((state(b"abc"), 10)));

    let path = cache.save(false).unwrap().expect("a write was attempted");
    assert!(path.exists());

    let warm = make_cache(dir.path(), 1, "none");
    let (delta0, delta1) = warm.restore().unwrap().expect("snapshot present");
    assert_eq!(delta0.get(&1), Some(&10));
    assert!(delta1.is_empty());
    assert_eq!(warm.lookup(1, 10, None), Some((state(b"abc"), 10)));
}

#[test]
fn save_without_dir_or_entries_is_a_noop() {
    let cache = LocalCache::new(CacheConfig {
        compression: String::from("none"),
        ..CacheConfig::default()
    })
    .unwrap();
    cache.insert(CacheKey::new(1, 1), CacheValue::new(state(b"x"), 1));
    assert_eq!(cache.save(false).unwrap(), None, "no dir, no write");
    assert_eq!(cache.restore().unwrap(), None);

    let dir = tempfile::tempdir().unwrap();
    let empty = make_cache(dir.path(), 1, "none");
    assert_eq!(empty.save(false).unwrap(), None, "empty cache, no write");
}

#[test]
fn restore_from_a_directory_without_snapshot_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let cache = make_cache(dir.path(), 1, "none");
    assert_eq!(cache.restore().unwrap(), None);
}

#[test]
fn checkpoints_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    let cache = make_cache(dir.path(), 1, "none");
    cache.insert(CacheKey::new(1, 120), CacheValue::new(state(b"a"), 120));
    cache.store_checkpoints(100, 50);
    cache.save(false).unwrap();

    let warm = make_cache(dir.path(), 1, "none");
    warm.restore().unwrap().expect("snapshot present");
    assert_eq!(warm.get_checkpoints(), Some((100, 50)));
}

#[test]
fn compressed_values_survive_the_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    let cache = make_cache(dir.path(), 1, "zlib");
    cache.insert(
        CacheKey::new(4, 9),
        CacheValue::new(state(&vec![b'Q'; 4000]), 9),
    );
    cache.lookup(4, 9, None); // lift it past the write threshold
    cache.save(false).unwrap();

    let warm = make_cache(dir.path(), 1, "zlib");
    warm.restore().unwrap().expect("snapshot present");
    assert_eq!(
        warm.lookup(4, 9, None),
        Some((state(&vec![b'Q'; 4000]), 9))
    );
}

#[test]
fn overwrite_discards_the_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();

    let cache = make_cache(dir.path(), 1, "none");
    cache.insert(CacheKey::new(1, 10), CacheValue::new(state(b"old"), 10));
    cache.save(false).unwrap();

    let fresh = make_cache(dir.path(), 1, "none");
    fresh.insert(CacheKey::new(2, 5), CacheValue::new(state(b"new"), 5));
    fresh.save(true).unwrap();

    let warm = make_cache(dir.path(), 1, "none");
    warm.restore().unwrap().expect("snapshot present");
    assert_eq!(warm.lookup(1, 10, None), None, "overwritten away");
    assert_eq!(warm.lookup(2, 5, None), Some((state(b"new"), 5)));
}

// ============================================================================
// DELTA MAPS AND OLD-GENERATION INDEXING
// ============================================================================

#[test]
fn restore_splits_rows_across_the_checkpoint_watermarks() {
    let dir = tempfile::tempdir().unwrap();
    let (mut conn, _) = snapshot::connect(dir.path(), "", false).unwrap();
    let batch = WriteBatch {
        eden: vec![
            item(1, 120, b"recent", 2),
            item(2, 70, b"older", 2),
            item(3, 30, b"oldest", 2),
        ],
        ..WriteBatch::default()
    };
    snapshot::write(&mut conn, &batch, Some((100, 50)), 1_000_000).unwrap();
    drop(conn);

    let warm = make_cache(dir.path(), 1, "none");
    let (delta0, delta1) = warm.restore().unwrap().expect("snapshot present");
    assert_eq!(delta0.get(&1), Some(&120));
    assert_eq!(delta0.get(&2), None);
    assert_eq!(delta1.get(&2), Some(&70));
    assert_eq!(delta1.get(&3), None, "old generation rows have no delta");

    // The oldest row is indexed under cp0 so the fallback protocol can
    // still reach it; its actual version is preserved.
    assert_eq!(warm.lookup(3, 100, None), Some((state(b"oldest"), 30)));
}

// ============================================================================
// MONOTONIC MERGE
// ============================================================================

#[test]
fn merge_advances_versions_and_accumulates_frequencies() {
    let dir = tempfile::tempdir().unwrap();

    // Another process left (oid 5, version 100, "old", frequency 2).
    let (mut conn, _) = snapshot::connect(dir.path(), "", false).unwrap();
    let batch = WriteBatch {
        eden: vec![item(5, 100, b"old", 2)],
        ..WriteBatch::default()
    };
    snapshot::write(&mut conn, &batch, None, 1_000_000).unwrap();
    drop(conn);

    // This process holds version 200 at frequency 3.
    let cache = make_cache(dir.path(), 1, "none");
    cache.insert(CacheKey::new(5, 200), CacheValue::new(state(b"new"), 200));
    cache.lookup(5, 200, None);
    cache.lookup(5, 200, None);
    cache.save(false).unwrap();

    let (conn, _) = snapshot::connect(dir.path(), "", false).unwrap();
    let contents = snapshot::read(&conn, 1_000_000).unwrap().unwrap();
    assert_eq!(contents.rows.len(), 1);
    let (_, value, _, frequency) = &contents.rows[0];
    assert_eq!(value.actual_version, 200);
    assert_eq!(value.state, state(b"new"));
    assert_eq!(*frequency, 5, "2 on disk + 3 in memory");
}

#[test]
fn merge_ignores_older_in_memory_versions() {
    let dir = tempfile::tempdir().unwrap();

    let (mut conn, _) = snapshot::connect(dir.path(), "", false).unwrap();
    let batch = WriteBatch {
        eden: vec![item(5, 200, b"current", 2)],
        ..WriteBatch::default()
    };
    snapshot::write(&mut conn, &batch, None, 1_000_000).unwrap();
    drop(conn);

    let cache = make_cache(dir.path(), 1, "none");
    cache.insert(
        CacheKey::new(5, 150),
        CacheValue::new(state(b"stale"), 150),
    );
    cache.lookup(5, 150, None);
    cache.save(false).unwrap();

    let (conn, _) = snapshot::connect(dir.path(), "", false).unwrap();
    let contents = snapshot::read(&conn, 1_000_000).unwrap().unwrap();
    assert_eq!(contents.rows.len(), 1);
    let (_, value, _, frequency) = &contents.rows[0];
    assert_eq!(value.actual_version, 200, "version never regresses");
    assert_eq!(value.state, state(b"current"));
    assert_eq!(*frequency, 2, "skipped rows do not touch frequency");
}

#[test]
fn checkpoint_row_only_advances() {
    let dir = tempfile::tempdir().unwrap();

    let (mut conn, _) = snapshot::connect(dir.path(), "", false).unwrap();
    let batch = WriteBatch {
        eden: vec![item(1, 10, b"x", 2)],
        ..WriteBatch::default()
    };
    snapshot::write(&mut conn, &batch, Some((100, 50)), 1_000_000).unwrap();
    // A later save with an older cp0 must not win.
    let batch = WriteBatch {
        eden: vec![item(1, 11, b"y", 2)],
        ..WriteBatch::default()
    };
    snapshot::write(&mut conn, &batch, Some((90, 40)), 1_000_000).unwrap();
    let contents = snapshot::read(&conn, 1_000_000).unwrap().unwrap();
    assert_eq!(contents.checkpoints, Some((100, 50)));

    // A strictly greater cp0 does win.
    let batch = WriteBatch {
        eden: vec![item(1, 12, b"z", 2)],
        ..WriteBatch::default()
    };
    snapshot::write(&mut conn, &batch, Some((120, 60)), 1_000_000).unwrap();
    let contents = snapshot::read(&conn, 1_000_000).unwrap().unwrap();
    assert_eq!(contents.checkpoints, Some((120, 60)));
}

#[test]
fn tombstones_are_not_persisted() {
    let dir = tempfile::tempdir().unwrap();

    let cache = make_cache(dir.path(), 1, "none");
    cache.insert(CacheKey::new(1, 10), CacheValue::new(state(b"kept"), 10));
    cache.insert(CacheKey::new(2, 10), CacheValue::new(None, 10));
    cache.lookup(1, 10, None);
    cache.lookup(2, 10, None);
    cache.save(false).unwrap();

    let warm = make_cache(dir.path(), 1, "none");
    warm.restore().unwrap().expect("snapshot present");
    assert_eq!(warm.lookup(1, 10, None), Some((state(b"kept"), 10)));
    assert_eq!(warm.lookup(2, 10, None), None, "tombstone stayed local");
}

// ============================================================================
// CORRUPTION
// ============================================================================

#[test]
fn conflicting_states_abort_the_write_and_leave_the_store_alone() {
    let dir = tempfile::tempdir().unwrap();

    let (mut conn, _) = snapshot::connect(dir.path(), "", false).unwrap();
    let batch = WriteBatch {
        eden: vec![item(1, 10, b"good", 2)],
        ..WriteBatch::default()
    };
    snapshot::write(&mut conn, &batch, None, 1_000_000).unwrap();

    // Two different states claiming the same actual version.
    let poisoned = WriteBatch {
        eden: vec![
            (
                CacheKey::new(9, 5),
                CacheValue::new(state(b"one"), 5),
                Generation::Eden,
                1,
            ),
            (
                CacheKey::new(9, 6),
                CacheValue::new(state(b"two"), 5),
                Generation::Eden,
                1,
            ),
        ],
        ..WriteBatch::default()
    };
    let err = snapshot::write(&mut conn, &poisoned, None, 1_000_000).unwrap_err();
    assert!(matches!(err, CacheError::Corrupted { oid: 9, version: 5 }));

    let contents = snapshot::read(&conn, 1_000_000).unwrap().unwrap();
    assert_eq!(contents.rows.len(), 1, "the poisoned batch wrote nothing");
    assert_eq!(contents.rows[0].1.state, state(b"good"));
}

#[test]
fn save_swallows_corruption_but_still_reports_the_path() {
    let dir = tempfile::tempdir().unwrap();

    let cache = make_cache(dir.path(), 1, "none");
    // Two requested versions sharing an actual version with different
    // states: poisoned, but only the snapshot writer can tell.
    cache.insert(CacheKey::new(9, 5), CacheValue::new(state(b"one"), 5));
    cache.insert(CacheKey::new(9, 6), CacheValue::new(state(b"two"), 5));

    let path = cache.save(false).unwrap();
    assert!(path.is_some(), "save reports the attempt");
    // The in-memory cache is still usable.
    assert_eq!(cache.lookup(9, 5, None), Some((state(b"one"), 5)));
}

// ============================================================================
// CAPACITY ON DISK AND ON RESTORE
// ============================================================================

#[test]
fn trim_deletes_the_coldest_rows_first() {
    let dir = tempfile::tempdir().unwrap();
    let (mut conn, _) = snapshot::connect(dir.path(), "", false).unwrap();

    let batch = WriteBatch {
        eden: vec![
            item(1, 10, &vec![1u8; 400], 2),
            item(2, 10, &vec![2u8; 400], 6),
            item(3, 10, &vec![3u8; 400], 6),
        ],
        ..WriteBatch::default()
    };
    // 1200 bytes of state against a 1000-byte limit.
    snapshot::write(&mut conn, &batch, None, 1_000).unwrap();

    let contents = snapshot::read(&conn, 1_000_000).unwrap().unwrap();
    let oids: Vec<u64> = contents.rows.iter().map(|(key, ..)| key.oid).collect();
    assert_eq!(oids.len(), 2);
    assert!(!oids.contains(&1), "the low-frequency row was trimmed");
}

#[test]
fn restore_keeps_the_most_popular_rows_under_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let (mut conn, _) = snapshot::connect(dir.path(), "", false).unwrap();

    let batch = WriteBatch {
        eden: vec![
            item(1, 10, &vec![1u8; 400_000], 2),
            item(2, 10, &vec![2u8; 400_000], 5),
            item(3, 10, &vec![3u8; 400_000], 9),
        ],
        ..WriteBatch::default()
    };
    snapshot::write(&mut conn, &batch, None, 2_000_000).unwrap();
    drop(conn);

    // A 1 MB cache cannot hold all three 400 KB rows; the reader stops
    // after the limit and keeps the most popular.
    let warm = make_cache(dir.path(), 1, "none");
    warm.restore().unwrap().expect("snapshot present");
    assert!(warm.lookup(3, 10, None).is_some(), "hottest row survives");
    assert!(warm.size() <= 1_000_000 + 400_048, "reader stopped near the cap");
}

#[test]
fn frequent_entry_survives_churn_and_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    let cache = make_cache(dir.path(), 1, "none");
    cache.insert(
        CacheKey::new(1, 1),
        CacheValue::new(state(&vec![b'A'; 400_000]), 1),
    );
    for _ in 0..5 {
        assert!(cache.lookup(1, 1, None).is_some(), "A stays resident");
    }
    cache.insert(
        CacheKey::new(2, 1),
        CacheValue::new(state(&vec![b'B'; 400_000]), 1),
    );
    cache.insert(
        CacheKey::new(3, 1),
        CacheValue::new(state(&vec![b'C'; 400_000]), 1),
    );

    assert!(cache.lookup(1, 1, None).is_some(), "A survives the churn");

    cache.save(false).unwrap();
    let warm = make_cache(dir.path(), 1, "none");
    warm.restore().unwrap().expect("snapshot present");
    assert!(
        warm.lookup(1, 1, None).is_some(),
        "A comes back after restart"
    );
}
