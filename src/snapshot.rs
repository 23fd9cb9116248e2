//! Snapshot persistence against the embedded SQLite store.
//!
//! The snapshot file is shared between processes: several caches may save
//! into it concurrently (serialized by SQLite's immediate-mode write
//! lock), so the writer never blindly overwrites. Rows are staged into a
//! session-scoped `temp_state` table and merged so that versions only
//! advance and frequencies accumulate across saves. The reader streams
//! rows back least-popular first, capped by the configured byte limit, so
//! the most popular entries are the ones that survive a warm restart.
//!
//! Schema:
//!
//! ```text
//! object_state(object_id INTEGER PRIMARY KEY,
//!              version    INTEGER NOT NULL,
//!              frequency  INTEGER NOT NULL,
//!              state      BLOB)
//! checkpoints(id INTEGER PRIMARY KEY, cp0 INTEGER, cp1 INTEGER)
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use hashbrown::HashMap;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::bucket::Generation;
use crate::entry::{CacheKey, CacheValue};
use crate::error::{CacheError, Result};

/// SQLite's default statement-variable limit.
const MAX_STATEMENT_VARS: usize = 999;
/// Columns per staged row; bounds the rows per INSERT statement.
const STAGE_COLUMNS: usize = 4;
/// `ON CONFLICT DO UPDATE` with the version guard needs 3.28.
const UPSERT_VERSION: i32 = 3_028_000;
/// Parenthesized-tuple UPDATE needs 3.15.
const PAREN_UPDATE_VERSION: i32 = 3_015_000;

/// Entries of one generation, as produced by
/// [`Bucket::items_to_write`](crate::bucket::Bucket::items_to_write):
/// least- to most-popular order.
pub type GenerationItems = Vec<(CacheKey, CacheValue, Generation, u32)>;

/// The bucket contents collected under the cache mutex for one save.
#[derive(Debug, Default)]
pub struct WriteBatch {
    /// Eden entries, least popular first.
    pub eden: GenerationItems,
    /// Protected entries, least popular first.
    pub protected: GenerationItems,
    /// Probation entries, least popular first.
    pub probation: GenerationItems,
}

/// What a snapshot read produced.
#[derive(Debug)]
pub struct SnapshotContents {
    /// The persisted checkpoint pair, if one was ever saved.
    pub checkpoints: Option<(u64, u64)>,
    /// Rows ready for `bulk_update`: least- to most-recent, carrying the
    /// persisted per-row frequency.
    pub rows: GenerationItems,
    /// Object id to exact version, for rows at or past `cp0`.
    pub delta_after0: HashMap<u64, u64>,
    /// Object id to exact version, for rows between `cp1` and `cp0`.
    pub delta_after1: HashMap<u64, u64>,
}

/// The snapshot file scoped by `prefix` inside `dir`.
pub fn snapshot_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}statecache.sqlite3"))
}

/// Opens (optionally replacing) the snapshot file.
pub fn connect(dir: &Path, prefix: &str, overwrite: bool) -> Result<(Connection, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let path = snapshot_path(dir, prefix);
    if overwrite {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    let conn = Connection::open(&path)?;
    // Saves from other processes hold the write lock for a while; queue
    // up instead of failing immediately.
    conn.busy_timeout(Duration::from_secs(10))?;
    Ok((conn, path))
}

/// One row headed for `temp_state`.
#[derive(Debug)]
struct StagedRow {
    oid: u64,
    version: u64,
    state: Option<Vec<u8>>,
    frequency: u32,
}

/// Collapses the batch to the newest candidate row per object id.
///
/// Frequencies are summed per object across all generations. Each
/// generation is walked most-popular first under its own admission
/// threshold; seeing the same `actual_version` twice with different
/// states means the bucket is corrupt and the save must abort.
fn newest_entries(batch: &WriteBatch) -> Result<Vec<StagedRow>> {
    let mut frequencies: HashMap<u64, u32> = HashMap::new();
    for (key, _, _, frequency) in batch
        .eden
        .iter()
        .chain(batch.protected.iter())
        .chain(batch.probation.iter())
    {
        let summed = frequencies.entry(key.oid).or_insert(0);
        *summed = summed.saturating_add(*frequency);
    }

    let mut newest: HashMap<u64, StagedRow> = HashMap::new();
    let walks: [(&GenerationItems, u32); 3] = [
        (&batch.eden, 0),
        (&batch.protected, 1),
        (&batch.probation, 0),
    ];
    for (entries, threshold) in walks {
        for (key, value, _, _) in entries.iter().rev() {
            let frequency = frequencies.get(&key.oid).copied().unwrap_or(0);
            match newest.get_mut(&key.oid) {
                None => {
                    if frequency > threshold {
                        newest.insert(
                            key.oid,
                            StagedRow {
                                oid: key.oid,
                                version: value.actual_version,
                                state: value.state.clone(),
                                frequency,
                            },
                        );
                    }
                }
                Some(row) => {
                    if row.version < value.actual_version {
                        // Something newer than we've seen.
                        row.state = value.state.clone();
                    } else if row.version == value.actual_version && row.state != value.state {
                        return Err(CacheError::Corrupted {
                            oid: key.oid,
                            version: value.actual_version,
                        });
                    }
                }
            }
        }
    }
    Ok(newest.into_values().collect())
}

/// Merges the batch into the snapshot store.
///
/// Returns the number of rows staged. Corruption detected while preparing
/// the candidate rows aborts before the store is touched.
pub fn write(
    conn: &mut Connection,
    batch: &WriteBatch,
    checkpoints: Option<(u64, u64)>,
    limit: u64,
) -> Result<usize> {
    let rows = newest_entries(batch)?;

    let supports_upsert = rusqlite::version_number() >= UPSERT_VERSION;
    let supports_paren_update = rusqlite::version_number() >= PAREN_UPDATE_VERSION;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS object_state (
            object_id INTEGER PRIMARY KEY,
            version INTEGER NOT NULL,
            frequency INTEGER NOT NULL,
            state BLOB
        );
        CREATE TEMPORARY TABLE IF NOT EXISTS temp_state (
            object_id INTEGER PRIMARY KEY,
            version INTEGER NOT NULL,
            frequency INTEGER NOT NULL,
            state BLOB
        );
        DELETE FROM temp_state;
        CREATE TABLE IF NOT EXISTS checkpoints (
            id INTEGER PRIMARY KEY, cp0 INTEGER, cp1 INTEGER
        );",
    )?;

    let mut count_written = 0usize;
    let mut bytes_written = 0usize;

    // Stage under a plain transaction; nobody else can see temp_state.
    let tx = conn.transaction()?;
    let stored_versions: HashMap<u64, u64> = {
        let mut stmt = tx.prepare("SELECT object_id, version FROM object_state")?;
        let mut stored = HashMap::new();
        let mut rows_iter = stmt.query([])?;
        while let Some(row) = rows_iter.next()? {
            let oid = row.get::<_, i64>(0)? as u64;
            let version = row.get::<_, i64>(1)? as u64;
            stored.insert(oid, version);
        }
        stored
    };

    let staged: Vec<&StagedRow> = rows
        .iter()
        .filter(|row| {
            // Drop what the store already has at this version or newer,
            // and never persist tombstones.
            row.state.is_some()
                && stored_versions
                    .get(&row.oid)
                    .map_or(true, |stored| row.version > *stored)
        })
        .collect();

    for chunk in staged.chunks(MAX_STATEMENT_VARS / STAGE_COLUMNS) {
        let placeholders = vec!["(?, ?, ?, ?)"; chunk.len()].join(", ");
        let sql = format!(
            "INSERT INTO temp_state (object_id, version, frequency, state) VALUES {placeholders}"
        );
        let mut values: Vec<Value> = Vec::with_capacity(chunk.len() * STAGE_COLUMNS);
        for row in chunk {
            let state = row.state.clone().unwrap_or_default();
            bytes_written += state.len();
            count_written += 1;
            values.push(Value::Integer(row.oid as i64));
            values.push(Value::Integer(row.version as i64));
            values.push(Value::Integer(i64::from(row.frequency)));
            values.push(Value::Blob(state));
        }
        tx.execute(&sql, params_from_iter(values))?;
    }
    tx.commit()?;

    // Take the write lock for the merge; beginning immediate lets us
    // stand in line behind other processes instead of erroring out.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if supports_upsert {
        tx.execute(
            "INSERT INTO object_state (object_id, version, frequency, state)
             SELECT object_id, version, frequency, state
             FROM temp_state
             WHERE true
             ON CONFLICT(object_id) DO UPDATE
             SET version = excluded.version,
                 state = excluded.state,
                 frequency = excluded.frequency + object_state.frequency
             WHERE excluded.version > version",
            [],
        )?;
    } else {
        // The store may have moved on since our stored_versions snapshot;
        // the join re-checks against its current contents.
        if supports_paren_update {
            tx.execute(
                "WITH newer_values AS (SELECT temp_state.*
                    FROM temp_state
                    INNER JOIN object_state ON temp_state.object_id = object_state.object_id
                    WHERE object_state.version < temp_state.version
                )
                UPDATE object_state
                SET (version, frequency, state) = (SELECT newer_values.version,
                                                    newer_values.frequency + object_state.frequency,
                                                    newer_values.state
                                                   FROM newer_values
                                                   WHERE newer_values.object_id = object_id)
                WHERE object_id IN (SELECT object_id FROM newer_values)",
                [],
            )?;
        } else {
            tx.execute(
                "WITH newer_values AS (SELECT temp_state.*
                    FROM temp_state
                    INNER JOIN object_state ON temp_state.object_id = object_state.object_id
                    WHERE object_state.version < temp_state.version
                )
                UPDATE object_state
                SET version = (SELECT newer_values.version
                               FROM newer_values WHERE newer_values.object_id = object_id),
                    frequency = (SELECT newer_values.frequency + object_state.frequency
                                 FROM newer_values WHERE newer_values.object_id = object_id),
                    state = (SELECT newer_values.state
                             FROM newer_values WHERE newer_values.object_id = object_id)
                WHERE object_id IN (SELECT object_id FROM newer_values)",
                [],
            )?;
        }
        tx.execute(
            "INSERT INTO object_state (object_id, version, state, frequency)
             SELECT object_id, version, state, frequency
             FROM temp_state
             WHERE object_id NOT IN (SELECT object_id FROM object_state)",
            [],
        )?;
    }

    if let Some((cp0, cp1)) = checkpoints {
        if supports_upsert {
            tx.execute(
                "INSERT INTO checkpoints (id, cp0, cp1)
                 VALUES (0, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET cp0 = excluded.cp0, cp1 = excluded.cp1
                 WHERE excluded.cp0 > cp0",
                [cp0 as i64, cp1 as i64],
            )?;
        } else {
            let stored: Option<i64> = tx
                .query_row("SELECT cp0 FROM checkpoints", [], |row| row.get(0))
                .optional()?;
            match stored {
                None => {
                    tx.execute(
                        "INSERT INTO checkpoints (id, cp0, cp1) VALUES (0, ?, ?)",
                        [cp0 as i64, cp1 as i64],
                    )?;
                }
                Some(stored_cp0) if stored_cp0 < cp0 as i64 => {
                    tx.execute(
                        "UPDATE checkpoints SET cp0 = ?, cp1 = ?",
                        [cp0 as i64, cp1 as i64],
                    )?;
                }
                Some(_) => {}
            }
        }
    }
    tx.commit()?;

    debug!(count_written, bytes_written, "staged snapshot rows");
    trim(conn, limit)?;
    Ok(count_written)
}

/// Deletes the coldest rows until the stored states fit the byte limit,
/// compacting the file when it had grown past twice the limit.
fn trim(conn: &mut Connection, limit: u64) -> Result<()> {
    let total: Option<i64> =
        conn.query_row("SELECT SUM(LENGTH(state)) FROM object_state", [], |row| {
            row.get(0)
        })?;
    if total.unwrap_or(0) as u64 <= limit {
        return Ok(());
    }

    // Take the lock and check again; another process may have trimmed.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let total: Option<i64> =
        tx.query_row("SELECT SUM(LENGTH(state)) FROM object_state", [], |row| {
            row.get(0)
        })?;
    let mut byte_count = total.unwrap_or(0) as u64;
    let really_big = byte_count > limit * 2;
    if byte_count <= limit {
        return Ok(());
    }
    info!(
        over_by = byte_count - limit,
        limit, "snapshot too large, trimming"
    );

    // The oldest, least used objects go first.
    let victims: Vec<i64> = {
        let mut stmt = tx.prepare(
            "SELECT object_id, LENGTH(state)
             FROM object_state
             ORDER BY frequency ASC, version ASC, object_id ASC",
        )?;
        let mut victims = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let oid: i64 = row.get(0)?;
            let size: Option<i64> = row.get(1)?;
            byte_count = byte_count.saturating_sub(size.unwrap_or(0) as u64);
            victims.push(oid);
            if byte_count <= limit {
                break;
            }
        }
        victims
    };

    let deleted = victims.len();
    for chunk in victims.chunks(MAX_STATEMENT_VARS) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("DELETE FROM object_state WHERE object_id IN ({placeholders})");
        tx.execute(&sql, params_from_iter(chunk.iter().copied()))?;
    }
    tx.commit()?;

    if really_big {
        conn.execute_batch("VACUUM")?;
    }
    info!(deleted, remaining_bytes = byte_count, "trimmed snapshot");
    Ok(())
}

/// Reads the snapshot back, or `None` when no snapshot was ever written.
///
/// Rows stream in `(frequency ASC, version DESC)` order and accumulate
/// `len(state) + 48` bytes each; reading stops once the configured limit
/// is crossed, so the most popular rows are the ones kept. The returned
/// row list is already reversed for `bulk_update` (most recent last).
pub fn read(conn: &Connection, limit: u64) -> Result<Option<SnapshotContents>> {
    let have_schema: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'checkpoints'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if have_schema.is_none() {
        // No tables; we must not have saved here before.
        return Ok(None);
    }

    let checkpoints: Option<(u64, u64)> = conn
        .query_row("SELECT cp0, cp1 FROM checkpoints", [], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64))
        })
        .optional()?;
    let (cp0, cp1) = checkpoints.unwrap_or((0, 0));

    let total_count: i64 =
        conn.query_row("SELECT COUNT(object_id) FROM object_state", [], |row| {
            row.get(0)
        })?;
    debug!(total_count, "reading snapshot");

    let mut delta_after0: HashMap<u64, u64> = HashMap::new();
    let mut delta_after1: HashMap<u64, u64> = HashMap::new();
    let mut rows_out: GenerationItems = Vec::new();
    let mut bytes_read = 0u64;

    // Priority order; as a tie-breaker, newer versions win.
    let mut stmt = conn.prepare(
        "SELECT object_id, version, state, frequency
         FROM object_state
         ORDER BY frequency, version DESC",
    )?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let oid = row.get::<_, i64>(0)? as u64;
        let version = row.get::<_, i64>(1)? as u64;
        let state: Option<Vec<u8>> = row.get(2)?;
        let frequency = u32::try_from(row.get::<_, i64>(3)?).unwrap_or(u32::MAX);

        let key = if version >= cp0 {
            delta_after0.insert(oid, version);
            CacheKey::new(oid, version)
        } else if version >= cp1 {
            delta_after1.insert(oid, version);
            CacheKey::new(oid, version)
        } else {
            // Old generation, no delta. Index it under the current
            // checkpoint so the fallback lookup can still find it.
            CacheKey::new(oid, cp0)
        };

        bytes_read += state.as_ref().map_or(0, |s| s.len() as u64) + 48;
        rows_out.push((
            key,
            CacheValue::new(state, version),
            Generation::Eden,
            frequency,
        ));
        if bytes_read > limit {
            break;
        }
    }

    debug!(
        rows = rows_out.len(),
        bytes_read, "collected snapshot rows"
    );
    // Most recent last, so bulk insertion leaves them at the MRU end.
    rows_out.reverse();
    Ok(Some(SnapshotContents {
        checkpoints,
        rows: rows_out,
        delta_after0,
        delta_after1,
    }))
}
