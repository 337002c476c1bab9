//! SQLite persistence of cache entries between runs.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::key::QueryKey;
use super::store::EntityCache;

/// Stores the last known value of every cache entry, with its fetch time,
/// so staleness carries over from one process to the next.
///
/// In-flight markers and errors are not persisted.
pub struct SqliteSnapshot {
  conn: Mutex<Connection>,
}

impl SqliteSnapshot {
  /// Open the snapshot at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open (or create) a snapshot database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let snapshot = Self {
      conn: Mutex::new(conn),
    };
    snapshot.run_migrations()?;

    Ok(snapshot)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("taskdeck").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SNAPSHOT_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  /// Replace the stored snapshot with the current contents of `cache`.
  ///
  /// Entries that never received data are skipped. Returns the number of
  /// rows written.
  pub fn save(&self, cache: &EntityCache) -> Result<usize> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM query_snapshot", [])
      .map_err(|e| eyre!("Failed to clear snapshot: {}", e))?;

    let mut written = 0;
    for (key, entry) in cache.entries() {
      let (Some(data), Some(fetched_at)) = (&entry.data, entry.fetched_at) else {
        continue;
      };
      let data = serde_json::to_vec(data).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;
      let stale_time_ms = i64::try_from(entry.stale_time.as_millis()).unwrap_or(i64::MAX);

      tx.execute(
        "INSERT OR REPLACE INTO query_snapshot
           (query_hash, query_key, data, fetched_at, stale_time_ms, invalidated)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          key.cache_hash(),
          key.to_json(),
          data,
          fetched_at.to_rfc3339(),
          stale_time_ms,
          entry.invalidated,
        ],
      )
      .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;
      written += 1;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(written)
  }

  /// Load every stored entry into `cache`. Keys already present are left
  /// alone; unreadable rows are skipped. Returns the number restored.
  pub fn load(&self, cache: &EntityCache) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT query_key, data, fetched_at, stale_time_ms, invalidated FROM query_snapshot",
      )
      .map_err(|e| eyre!("Failed to prepare snapshot query: {}", e))?;

    let rows: Vec<(String, Vec<u8>, String, i64, bool)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query snapshot: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut restored = 0;
    for (key_json, data, fetched_at, stale_time_ms, invalidated) in rows {
      let Ok(key) = QueryKey::from_json(&key_json) else {
        tracing::warn!(key = %key_json, "skipping unreadable snapshot key");
        continue;
      };
      let Ok(value) = serde_json::from_slice(&data) else {
        tracing::warn!(%key, "skipping unreadable snapshot value");
        continue;
      };
      let fetched_at = parse_datetime(&fetched_at)?;
      let stale_time = Duration::from_millis(u64::try_from(stale_time_ms).unwrap_or(0));

      if cache.restore(key, value, fetched_at, stale_time, invalidated) {
        restored += 1;
      }
    }

    Ok(restored)
  }

  /// Delete everything stored.
  pub fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM query_snapshot", [])
      .map_err(|e| eyre!("Failed to clear snapshot: {}", e))?;

    Ok(())
  }
}

/// Schema for the snapshot table.
const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS query_snapshot (
    query_hash TEXT PRIMARY KEY,
    query_key TEXT NOT NULL,
    data BLOB NOT NULL,
    fetched_at TEXT NOT NULL,
    stale_time_ms INTEGER NOT NULL,
    invalidated INTEGER NOT NULL DEFAULT 0
);
"#;

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_save_and_load_preserves_fetch_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    let cache = EntityCache::new();
    let fetched_at = cache.now() - chrono::TimeDelta::seconds(30);
    let list = QueryKey::new("projects").with(json!({}));
    let detail = QueryKey::new("project").with(7);
    cache.put(&list, json!([{"id": 7}]), fetched_at);
    cache.put(&detail, json!({"id": 7}), fetched_at);
    cache.invalidate(&detail);

    let snapshot = SqliteSnapshot::open(&path).unwrap();
    assert_eq!(snapshot.save(&cache).unwrap(), 2);

    let reopened = SqliteSnapshot::open(&path).unwrap();
    let restored = EntityCache::new();
    assert_eq!(reopened.load(&restored).unwrap(), 2);

    let entry = restored.get(&list).unwrap();
    assert_eq!(entry.data, Some(json!([{"id": 7}])));
    assert_eq!(
      entry.fetched_at.map(|t| t.timestamp_millis()),
      Some(fetched_at.timestamp_millis())
    );
    assert!(restored.is_fresh(&entry));
    assert!(restored.get(&detail).unwrap().invalidated);
  }

  #[test]
  fn test_load_does_not_overwrite_live_entries() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = SqliteSnapshot::open(&dir.path().join("cache.db")).unwrap();
    let key = QueryKey::new("task").with(1);

    let old = EntityCache::new();
    old.put(&key, json!("persisted"), old.now());
    snapshot.save(&old).unwrap();

    let live = EntityCache::new();
    live.put(&key, json!("live"), live.now());
    assert_eq!(snapshot.load(&live).unwrap(), 0);
    assert_eq!(live.get(&key).unwrap().data, Some(json!("live")));
  }

  #[test]
  fn test_entries_without_data_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = SqliteSnapshot::open(&dir.path().join("cache.db")).unwrap();
    let cache = EntityCache::new();
    let key = QueryKey::new("projects").with(json!({}));
    let seq = cache.next_seq();
    cache.set_error(&key, crate::error::QueryError::Timeout, seq);

    assert_eq!(snapshot.save(&cache).unwrap(), 0);
  }

  #[test]
  fn test_clear() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = SqliteSnapshot::open(&dir.path().join("cache.db")).unwrap();
    let cache = EntityCache::new();
    cache.put(&QueryKey::new("task").with(1), json!({}), cache.now());
    snapshot.save(&cache).unwrap();

    snapshot.clear().unwrap();
    assert_eq!(snapshot.load(&EntityCache::new()).unwrap(), 0);
  }
}
