//! SQLite-backed bucket store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use super::{BucketStore, CachedEntry};
use crate::http::StoredResponse;

/// Persistent bucket store backed by a single SQLite database.
///
/// The connection is behind a mutex, so individual reads and writes are
/// serialized at the key level. There is no cross-key transactional
/// guarantee; concurrent stores for different keys interleave arbitrarily.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Run database migrations for the bucket tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(BUCKET_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for the bucket tables.
const BUCKET_SCHEMA: &str = r#"
-- Named cache buckets, one per version string
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by canonical request URL
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, key)
);

CREATE INDEX IF NOT EXISTS idx_entries_bucket ON entries(bucket);
"#;

impl BucketStore for SqliteStore {
  fn open_bucket(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open bucket {}: {}", name, e))?;

    Ok(())
  }

  fn list_buckets(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_bucket(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM entries WHERE bucket = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of bucket {}: {}", name, e))?;
    conn
      .execute("DELETE FROM buckets WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", name, e))?;

    Ok(())
  }

  fn put(&self, bucket: &str, key: &str, response: &StoredResponse) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entries (bucket, key, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![bucket, key, response.status, headers, response.body],
      )
      .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;

    Ok(())
  }

  fn lookup(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE bucket = ? AND key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let result: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![bucket, key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match result {
      Some((status, headers_json, body, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers_json)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntry {
          response: StoredResponse {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn entry_count(&self, bucket: &str) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE bucket = ?",
        params![bucket],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", bucket, e))?;

    Ok(count as usize)
  }

  fn keys(&self, bucket: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT key FROM entries WHERE bucket = ? ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys: Vec<String> = stmt
      .query_map(params![bucket], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", bucket, e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn open_temp() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("cache.db")).unwrap();
    (dir, store)
  }

  fn response(status: u16, body: &str) -> StoredResponse {
    StoredResponse {
      status,
      headers: vec![
        ("content-type".to_string(), "text/css".to_string()),
        ("etag".to_string(), "\"abc\"".to_string()),
      ],
      body: body.as_bytes().to_vec(),
    }
  }

  #[test]
  fn test_roundtrip_preserves_response() {
    let (_dir, store) = open_temp();
    store.open_bucket("v1").unwrap();

    store
      .put("v1", "http://localhost:3000/style.css", &response(200, "body { margin: 0 }"))
      .unwrap();

    let entry = store
      .lookup("v1", "http://localhost:3000/style.css")
      .unwrap()
      .unwrap();
    assert_eq!(entry.response.status, 200);
    assert_eq!(entry.response.headers.len(), 2);
    assert_eq!(entry.response.body, b"body { margin: 0 }");
  }

  #[test]
  fn test_open_bucket_idempotent() {
    let (_dir, store) = open_temp();
    store.open_bucket("v1").unwrap();
    store.open_bucket("v1").unwrap();
    assert_eq!(store.list_buckets().unwrap(), vec!["v1"]);
  }

  #[test]
  fn test_delete_bucket_removes_entries() {
    let (_dir, store) = open_temp();
    store.open_bucket("v1").unwrap();
    store.open_bucket("v2").unwrap();
    store.put("v1", "k", &response(200, "a")).unwrap();
    store.put("v2", "k", &response(200, "b")).unwrap();

    store.delete_bucket("v1").unwrap();

    assert_eq!(store.list_buckets().unwrap(), vec!["v2"]);
    assert!(store.lookup("v1", "k").unwrap().is_none());
    assert_eq!(store.lookup("v2", "k").unwrap().unwrap().response.body, b"b");
  }

  #[test]
  fn test_keys_ordered() {
    let (_dir, store) = open_temp();
    store.open_bucket("v1").unwrap();
    store.put("v1", "http://a/z.js", &response(200, "")).unwrap();
    store.put("v1", "http://a/a.css", &response(200, "")).unwrap();

    assert_eq!(
      store.keys("v1").unwrap(),
      vec!["http://a/a.css".to_string(), "http://a/z.js".to_string()]
    );
    assert_eq!(store.entry_count("v1").unwrap(), 2);
  }

  #[test]
  fn test_reopen_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    {
      let store = SqliteStore::open(&path).unwrap();
      store.open_bucket("v1").unwrap();
      store.put("v1", "k", &response(200, "persisted")).unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let entry = store.lookup("v1", "k").unwrap().unwrap();
    assert_eq!(entry.response.body, b"persisted");
  }
}
