//! Named cache buckets: a versioned key-value store of HTTP responses.
//!
//! A bucket maps a canonical request URL to a stored response. At most one
//! bucket (the one named by the configured version string) is authoritative;
//! the activation sweep removes the rest.

mod sqlite;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::http::StoredResponse;

pub use sqlite::SqliteStore;

/// A stored response together with when it was cached.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: StoredResponse,
  pub cached_at: DateTime<Utc>,
}

/// Trait for bucket storage backends.
pub trait BucketStore: Send + Sync {
  /// Open a bucket, creating it if absent. Idempotent.
  fn open_bucket(&self, name: &str) -> Result<()>;

  /// List all bucket names known to the store.
  fn list_buckets(&self) -> Result<Vec<String>>;

  /// Delete a bucket and all its entries. Deleting an absent bucket is a no-op.
  fn delete_bucket(&self, name: &str) -> Result<()>;

  /// Store a response under `key`, replacing any existing entry.
  fn put(&self, bucket: &str, key: &str, response: &StoredResponse) -> Result<()>;

  /// Look up an exact match for `key`.
  fn lookup(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Number of entries in a bucket.
  fn entry_count(&self, bucket: &str) -> Result<usize>;

  /// All keys in a bucket, ordered.
  fn keys(&self, bucket: &str) -> Result<Vec<String>>;
}

/// In-memory bucket store. Used in tests; nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
  buckets: Mutex<HashMap<String, HashMap<String, CachedEntry>>>,
}

impl BucketStore for MemoryStore {
  fn open_bucket(&self, name: &str) -> Result<()> {
    let mut buckets = self
      .buckets
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    buckets.entry(name.to_string()).or_default();
    Ok(())
  }

  fn list_buckets(&self) -> Result<Vec<String>> {
    let buckets = self
      .buckets
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut names: Vec<String> = buckets.keys().cloned().collect();
    names.sort();
    Ok(names)
  }

  fn delete_bucket(&self, name: &str) -> Result<()> {
    let mut buckets = self
      .buckets
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    buckets.remove(name);
    Ok(())
  }

  fn put(&self, bucket: &str, key: &str, response: &StoredResponse) -> Result<()> {
    let mut buckets = self
      .buckets
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let entries = buckets.entry(bucket.to_string()).or_default();
    entries.insert(
      key.to_string(),
      CachedEntry {
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn lookup(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>> {
    let buckets = self
      .buckets
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(buckets.get(bucket).and_then(|entries| entries.get(key)).cloned())
  }

  fn entry_count(&self, bucket: &str) -> Result<usize> {
    let buckets = self
      .buckets
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(buckets.get(bucket).map(|entries| entries.len()).unwrap_or(0))
  }

  fn keys(&self, bucket: &str) -> Result<Vec<String>> {
    let buckets = self
      .buckets
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut keys: Vec<String> = buckets
      .get(bucket)
      .map(|entries| entries.keys().cloned().collect())
      .unwrap_or_default();
    keys.sort();
    Ok(keys)
  }
}
