//! Persisted store trait and its SQLite and in-memory implementations.

use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use futures::future::{self, BoxFuture};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Key/value backend holding serialized cache blobs.
///
/// The cache only ever uses a single key per instance.
pub trait PersistedStore: Send + Sync {
  /// Read the value stored under `key`.
  fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

  /// Store `value` under `key`, replacing any previous value.
  fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>>;

  /// Remove the value under `key`. Removing a missing key is not an error.
  fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Store that lives as long as the process.
/// Used for ephemeral clients and in tests.
#[derive(Default)]
pub struct MemoryStore {
  values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_values<T>(&self, f: impl FnOnce(&mut HashMap<String, String>) -> T) -> Result<T> {
    let mut values = self
      .values
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut values))
  }
}

impl PersistedStore for MemoryStore {
  fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
    Box::pin(future::ready(self.with_values(|v| v.get(key).cloned())))
  }

  fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>> {
    Box::pin(future::ready(self.with_values(|v| {
      v.insert(key.to_string(), value);
    })))
  }

  fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
    Box::pin(future::ready(self.with_values(|v| {
      v.remove(key);
    })))
  }
}

/// Store backed by a single-table SQLite database.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at [`default_path`](Self::default_path).
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open the store at `path`, creating the file, its directory and the
  /// table as needed.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(dir) = path.parent() {
      std::fs::create_dir_all(dir)
        .wrap_err_with(|| format!("Failed to create cache directory {}", dir.display()))?;
    }

    let conn = Connection::open(path)
      .wrap_err_with(|| format!("Failed to open cache database at {}", path.display()))?;
    conn
      .execute_batch(STORE_SCHEMA)
      .wrap_err("Failed to create kv_store table")?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// `cache.db` under the platform data directory.
  pub fn default_path() -> Result<PathBuf> {
    dirs::data_dir()
      .map(|dir| dir.join("fetchcache").join("cache.db"))
      .ok_or_else(|| eyre!("Could not determine data directory"))
  }

  fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn read(&self, key: &str) -> Result<Option<String>> {
    self
      .connection()?
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read '{}': {}", key, e))
  }

  fn write(&self, key: &str, value: &str) -> Result<()> {
    self
      .connection()?
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write '{}': {}", key, e))?;
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    self
      .connection()?
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove '{}': {}", key, e))?;
    Ok(())
  }
}

/// Schema for the store table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

// The connection is local and statements are short, so work runs inline and
// the returned future is already complete.
impl PersistedStore for SqliteStore {
  fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
    Box::pin(future::ready(self.read(key)))
  }

  fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>> {
    Box::pin(future::ready(self.write(key, &value)))
  }

  fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
    Box::pin(future::ready(self.delete(key)))
  }
}
