//! Persistent tier: entry store contract, SQLite implementation, and the
//! best-effort wrapper the orchestrator talks to.
//!
//! Persistence is an optimization layer, never a correctness requirement:
//! the fast tier plus the original fetcher remain the source of truth, so
//! every failure here is logged and swallowed. The wrapper never returns an
//! error to its caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::CacheError;

/// The serialized form of a cache entry as it crosses the persistence
/// boundary. Payloads are JSON, optionally zstd-compressed.
#[derive(Debug, Clone)]
pub struct StoredEntry {
  pub payload: Vec<u8>,
  pub compressed: bool,
  pub stored_at: DateTime<Utc>,
  pub ttl: Duration,
  pub etag: Option<String>,
}

impl StoredEntry {
  /// Serialize a value into a stored entry, compressing when asked.
  pub fn encode(
    value: &Value,
    ttl: Duration,
    etag: Option<String>,
    compress: bool,
  ) -> Result<Self, CacheError> {
    let json = serde_json::to_vec(value)?;
    let (payload, compressed) = if compress {
      let packed = zstd::encode_all(&json[..], 3)
        .map_err(|e| CacheError::Persistence(format!("compression failed: {}", e)))?;
      (packed, true)
    } else {
      (json, false)
    };

    Ok(Self {
      payload,
      compressed,
      stored_at: Utc::now(),
      ttl,
      etag,
    })
  }

  /// Decode the payload back into a value. Honors the entry's own
  /// `compressed` flag, so entries written under a different compression
  /// setting stay readable.
  pub fn decode(&self) -> Result<Value, CacheError> {
    let json = if self.compressed {
      zstd::decode_all(&self.payload[..])
        .map_err(|e| CacheError::Persistence(format!("decompression failed: {}", e)))?
    } else {
      self.payload.clone()
    };
    Ok(serde_json::from_slice(&json)?)
  }

  /// Whether the entry has outlived its TTL by wall-clock time.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    let age_ms = now.signed_duration_since(self.stored_at).num_milliseconds();
    age_ms > ttl_millis(self.ttl)
  }

  /// TTL remaining at `now`, saturating at zero.
  pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
    let age_ms = now.signed_duration_since(self.stored_at).num_milliseconds();
    Duration::from_millis(ttl_millis(self.ttl).saturating_sub(age_ms).max(0) as u64)
  }
}

fn ttl_millis(ttl: Duration) -> i64 {
  i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// The persistent key-value contract the cache consumes.
///
/// Implementations may fail; the [`PersistentTier`] wrapper converts every
/// failure to best-effort semantics.
#[async_trait]
pub trait EntryStore: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError>;
  async fn set(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError>;
  async fn delete(&self, key: &str) -> Result<(), CacheError>;
  /// Bulk delete of every entry in the store's namespace.
  async fn clear(&self) -> Result<(), CacheError>;
}

/// SQLite-backed entry store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for the entry table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    payload BLOB NOT NULL,
    compressed INTEGER NOT NULL DEFAULT 0,
    stored_at TEXT NOT NULL,
    ttl_ms INTEGER NOT NULL,
    etag TEXT
);
"#;

impl SqliteStore {
  /// Open or create the store at the default location
  /// (`<data dir>/offcache/cache.db`).
  pub fn open_default() -> Result<Self, CacheError> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self, CacheError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| CacheError::Persistence(format!("failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::Persistence(format!("failed to open cache database at {}: {}", path.display(), e))
    })?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Open an in-memory store. Mainly useful in tests.
  pub fn open_in_memory() -> Result<Self, CacheError> {
    let conn = Connection::open_in_memory()?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn default_path() -> Result<PathBuf, CacheError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| CacheError::Persistence("could not determine data directory".into()))?;
    Ok(data_dir.join("offcache").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<(), CacheError> {
    let conn = self.lock_conn()?;
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| CacheError::Persistence(format!("failed to run migrations: {}", e)))?;
    Ok(())
  }

  fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CacheError> {
    self
      .conn
      .lock()
      .map_err(|_| CacheError::Persistence("lock poisoned".into()))
  }
}

#[async_trait]
impl EntryStore for SqliteStore {
  async fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
    let conn = self.lock_conn()?;
    let mut stmt = conn.prepare(
      "SELECT payload, compressed, stored_at, ttl_ms, etag FROM cache_entries WHERE key = ?",
    )?;

    let row: Option<(Vec<u8>, bool, String, i64, Option<String>)> = stmt
      .query_row(params![key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .optional()?;

    match row {
      Some((payload, compressed, stored_at, ttl_ms, etag)) => {
        let stored_at = DateTime::parse_from_rfc3339(&stored_at)
          .map_err(|e| CacheError::Persistence(format!("bad stored_at timestamp: {}", e)))?
          .with_timezone(&Utc);
        Ok(Some(StoredEntry {
          payload,
          compressed,
          stored_at,
          ttl: Duration::from_millis(ttl_ms.max(0) as u64),
          etag,
        }))
      }
      None => Ok(None),
    }
  }

  async fn set(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
    let conn = self.lock_conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO cache_entries (key, payload, compressed, stored_at, ttl_ms, etag)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        key,
        entry.payload,
        entry.compressed,
        entry.stored_at.to_rfc3339(),
        ttl_millis(entry.ttl),
        entry.etag,
      ],
    )?;
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<(), CacheError> {
    let conn = self.lock_conn()?;
    conn.execute("DELETE FROM cache_entries WHERE key = ?", params![key])?;
    Ok(())
  }

  async fn clear(&self) -> Result<(), CacheError> {
    let conn = self.lock_conn()?;
    conn.execute("DELETE FROM cache_entries", [])?;
    Ok(())
  }
}

/// A decoded persistent-tier hit.
#[derive(Debug, Clone)]
pub struct PersistedValue {
  pub value: Value,
  /// The TTL the entry was stored under
  pub ttl: Duration,
  /// TTL remaining at read time, so promotions into the fast tier keep the
  /// original expiry
  pub remaining_ttl: Duration,
  pub etag: Option<String>,
}

/// Best-effort wrapper around an [`EntryStore`].
///
/// `get` failures resolve to `None`, write failures are logged and dropped.
#[derive(Clone)]
pub struct PersistentTier {
  store: Option<Arc<dyn EntryStore>>,
  compression: bool,
}

impl PersistentTier {
  pub fn new(store: Arc<dyn EntryStore>, compression: bool) -> Self {
    Self {
      store: Some(store),
      compression,
    }
  }

  /// A tier that stores nothing, used when persistence is disabled.
  pub fn disabled() -> Self {
    Self {
      store: None,
      compression: false,
    }
  }

  pub fn is_enabled(&self) -> bool {
    self.store.is_some()
  }

  /// Look up a key. Expired entries are treated as misses and deleted
  /// best-effort.
  pub async fn get(&self, key: &str) -> Option<PersistedValue> {
    let store = self.store.as_ref()?;

    let entry = match store.get(key).await {
      Ok(Some(entry)) => entry,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "persistent get failed, treating as miss");
        return None;
      }
    };

    let now = Utc::now();
    if entry.is_expired(now) {
      debug!(key, "persisted entry expired");
      if let Err(e) = store.delete(key).await {
        warn!(key, error = %e, "failed to delete expired persisted entry");
      }
      return None;
    }

    match entry.decode() {
      Ok(value) => Some(PersistedValue {
        value,
        ttl: entry.ttl,
        remaining_ttl: entry.remaining_ttl(now),
        etag: entry.etag,
      }),
      Err(e) => {
        warn!(key, error = %e, "failed to decode persisted entry, deleting");
        if let Err(e) = store.delete(key).await {
          warn!(key, error = %e, "failed to delete corrupt persisted entry");
        }
        None
      }
    }
  }

  /// Store a value. Failures are logged and dropped.
  pub async fn set(&self, key: &str, value: &Value, ttl: Duration, etag: Option<String>) {
    let Some(store) = self.store.as_ref() else {
      return;
    };

    let entry = match StoredEntry::encode(value, ttl, etag, self.compression) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, error = %e, "failed to encode entry for persistence");
        return;
      }
    };

    if let Err(e) = store.set(key, entry).await {
      warn!(key, error = %e, "persistent set failed");
    }
  }

  /// Delete a key. Failures are logged and dropped.
  pub async fn delete(&self, key: &str) {
    let Some(store) = self.store.as_ref() else {
      return;
    };
    if let Err(e) = store.delete(key).await {
      warn!(key, error = %e, "persistent delete failed");
    }
  }

  /// Bulk delete everything. Failures are logged and dropped.
  pub async fn clear(&self) {
    let Some(store) = self.store.as_ref() else {
      return;
    };
    if let Err(e) = store.clear().await {
      warn!(error = %e, "persistent clear failed");
    }
  }
}

#[cfg(test)]
pub(crate) mod test_support {
  use super::*;

  /// An `EntryStore` whose every operation fails, for exercising the
  /// best-effort semantics of the wrapper.
  pub struct FailingStore;

  #[async_trait]
  impl EntryStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<StoredEntry>, CacheError> {
      Err(CacheError::Persistence("store unavailable".into()))
    }

    async fn set(&self, _key: &str, _entry: StoredEntry) -> Result<(), CacheError> {
      Err(CacheError::Persistence("storage quota exceeded".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
      Err(CacheError::Persistence("store unavailable".into()))
    }

    async fn clear(&self) -> Result<(), CacheError> {
      Err(CacheError::Persistence("store unavailable".into()))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_sqlite_roundtrip() {
    let store = SqliteStore::open_in_memory().unwrap();
    let entry =
      StoredEntry::encode(&json!({"id": 7, "name": "espresso"}), Duration::from_secs(60), Some("v1".into()), false)
        .unwrap();

    store.set("products:7", entry).await.unwrap();

    let loaded = store.get("products:7").await.unwrap().expect("entry present");
    assert_eq!(loaded.decode().unwrap(), json!({"id": 7, "name": "espresso"}));
    assert_eq!(loaded.etag.as_deref(), Some("v1"));
    assert_eq!(loaded.ttl, Duration::from_secs(60));
  }

  #[tokio::test]
  async fn test_sqlite_get_missing_is_none() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(store.get("nope").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_sqlite_delete_and_clear() {
    let store = SqliteStore::open_in_memory().unwrap();
    for key in ["a", "b"] {
      let entry = StoredEntry::encode(&json!(1), Duration::from_secs(60), None, false).unwrap();
      store.set(key, entry).await.unwrap();
    }

    store.delete("a").await.unwrap();
    assert!(store.get("a").await.unwrap().is_none());
    assert!(store.get("b").await.unwrap().is_some());

    store.clear().await.unwrap();
    assert!(store.get("b").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      let entry = StoredEntry::encode(&json!("persisted"), Duration::from_secs(60), None, false).unwrap();
      store.set("k", entry).await.unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let loaded = store.get("k").await.unwrap().expect("entry survives reopen");
    assert_eq!(loaded.decode().unwrap(), json!("persisted"));
  }

  #[tokio::test]
  async fn test_tier_expired_entry_is_a_miss() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut entry = StoredEntry::encode(&json!("old"), Duration::from_secs(1), None, false).unwrap();
    entry.stored_at = Utc::now() - chrono::Duration::minutes(10);
    store.set("k", entry).await.unwrap();

    let tier = PersistentTier::new(store.clone(), false);
    assert!(tier.get("k").await.is_none());
    // The expired row was also removed
    assert!(store.get("k").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_tier_compression_roundtrip() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let tier = PersistentTier::new(store.clone(), true);
    let value = json!({"rows": vec!["a"; 50]});

    tier.set("k", &value, Duration::from_secs(60), None).await;

    let raw = store.get("k").await.unwrap().expect("entry present");
    assert!(raw.compressed);

    let hit = tier.get("k").await.expect("tier hit");
    assert_eq!(hit.value, value);
  }

  #[tokio::test]
  async fn test_tier_swallows_store_failures() {
    let tier = PersistentTier::new(Arc::new(test_support::FailingStore), false);

    // None of these may panic or propagate an error
    assert!(tier.get("k").await.is_none());
    tier.set("k", &json!(1), Duration::from_secs(60), None).await;
    tier.delete("k").await;
    tier.clear().await;
  }

  #[tokio::test]
  async fn test_disabled_tier_is_inert() {
    let tier = PersistentTier::disabled();
    assert!(!tier.is_enabled());
    tier.set("k", &json!(1), Duration::from_secs(60), None).await;
    assert!(tier.get("k").await.is_none());
  }

  #[tokio::test]
  async fn test_remaining_ttl_shrinks_with_age() {
    let mut entry = StoredEntry::encode(&json!(1), Duration::from_secs(100), None, false).unwrap();
    entry.stored_at = Utc::now() - chrono::Duration::seconds(40);

    let remaining = entry.remaining_ttl(Utc::now());
    assert!(remaining <= Duration::from_secs(60));
    assert!(remaining > Duration::from_secs(58));
  }
}
