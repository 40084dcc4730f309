//! Fast tier: in-process, size-bounded map with per-entry TTL and LRU
//! eviction.
//!
//! No I/O, always available, lost on restart. Expired entries are removed
//! lazily at read time; a periodic sweep (driven by the orchestrator)
//! additionally reclaims entries that are never read again.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::entry::CacheEntry;

/// The in-memory cache tier.
///
/// Values are stored as `serde_json::Value` so one tier instance can serve
/// heterogeneous payload types behind string keys.
#[derive(Debug)]
pub struct MemoryTier {
  max_entries: usize,
  entries: Mutex<HashMap<String, CacheEntry<Value>>>,
}

impl MemoryTier {
  /// Create a tier bounded at `max_entries` keys.
  pub fn new(max_entries: usize) -> Self {
    Self {
      max_entries: max_entries.max(1),
      entries: Mutex::new(HashMap::new()),
    }
  }

  /// Insert an entry, evicting the least-recently-accessed entry first if
  /// the tier is full. The capacity check happens before the insert, so the
  /// tier never exceeds `max_entries`.
  ///
  /// Returns the evicted key, if any.
  pub fn set(&self, key: String, entry: CacheEntry<Value>) -> Option<String> {
    let mut entries = match self.entries.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };

    let mut evicted = None;
    if !entries.contains_key(&key) && entries.len() >= self.max_entries {
      let victim = entries
        .iter()
        .min_by_key(|(_, e)| e.last_accessed_at)
        .map(|(k, _)| k.clone());
      if let Some(victim) = victim {
        entries.remove(&victim);
        debug!(key = %victim, "evicted least-recently-used entry");
        evicted = Some(victim);
      }
    }

    entries.insert(key, entry);
    evicted
  }

  /// Get an entry, updating its access metadata. Returns `None` and removes
  /// the entry if it is expired at read time.
  pub fn get(&self, key: &str) -> Option<CacheEntry<Value>> {
    let mut entries = match self.entries.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };

    let now = Instant::now();
    match entries.get_mut(key) {
      Some(entry) if entry.is_expired(now) => {
        entries.remove(key);
        None
      }
      Some(entry) => {
        entry.touch(now);
        Some(entry.clone())
      }
      None => None,
    }
  }

  /// Whether a non-expired entry exists for `key`. Does not update access
  /// metadata.
  pub fn has(&self, key: &str) -> bool {
    let entries = match self.entries.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    entries
      .get(key)
      .map(|e| !e.is_expired(Instant::now()))
      .unwrap_or(false)
  }

  /// Remove an entry. Returns whether one was present.
  pub fn delete(&self, key: &str) -> bool {
    let mut entries = match self.entries.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    entries.remove(key).is_some()
  }

  /// Remove everything.
  pub fn clear(&self) {
    let mut entries = match self.entries.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    entries.clear();
  }

  /// Remove all currently-expired entries. Returns how many were removed.
  ///
  /// Purely a memory-reclamation pass; the read-time lazy-expiry contract
  /// does not depend on it.
  pub fn sweep(&self) -> usize {
    let mut entries = match self.entries.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    let now = Instant::now();
    let before = entries.len();
    entries.retain(|_, e| !e.is_expired(now));
    before - entries.len()
  }

  /// Number of resident entries (expired-but-unswept entries count).
  pub fn len(&self) -> usize {
    let entries = match self.entries.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Snapshot of resident keys, used for pattern invalidation.
  pub fn keys(&self) -> Vec<String> {
    let entries = match self.entries.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    entries.keys().cloned().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  fn entry_from<T: serde::Serialize>(value: T, ttl: Duration) -> CacheEntry<Value> {
    CacheEntry::new(serde_json::to_value(value).unwrap(), ttl, None)
  }

  #[tokio::test(start_paused = true)]
  async fn test_set_then_get_returns_value() {
    let tier = MemoryTier::new(10);
    tier.set("k".into(), entry_from(vec![1, 2, 3], Duration::from_secs(60)));

    let entry = tier.get("k").expect("entry should be present");
    assert_eq!(entry.data, serde_json::json!([1, 2, 3]));
    assert_eq!(entry.access_count, 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_lazy_expiry_on_get() {
    let tier = MemoryTier::new(10);
    tier.set("k".into(), entry_from("v", Duration::from_secs(60)));

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(tier.get("k").is_none());
    // The expired entry was deleted, not just hidden
    assert_eq!(tier.len(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_lru_bound_evicts_oldest_accessed() {
    let tier = MemoryTier::new(3);
    tier.set("a".into(), entry_from(1, Duration::from_secs(60)));
    tokio::time::advance(Duration::from_millis(10)).await;
    tier.set("b".into(), entry_from(2, Duration::from_secs(60)));
    tokio::time::advance(Duration::from_millis(10)).await;
    tier.set("c".into(), entry_from(3, Duration::from_secs(60)));
    tokio::time::advance(Duration::from_millis(10)).await;

    // Touch "a" so "b" becomes the LRU candidate
    tier.get("a");
    tokio::time::advance(Duration::from_millis(10)).await;

    let evicted = tier.set("d".into(), entry_from(4, Duration::from_secs(60)));
    assert_eq!(evicted.as_deref(), Some("b"));
    assert_eq!(tier.len(), 3);
    assert!(tier.has("a"));
    assert!(tier.has("c"));
    assert!(tier.has("d"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_overwrite_does_not_evict() {
    let tier = MemoryTier::new(2);
    tier.set("a".into(), entry_from(1, Duration::from_secs(60)));
    tier.set("b".into(), entry_from(2, Duration::from_secs(60)));

    // Re-setting an existing key must not push anything out
    let evicted = tier.set("a".into(), entry_from(10, Duration::from_secs(60)));
    assert!(evicted.is_none());
    assert_eq!(tier.len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_sweep_removes_only_expired() {
    let tier = MemoryTier::new(10);
    tier.set("short".into(), entry_from(1, Duration::from_secs(10)));
    tier.set("long".into(), entry_from(2, Duration::from_secs(100)));

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(tier.sweep(), 1);
    assert!(!tier.has("short"));
    assert!(tier.has("long"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_delete_and_clear() {
    let tier = MemoryTier::new(10);
    tier.set("a".into(), entry_from(1, Duration::from_secs(60)));
    tier.set("b".into(), entry_from(2, Duration::from_secs(60)));

    assert!(tier.delete("a"));
    assert!(!tier.delete("a"));

    tier.clear();
    assert!(tier.is_empty());
  }
}
