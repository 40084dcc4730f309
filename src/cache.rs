//! Cache orchestrator: composes the fast and persistent tiers behind a
//! single get/set/invalidate contract.
//!
//! Read path: fast tier, then persistent tier (promoting hits back into the
//! fast tier), then the supplied fetcher, whose result is written through to
//! both tiers. A stale-but-not-expired hit is returned immediately and a
//! background refresh is scheduled instead of making the caller wait
//! (stale-while-revalidate).
//!
//! Build one `SmartCache` at application startup and clone it everywhere;
//! clones share the same tiers, so every call site observes the same state.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::error::{BoxError, CacheError};
use crate::memory::MemoryTier;
use crate::stats::{CacheStats, StatsRecorder};
use crate::store::{EntryStore, PersistedValue, PersistentTier, SqliteStore};

/// Per-call options for [`SmartCache::get`] and friends.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
  /// TTL for a freshly stored value; falls back to the configured default
  pub ttl: Option<Duration>,
  /// Schedule a background refresh when a served entry is stale
  pub background_refresh: bool,
  /// Skip both tiers and go straight to the fetcher
  pub force_refresh: bool,
  /// Fail the call with a timeout error if the fetcher takes longer than
  /// this; the fetch itself is not cancelled
  pub timeout: Option<Duration>,
}

impl GetOptions {
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn with_background_refresh(mut self) -> Self {
    self.background_refresh = true;
    self
  }

  pub fn with_force_refresh(mut self) -> Self {
    self.force_refresh = true;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// Result of an ETag-aware fetch: the data plus an opaque version marker.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
  pub data: T,
  pub etag: Option<String>,
}

struct CacheInner {
  config: CacheConfig,
  memory: Arc<MemoryTier>,
  persistent: PersistentTier,
  /// Last known ETag per key; survives fast-tier eviction
  etags: Mutex<HashMap<String, String>>,
  /// At most one scheduled/in-flight background refresh per key
  refreshes: Mutex<HashMap<String, JoinHandle<()>>>,
  stats: StatsRecorder,
  sweeper: JoinHandle<()>,
}

impl Drop for CacheInner {
  fn drop(&mut self) {
    self.sweeper.abort();
    if let Ok(mut refreshes) = self.refreshes.lock() {
      for (_, handle) in refreshes.drain() {
        handle.abort();
      }
    }
  }
}

/// The tiered cache application code talks to.
///
/// Cheap to clone; clones share tiers, stats, and refresh registrations.
#[derive(Clone)]
pub struct SmartCache {
  inner: Arc<CacheInner>,
}

impl SmartCache {
  /// Create a cache over the given persistent store.
  ///
  /// Must be called inside a tokio runtime: the expired-entry sweeper is
  /// spawned here.
  pub fn new(config: CacheConfig, store: Arc<dyn EntryStore>) -> Self {
    let persistent = if config.persistence_enabled {
      PersistentTier::new(store, config.compression_enabled)
    } else {
      PersistentTier::disabled()
    };
    Self::build(config, persistent)
  }

  /// Create a cache with no persistent tier at all.
  pub fn in_memory_only(config: CacheConfig) -> Self {
    Self::build(config, PersistentTier::disabled())
  }

  /// Create a cache over a SQLite store at the default location.
  pub fn open_default(config: CacheConfig) -> Result<Self, CacheError> {
    let store = Arc::new(SqliteStore::open_default()?);
    Ok(Self::new(config, store))
  }

  fn build(config: CacheConfig, persistent: PersistentTier) -> Self {
    let memory = Arc::new(MemoryTier::new(config.max_entries));

    let sweeper = {
      let memory = Arc::clone(&memory);
      let interval = config.sweep_interval;
      tokio::spawn(async move {
        loop {
          tokio::time::sleep(interval).await;
          let removed = memory.sweep();
          if removed > 0 {
            debug!(removed, "sweep reclaimed expired entries");
          }
        }
      })
    };

    Self {
      inner: Arc::new(CacheInner {
        config,
        memory,
        persistent,
        etags: Mutex::new(HashMap::new()),
        refreshes: Mutex::new(HashMap::new()),
        stats: StatsRecorder::default(),
        sweeper,
      }),
    }
  }

  /// Get a value, consulting the fast tier, then the persistent tier, then
  /// the supplied fetcher.
  ///
  /// A fetcher error on this path propagates to the caller unchanged (as
  /// [`CacheError::Fetch`]); nothing is retried or suppressed. Concurrent
  /// calls for the same missing key each invoke the fetcher - there is no
  /// request coalescing, and the result that resolves last wins.
  pub async fn get<T, F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    options: GetOptions,
  ) -> Result<T, CacheError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
  {
    let fetcher = Arc::new(fetcher);
    let ttl = options.ttl.unwrap_or(self.inner.config.default_ttl);

    if !options.force_refresh {
      if let Some(entry) = self.inner.memory.get(key) {
        self.inner.stats.record_fast_hit();
        if options.background_refresh
          && entry.is_stale(Instant::now(), self.inner.config.stale_fraction)
        {
          self.schedule_refresh(key, ttl, Arc::clone(&fetcher));
        }
        return decode(entry.data);
      }

      if let Some(found) = self.inner.persistent.get(key).await {
        self.inner.stats.record_persistent_hit();
        self.promote(key, &found);
        if options.background_refresh && is_persisted_stale(&found, &self.inner.config) {
          self.schedule_refresh(key, ttl, Arc::clone(&fetcher));
        }
        return decode(found.value);
      }
    }

    self.inner.stats.record_miss();
    let fetched = run_fetch(key, (fetcher)(), options.timeout).await?;
    let json = serde_json::to_value(&fetched)?;
    self.store_both(key, &json, ttl, None).await;
    Ok(fetched)
  }

  /// ETag-aware variant of [`get`](Self::get): the fetcher receives the
  /// previously stored ETag and returns data plus a new one.
  ///
  /// If the returned ETag equals the previous one, the round trip is treated
  /// as a confirmation and the cached data is left untouched.
  pub async fn get_with_etag<T, F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    options: GetOptions,
  ) -> Result<T, CacheError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Fetched<T>, BoxError>> + Send + 'static,
  {
    if !options.force_refresh {
      if let Some(entry) = self.inner.memory.get(key) {
        self.inner.stats.record_fast_hit();
        return decode(entry.data);
      }
      if let Some(found) = self.inner.persistent.get(key).await {
        self.inner.stats.record_persistent_hit();
        self.promote(key, &found);
        return decode(found.value);
      }
    }

    self.inner.stats.record_miss();
    let previous_etag = self.etag_of(key);
    let fetched = run_fetch(key, fetcher(previous_etag.clone()), options.timeout).await?;

    if fetched.etag.is_some() && fetched.etag == previous_etag {
      // Confirmation, not a fresh value: serve whatever is still cached.
      if let Some(entry) = self.inner.memory.get(key) {
        debug!(key, "etag unchanged, cached value confirmed");
        return decode(entry.data);
      }
      if let Some(found) = self.inner.persistent.get(key).await {
        debug!(key, "etag unchanged, cached value confirmed");
        self.promote(key, &found);
        return decode(found.value);
      }
      // Nothing cached anymore; fall through and store the returned data.
    }

    let ttl = options.ttl.unwrap_or(self.inner.config.default_ttl);
    let json = serde_json::to_value(&fetched.data)?;
    self.store_both(key, &json, ttl, fetched.etag).await;
    Ok(fetched.data)
  }

  /// Store a value into both tiers directly.
  pub async fn set<T: Serialize>(
    &self,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
    etag: Option<String>,
  ) -> Result<(), CacheError> {
    let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
    let json = serde_json::to_value(value)?;
    self.store_both(key, &json, ttl, etag).await;
    Ok(())
  }

  /// Remove a key from both tiers and cancel any scheduled background
  /// refresh for it. The fast tier is cleared synchronously, the persistent
  /// tier best-effort.
  pub async fn invalidate(&self, key: &str) {
    self.inner.memory.delete(key);
    self.cancel_refresh(key);
    if let Ok(mut etags) = self.inner.etags.lock() {
      etags.remove(key);
    }
    self.inner.persistent.delete(key).await;
  }

  /// Remove every fast-tier key matching `predicate`, cancelling its
  /// background refresh. Returns the number of keys removed.
  ///
  /// Fast tier only: persistent entries matching the predicate are left to
  /// expire by TTL.
  pub fn invalidate_pattern<P>(&self, predicate: P) -> usize
  where
    P: Fn(&str) -> bool,
  {
    let mut removed = 0;
    for key in self.inner.memory.keys() {
      if !predicate(&key) {
        continue;
      }
      if self.inner.memory.delete(&key) {
        removed += 1;
      }
      self.cancel_refresh(&key);
      if let Ok(mut etags) = self.inner.etags.lock() {
        etags.remove(&key);
      }
    }
    removed
  }

  /// Drop everything: fast tier, ETags, refresh registrations, and (best
  /// effort) the persistent tier.
  pub async fn clear(&self) {
    self.inner.memory.clear();
    if let Ok(mut refreshes) = self.inner.refreshes.lock() {
      for (_, handle) in refreshes.drain() {
        handle.abort();
      }
    }
    if let Ok(mut etags) = self.inner.etags.lock() {
      etags.clear();
    }
    self.inner.persistent.clear().await;
  }

  /// Snapshot of hit/miss/eviction counters.
  pub fn stats(&self) -> CacheStats {
    self.inner.stats.snapshot()
  }

  fn etag_of(&self, key: &str) -> Option<String> {
    self
      .inner
      .etags
      .lock()
      .ok()
      .and_then(|etags| etags.get(key).cloned())
  }

  /// Write a value into both tiers and reconcile the ETag map.
  async fn store_both(&self, key: &str, json: &Value, ttl: Duration, etag: Option<String>) {
    let entry = CacheEntry::new(json.clone(), ttl, etag.clone());
    if self.inner.memory.set(key.to_string(), entry).is_some() {
      self.inner.stats.record_eviction();
    }

    if let Ok(mut etags) = self.inner.etags.lock() {
      match &etag {
        Some(tag) => {
          etags.insert(key.to_string(), tag.clone());
        }
        // A new value without an ETag supersedes any previous marker
        None => {
          etags.remove(key);
        }
      }
    }

    self.inner.persistent.set(key, json, ttl, etag).await;
  }

  /// Copy a persistent-tier hit into the fast tier with its remaining TTL,
  /// so subsequent reads are fast-tier hits and the original expiry holds.
  fn promote(&self, key: &str, found: &PersistedValue) {
    let entry = CacheEntry::new(found.value.clone(), found.remaining_ttl, found.etag.clone());
    if self.inner.memory.set(key.to_string(), entry).is_some() {
      self.inner.stats.record_eviction();
    }
    if let Some(tag) = &found.etag {
      if let Ok(mut etags) = self.inner.etags.lock() {
        etags.insert(key.to_string(), tag.clone());
      }
    }
  }

  /// Register a background refresh for `key` unless one is already
  /// scheduled or in flight.
  ///
  /// The task refetches every configured interval, overwriting both tiers
  /// on success. On the first failure it ends silently - no caller is
  /// waiting, and the cached value stays authoritative until it expires or
  /// a later read schedules a fresh attempt.
  fn schedule_refresh<T, F, Fut>(&self, key: &str, ttl: Duration, fetcher: Arc<F>)
  where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
  {
    let mut refreshes = match self.inner.refreshes.lock() {
      Ok(guard) => guard,
      Err(_) => return,
    };
    if refreshes.contains_key(key) {
      return;
    }

    let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
    let interval = self.inner.config.background_refresh_interval;
    let task_key = key.to_string();
    // Anchor the first deadline now, not at the task's first poll, so the
    // interval is measured from the stale read that scheduled the refresh.
    let first_tick = tokio::time::sleep(interval);

    let handle = tokio::spawn(async move {
      first_tick.await;
      loop {
        let Some(inner) = weak.upgrade() else {
          return;
        };

        match (fetcher)().await {
          Ok(value) => match serde_json::to_value(&value) {
            Ok(json) => {
              let entry = CacheEntry::new(json.clone(), ttl, None);
              if inner.memory.set(task_key.clone(), entry).is_some() {
                inner.stats.record_eviction();
              }
              inner.persistent.set(&task_key, &json, ttl, None).await;
              inner.stats.record_background_refresh();
              debug!(key = %task_key, "background refresh stored fresh value");
            }
            Err(e) => {
              warn!(key = %task_key, error = %e, "background refresh could not serialize value");
              break;
            }
          },
          Err(e) => {
            debug!(key = %task_key, error = %e, "background refresh fetch failed, dropping");
            break;
          }
        }

        tokio::time::sleep(interval).await;
      }

      if let Some(inner) = weak.upgrade() {
        if let Ok(mut refreshes) = inner.refreshes.lock() {
          refreshes.remove(&task_key);
        }
      }
    });

    refreshes.insert(key.to_string(), handle);
  }

  fn cancel_refresh(&self, key: &str) {
    if let Ok(mut refreshes) = self.inner.refreshes.lock() {
      if let Some(handle) = refreshes.remove(key) {
        handle.abort();
      }
    }
  }
}

/// Staleness of a persistent-tier hit, derived from how much of its TTL is
/// already spent.
fn is_persisted_stale(found: &PersistedValue, config: &CacheConfig) -> bool {
  let age = found.ttl.saturating_sub(found.remaining_ttl);
  age > config.stale_after(found.ttl)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, CacheError> {
  Ok(serde_json::from_value(value)?)
}

/// Run a fetcher future, racing it against the optional timeout.
///
/// With a timeout the fetch runs on its own task, so losing the race does
/// not cancel it; the late result is simply discarded.
async fn run_fetch<T, Fut>(key: &str, fut: Fut, timeout: Option<Duration>) -> Result<T, CacheError>
where
  T: Send + 'static,
  Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
{
  match timeout {
    Some(limit) => {
      let handle = tokio::spawn(fut);
      match tokio::time::timeout(limit, handle).await {
        Ok(Ok(result)) => result.map_err(|e| CacheError::Fetch {
          key: key.to_string(),
          source: e,
        }),
        Ok(Err(join_error)) => Err(CacheError::Fetch {
          key: key.to_string(),
          source: Box::new(join_error),
        }),
        Err(_) => Err(CacheError::Timeout {
          key: key.to_string(),
          timeout: limit,
        }),
      }
    }
    None => fut.await.map_err(|e| CacheError::Fetch {
      key: key.to_string(),
      source: e,
    }),
  }
}
