//! Error taxonomy for the cache and the write queue.
//!
//! Only two variants ever reach application code: `Fetch` (the supplied
//! fetcher failed on the synchronous miss path) and `Timeout`. Persistence
//! failures are absorbed by the tiers; `QueueDrain` reaches whoever invoked
//! the drain.

use std::time::Duration;
use thiserror::Error;

/// Boxed error type fetchers and queue writers return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum CacheError {
  /// The fetcher for a cache miss failed. Distinct from [`Timeout`] so
  /// callers can tell "backend returned an error" from "backend never
  /// answered".
  ///
  /// [`Timeout`]: CacheError::Timeout
  #[error("fetch for key '{key}' failed: {source}")]
  Fetch { key: String, source: BoxError },

  /// A persistent-store operation failed. Never propagated out of the
  /// cache; surfaced only from direct store usage.
  #[error("persistence error: {0}")]
  Persistence(String),

  /// A fetch exceeded its per-call time limit.
  #[error("fetch for key '{key}' timed out after {timeout:?}")]
  Timeout { key: String, timeout: Duration },

  /// A queued write was rejected during a drain. The failed item and
  /// everything queued after it remain in the queue.
  #[error("queue drain halted with {remaining} item(s) pending: {source}")]
  QueueDrain { remaining: usize, source: BoxError },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for CacheError {
  fn from(e: rusqlite::Error) -> Self {
    CacheError::Persistence(e.to_string())
  }
}
