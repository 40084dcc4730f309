//! The cached-value envelope shared by both tiers.

use std::time::Duration;
use tokio::time::Instant;

/// A cached value plus the metadata needed for TTL, staleness, and LRU
/// decisions.
///
/// Entries are immutable once stored except for `access_count` and
/// `last_accessed_at`, which are updated on every read.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  /// The cached value
  pub data: T,
  /// When the entry was stored
  pub stored_at: Instant,
  /// How long the entry stays valid
  pub ttl: Duration,
  /// Opaque version marker from the last fetch, if any
  pub etag: Option<String>,
  /// Number of reads since the entry was stored
  pub access_count: u64,
  /// When the entry was last read (or stored, if never read)
  pub last_accessed_at: Instant,
}

impl<T> CacheEntry<T> {
  /// Create an entry stored "now".
  pub fn new(data: T, ttl: Duration, etag: Option<String>) -> Self {
    let now = Instant::now();
    Self {
      data,
      stored_at: now,
      ttl,
      etag,
      access_count: 0,
      last_accessed_at: now,
    }
  }

  /// Age of the entry at `now`.
  pub fn age(&self, now: Instant) -> Duration {
    now.duration_since(self.stored_at)
  }

  /// An entry is expired once its age exceeds its TTL.
  pub fn is_expired(&self, now: Instant) -> bool {
    self.age(now) > self.ttl
  }

  /// An entry is stale (eligible for background refresh) once its age
  /// exceeds `ttl * stale_fraction`.
  pub fn is_stale(&self, now: Instant, stale_fraction: f64) -> bool {
    self.age(now) > self.ttl.mul_f64(stale_fraction.clamp(0.0, 1.0))
  }

  /// Record a read.
  pub(crate) fn touch(&mut self, now: Instant) {
    self.access_count += 1;
    self.last_accessed_at = now;
  }
}
