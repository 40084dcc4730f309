//! Hit/miss/eviction counters exposed for observability.
//!
//! Purely observational - nothing in the cache changes behavior based on
//! these numbers.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Internal atomic counters, shared by the orchestrator and its background
/// tasks.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
  fast_hits: AtomicU64,
  persistent_hits: AtomicU64,
  misses: AtomicU64,
  evictions: AtomicU64,
  background_refreshes: AtomicU64,
}

impl StatsRecorder {
  pub fn record_fast_hit(&self) {
    self.fast_hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_persistent_hit(&self) {
    self.persistent_hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_miss(&self) {
    self.misses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_eviction(&self) {
    self.evictions.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_background_refresh(&self) {
    self.background_refreshes.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> CacheStats {
    CacheStats {
      fast_hits: self.fast_hits.load(Ordering::Relaxed),
      persistent_hits: self.persistent_hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
      background_refreshes: self.background_refreshes.load(Ordering::Relaxed),
    }
  }
}

/// Point-in-time snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  /// Reads served from the in-memory tier
  pub fast_hits: u64,
  /// Reads served from the persistent tier (and promoted)
  pub persistent_hits: u64,
  /// Reads that fell through to the fetcher
  pub misses: u64,
  /// Entries evicted from the fast tier by the LRU bound
  pub evictions: u64,
  /// Successful background refreshes
  pub background_refreshes: u64,
}

impl CacheStats {
  /// Total reads observed by the cache.
  pub fn total_reads(&self) -> u64 {
    self.fast_hits + self.persistent_hits + self.misses
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_snapshot_reflects_counters() {
    let recorder = StatsRecorder::default();
    recorder.record_fast_hit();
    recorder.record_fast_hit();
    recorder.record_persistent_hit();
    recorder.record_miss();
    recorder.record_eviction();

    let stats = recorder.snapshot();
    assert_eq!(stats.fast_hits, 2);
    assert_eq!(stats.persistent_hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.background_refreshes, 0);
    assert_eq!(stats.total_reads(), 4);
  }
}
