//! Cache configuration.

use serde::Deserialize;
use std::time::Duration;

/// Configuration for the tiered cache and its background tasks.
///
/// Deserializable so applications can embed a cache section in their own
/// config file; every field has a documented default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Maximum number of entries in the fast (in-memory) tier
  pub max_entries: usize,
  /// TTL applied when a call does not specify one
  pub default_ttl: Duration,
  /// Fraction of the TTL after which an entry is considered stale and
  /// eligible for background refresh (clamped to 0..=1)
  pub stale_fraction: f64,
  /// Interval between background refresh attempts for a registered key
  pub background_refresh_interval: Duration,
  /// Interval between proactive sweeps of expired fast-tier entries
  pub sweep_interval: Duration,
  /// Compress payloads with zstd before persisting
  pub compression_enabled: bool,
  /// Write entries through to the persistent tier
  pub persistence_enabled: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_entries: 500,
      default_ttl: Duration::from_secs(300),
      stale_fraction: 0.8,
      background_refresh_interval: Duration::from_secs(60),
      sweep_interval: Duration::from_secs(60),
      compression_enabled: false,
      persistence_enabled: true,
    }
  }
}

impl CacheConfig {
  /// The staleness threshold for a given TTL.
  pub fn stale_after(&self, ttl: Duration) -> Duration {
    ttl.mul_f64(self.stale_fraction.clamp(0.0, 1.0))
  }
}
