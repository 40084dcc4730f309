//! Tiered caching and offline-resilience layer for applications backed by a
//! remote data source.
//!
//! The crate is a generic, key-addressed caching engine: it never interprets
//! what a cached payload means. It composes two tiers behind one contract:
//!
//! - a fast in-process tier with per-entry TTL and LRU eviction, and
//! - a persistent (SQLite-backed) tier that survives restarts and is always
//!   best-effort - it can be wiped with no correctness impact, because every
//!   cached value has a fetcher capable of regenerating it.
//!
//! [`SmartCache`] is the entry point for reads: it serves from memory, falls
//! back to the persistent store (promoting hits), and only then calls the
//! supplied fetcher, writing results through to both tiers. Stale entries
//! are served immediately while a background refresh updates them
//! (stale-while-revalidate), and an ETag-aware variant skips re-storing data
//! the backend confirms unchanged.
//!
//! [`WriteQueue`] buffers writes made while the backend is unreachable and
//! replays them in order when connectivity returns, stopping at the first
//! failure so nothing is lost or reordered.
//!
//! # Example
//!
//! ```ignore
//! use offcache::{CacheConfig, GetOptions, SmartCache};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Build one cache at startup and clone it everywhere.
//!     let cache = SmartCache::open_default(CacheConfig::default())?;
//!
//!     let products: Vec<Product> = cache
//!         .get(
//!             "products:branch1",
//!             || async { backend::list_products("branch1").await },
//!             GetOptions::default().with_background_refresh(),
//!         )
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

mod cache;
mod config;
mod entry;
mod error;
pub mod key;
mod memory;
mod queue;
mod stats;
mod store;

pub use cache::{Fetched, GetOptions, SmartCache};
pub use config::CacheConfig;
pub use entry::CacheEntry;
pub use error::{BoxError, CacheError};
pub use memory::MemoryTier;
pub use queue::{DrainReport, PendingWrite, WriteQueue};
pub use stats::CacheStats;
pub use store::{EntryStore, PersistedValue, PersistentTier, SqliteStore, StoredEntry};
