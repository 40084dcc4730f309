//! Offline write queue: an ordered, persistent list of pending writes
//! recorded while the remote backend is unreachable.
//!
//! Items are opaque JSON payloads; the queue never interprets them. Drains
//! replay items strictly in insertion order through a caller-supplied writer
//! and stop on the first failure, leaving the failed item and everything
//! behind it untouched. Removals are committed in one transaction at the end
//! of the drain, so a crash mid-drain leaves every unconfirmed item in place
//! (at-least-once delivery; idempotency is the caller's concern).

use rusqlite::{params, Connection};
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{BoxError, CacheError};

/// A queued write awaiting replay.
#[derive(Debug, Clone)]
pub struct PendingWrite {
  pub id: i64,
  pub payload: Value,
}

/// Outcome of a completed drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
  pub drained: usize,
  pub remaining: usize,
}

/// Schema for the pending-write table. Insertion order is the rowid order.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_writes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload BLOB NOT NULL,
    enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// The persistent offline buffer.
///
/// Cheap to clone; clones share the same underlying queue.
#[derive(Clone)]
pub struct WriteQueue {
  conn: Arc<Mutex<Connection>>,
  draining: Arc<AtomicBool>,
}

/// Resets the drain flag even if the writer panics mid-drain.
struct DrainGuard(Arc<AtomicBool>);

impl Drop for DrainGuard {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl WriteQueue {
  /// Open or create the queue database at `path`.
  pub fn open(path: &Path) -> Result<Self, CacheError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| CacheError::Persistence(format!("failed to create queue directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::Persistence(format!("failed to open queue database at {}: {}", path.display(), e))
    })?;
    Self::from_connection(conn)
  }

  /// Open an in-memory queue. Mainly useful in tests.
  pub fn open_in_memory() -> Result<Self, CacheError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, CacheError> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| CacheError::Persistence(format!("failed to run queue migrations: {}", e)))?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
      draining: Arc::new(AtomicBool::new(false)),
    })
  }

  fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CacheError> {
    self
      .conn
      .lock()
      .map_err(|_| CacheError::Persistence("lock poisoned".into()))
  }

  /// Append a payload to the back of the queue. Returns its queue id.
  pub fn enqueue(&self, payload: &Value) -> Result<i64, CacheError> {
    let data = serde_json::to_vec(payload)?;
    let conn = self.lock_conn()?;
    conn.execute("INSERT INTO pending_writes (payload) VALUES (?)", params![data])?;
    Ok(conn.last_insert_rowid())
  }

  /// All queued items in insertion order.
  pub fn peek_all(&self) -> Result<Vec<PendingWrite>, CacheError> {
    let conn = self.lock_conn()?;
    let mut stmt = conn.prepare("SELECT id, payload FROM pending_writes ORDER BY id")?;

    let rows = stmt.query_map([], |row| {
      let id: i64 = row.get(0)?;
      let data: Vec<u8> = row.get(1)?;
      Ok((id, data))
    })?;

    let mut items = Vec::new();
    for row in rows {
      let (id, data) = row?;
      items.push(PendingWrite {
        id,
        payload: serde_json::from_slice(&data)?,
      });
    }
    Ok(items)
  }

  /// Number of queued items.
  pub fn len(&self) -> Result<usize, CacheError> {
    let conn = self.lock_conn()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM pending_writes", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool, CacheError> {
    Ok(self.len()? == 0)
  }

  /// Drop every queued item without replaying it.
  pub fn clear(&self) -> Result<(), CacheError> {
    let conn = self.lock_conn()?;
    conn.execute("DELETE FROM pending_writes", [])?;
    Ok(())
  }

  /// Replay queued items through `writer` in FIFO order, stopping on the
  /// first failure.
  ///
  /// Items the writer accepted are removed in one transaction when the
  /// drain ends (whether it completed or halted), so the failed item and
  /// everything behind it survive in order for the next drain. Only one
  /// drain runs at a time; an overlapping call is a no-op.
  pub async fn drain<W, Fut>(&self, writer: W) -> Result<DrainReport, CacheError>
  where
    W: Fn(Value) -> Fut,
    Fut: Future<Output = Result<(), BoxError>>,
  {
    if self.draining.swap(true, Ordering::SeqCst) {
      debug!("drain already in progress, skipping");
      return Ok(DrainReport {
        drained: 0,
        remaining: self.len()?,
      });
    }
    let _guard = DrainGuard(Arc::clone(&self.draining));

    let items = self.peek_all()?;
    let total = items.len();
    let mut succeeded: Vec<i64> = Vec::with_capacity(total);

    for item in items {
      match writer(item.payload).await {
        Ok(()) => succeeded.push(item.id),
        Err(e) => {
          let drained = succeeded.len();
          self.remove_batch(&succeeded)?;
          warn!(item_id = item.id, error = %e, "queued write failed, drain halted");
          return Err(CacheError::QueueDrain {
            remaining: total - drained,
            source: e,
          });
        }
      }
    }

    self.remove_batch(&succeeded)?;
    if !succeeded.is_empty() {
      debug!(drained = succeeded.len(), "write queue drained");
    }
    Ok(DrainReport {
      drained: succeeded.len(),
      remaining: 0,
    })
  }

  /// Remove confirmed items in a single transaction.
  fn remove_batch(&self, ids: &[i64]) -> Result<(), CacheError> {
    if ids.is_empty() {
      return Ok(());
    }

    let conn = self.lock_conn()?;
    conn.execute("BEGIN TRANSACTION", [])?;
    for id in ids {
      conn.execute("DELETE FROM pending_writes WHERE id = ?", params![id])?;
    }
    conn.execute("COMMIT", [])?;
    Ok(())
  }

  /// Spawn a task that drains the queue on every offline-to-online
  /// transition of the connectivity signal.
  pub fn watch_connectivity<W, Fut>(&self, mut rx: watch::Receiver<bool>, writer: W) -> JoinHandle<()>
  where
    W: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
  {
    let queue = self.clone();
    // Snapshot the baseline at subscription time so a transition arriving
    // before the task's first poll is still seen as an edge.
    let mut online = *rx.borrow();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let now_online = *rx.borrow();
        if now_online && !online {
          debug!("connectivity restored, draining write queue");
          if let Err(e) = queue.drain(&writer).await {
            warn!(error = %e, "reconnect drain halted");
          }
        }
        online = now_online;
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::time::Duration;

  fn item(op: &str) -> Value {
    json!({ "op": op })
  }

  #[tokio::test]
  async fn test_enqueue_preserves_insertion_order() {
    let queue = WriteQueue::open_in_memory().unwrap();
    queue.enqueue(&item("A")).unwrap();
    queue.enqueue(&item("B")).unwrap();
    queue.enqueue(&item("C")).unwrap();

    let items: Vec<Value> = queue.peek_all().unwrap().into_iter().map(|i| i.payload).collect();
    assert_eq!(items, vec![item("A"), item("B"), item("C")]);
    assert_eq!(queue.len().unwrap(), 3);
  }

  #[tokio::test]
  async fn test_fifo_partial_drain_preserves_failed_and_following() {
    let queue = WriteQueue::open_in_memory().unwrap();
    queue.enqueue(&item("A")).unwrap();
    queue.enqueue(&item("B")).unwrap();
    queue.enqueue(&item("C")).unwrap();

    // Writer that rejects B
    let result = queue
      .drain(|payload: Value| async move {
        if payload == json!({ "op": "B" }) {
          Err::<(), BoxError>("validation failed".into())
        } else {
          Ok(())
        }
      })
      .await;

    match result {
      Err(CacheError::QueueDrain { remaining, .. }) => assert_eq!(remaining, 2),
      other => panic!("expected QueueDrain error, got {:?}", other.map(|r| r.drained)),
    }

    // A removed; B and C preserved in original order
    let items: Vec<Value> = queue.peek_all().unwrap().into_iter().map(|i| i.payload).collect();
    assert_eq!(items, vec![item("B"), item("C")]);

    // A second drain with a succeeding writer empties the queue
    let report = queue.drain(|_| async { Ok::<(), BoxError>(()) }).await.unwrap();
    assert_eq!(report, DrainReport { drained: 2, remaining: 0 });
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_drain_empty_queue_is_a_noop() {
    let queue = WriteQueue::open_in_memory().unwrap();
    let report = queue.drain(|_| async { Ok::<(), BoxError>(()) }).await.unwrap();
    assert_eq!(report, DrainReport { drained: 0, remaining: 0 });
  }

  #[tokio::test]
  async fn test_items_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    {
      let queue = WriteQueue::open(&path).unwrap();
      queue.enqueue(&item("A")).unwrap();
      queue.enqueue(&item("B")).unwrap();
    }

    let queue = WriteQueue::open(&path).unwrap();
    let items: Vec<Value> = queue.peek_all().unwrap().into_iter().map(|i| i.payload).collect();
    assert_eq!(items, vec![item("A"), item("B")]);
  }

  #[tokio::test]
  async fn test_clear_drops_everything() {
    let queue = WriteQueue::open_in_memory().unwrap();
    queue.enqueue(&item("A")).unwrap();
    queue.clear().unwrap();
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_reconnect_transition_triggers_drain() {
    let queue = WriteQueue::open_in_memory().unwrap();
    queue.enqueue(&item("A")).unwrap();
    queue.enqueue(&item("B")).unwrap();

    let (tx, rx) = watch::channel(false);
    let handle = queue.watch_connectivity(rx, |_| async { Ok::<(), BoxError>(()) });

    tx.send(true).unwrap();

    // Give the watcher a moment to run the drain
    let mut drained = false;
    for _ in 0..50 {
      tokio::time::sleep(Duration::from_millis(10)).await;
      if queue.is_empty().unwrap() {
        drained = true;
        break;
      }
    }
    assert!(drained, "queue should drain after the offline-to-online transition");

    handle.abort();
  }

  #[tokio::test]
  async fn test_online_to_online_does_not_redrain() {
    let queue = WriteQueue::open_in_memory().unwrap();

    let (tx, rx) = watch::channel(true);
    let calls = Arc::new(AtomicBool::new(false));
    let calls_clone = Arc::clone(&calls);
    let handle = queue.watch_connectivity(rx, move |_| {
      calls_clone.store(true, Ordering::SeqCst);
      async { Ok::<(), BoxError>(()) }
    });

    queue.enqueue(&item("A")).unwrap();
    // Re-announcing "online" is not a transition
    tx.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!calls.load(Ordering::SeqCst));
    assert_eq!(queue.len().unwrap(), 1);

    handle.abort();
  }
}
