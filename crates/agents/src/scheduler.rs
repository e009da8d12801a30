//! Bounded priority queue of run IDs with a worker pool.
//!
//! Priority order: interactive < normal < batch; FIFO within a priority.
//! Two backends share the interface: an in-memory heap and a SQLite
//! `run_queue` table whose rows are claimed inside `BEGIN IMMEDIATE`
//! transactions. Interrupted claims (`running` rows) are reset to
//! `queued` on startup and on scheduler stop.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;

use lmx_domain::config::{QueueBackend, SchedulerConfig};
use lmx_domain::{Error, Result};

use crate::models::RunPriority;

pub type RunHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

type QueueEntry = (u8, u64, String);

enum Backend {
    Memory {
        heap: Arc<Mutex<BinaryHeap<Reverse<QueueEntry>>>>,
        notify: Arc<Notify>,
    },
    Sqlite {
        db: SqliteRunQueue,
    },
}

pub struct RunScheduler {
    backend: Backend,
    max_queue_size: usize,
    worker_count: usize,
    sequence: AtomicU64,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RunScheduler {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let backend = match config.backend {
            QueueBackend::Memory => Backend::Memory {
                heap: Arc::new(Mutex::new(BinaryHeap::new())),
                notify: Arc::new(Notify::new()),
            },
            QueueBackend::Sqlite => {
                let path = config.persist_path.clone().ok_or_else(|| {
                    Error::Validation("agents.scheduler.persist_path is required".into())
                })?;
                let db = SqliteRunQueue::open(path)?;
                db.recover_running_rows()?;
                Backend::Sqlite { db }
            }
        };
        Ok(Self {
            backend,
            max_queue_size: config.max_queue_size.max(1),
            worker_count: config.worker_count.max(1),
            sequence: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    pub fn queue_size(&self) -> usize {
        match &self.backend {
            Backend::Memory { heap, .. } => heap.lock().len(),
            Backend::Sqlite { db } => db.count_queued().unwrap_or(0),
        }
    }

    /// Start the worker pool. Idempotent.
    pub fn start(&self, handler: RunHandler) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = self.workers.lock();
        for worker_index in 0..self.worker_count {
            let handler = handler.clone();
            let running = self.running.clone();
            match &self.backend {
                Backend::Memory { heap, notify } => {
                    let heap = heap.clone();
                    let notify = notify.clone();
                    workers.push(tokio::spawn(async move {
                        loop {
                            if !running.load(Ordering::Acquire) {
                                return;
                            }
                            let next = heap.lock().pop();
                            match next {
                                Some(Reverse((_, _, run_id))) => handler(run_id).await,
                                None => {
                                    let _ = tokio::time::timeout(
                                        POLL_INTERVAL,
                                        notify.notified(),
                                    )
                                    .await;
                                }
                            }
                        }
                    }));
                }
                Backend::Sqlite { db } => {
                    let db = db.clone();
                    workers.push(tokio::spawn(async move {
                        loop {
                            if !running.load(Ordering::Acquire) {
                                return;
                            }
                            let claimed = {
                                let db = db.clone();
                                tokio::task::spawn_blocking(move || db.claim_next()).await
                            };
                            match claimed {
                                Ok(Ok(Some((row_id, run_id)))) => {
                                    handler(run_id).await;
                                    let db = db.clone();
                                    let _ = tokio::task::spawn_blocking(move || {
                                        db.complete(row_id)
                                    })
                                    .await;
                                }
                                Ok(Ok(None)) => {
                                    tokio::time::sleep(POLL_INTERVAL).await;
                                }
                                Ok(Err(e)) => {
                                    tracing::warn!(
                                        worker = worker_index,
                                        error = %e,
                                        "run queue claim failed"
                                    );
                                    tokio::time::sleep(POLL_INTERVAL).await;
                                }
                                Err(_) => return,
                            }
                        }
                    }));
                }
            }
        }
    }

    /// Stop workers. Claimed-but-unfinished SQLite rows return to
    /// `queued` for the next start.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }
        if let Backend::Sqlite { db } = &self.backend {
            if let Err(e) = db.recover_running_rows() {
                tracing::warn!(error = %e, "run queue recovery on stop failed");
            }
        }
    }

    /// Queue a run for the workers. Fails fast when saturated.
    pub fn submit(&self, run_id: &str, priority: RunPriority) -> Result<()> {
        if !self.is_running() {
            return Err(Error::Internal("scheduler is not running".into()));
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        match &self.backend {
            Backend::Memory { heap, notify } => {
                let mut heap = heap.lock();
                if heap.len() >= self.max_queue_size {
                    return Err(Error::QueueFull {
                        size: heap.len(),
                        capacity: self.max_queue_size,
                    });
                }
                heap.push(Reverse((priority.rank(), sequence, run_id.to_string())));
                drop(heap);
                notify.notify_one();
                Ok(())
            }
            Backend::Sqlite { db } => {
                let queued = db.count_queued()?;
                if queued >= self.max_queue_size {
                    return Err(Error::QueueFull {
                        size: queued,
                        capacity: self.max_queue_size,
                    });
                }
                db.enqueue(run_id, priority.rank(), sequence)
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SQLite queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
struct SqliteRunQueue {
    path: PathBuf,
}

fn sqlite_err(e: rusqlite::Error) -> Error {
    Error::Internal(format!("run queue: {e}"))
}

fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl SqliteRunQueue {
    fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let queue = Self { path };
        queue
            .connect()?
            .execute_batch(
                "PRAGMA journal_mode=WAL;
                 CREATE TABLE IF NOT EXISTS run_queue (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     run_id TEXT NOT NULL,
                     priority INTEGER NOT NULL,
                     sequence INTEGER NOT NULL,
                     status TEXT NOT NULL DEFAULT 'queued',
                     enqueued_at REAL NOT NULL,
                     claimed_at REAL
                 );
                 CREATE INDEX IF NOT EXISTS idx_run_queue_status_priority
                 ON run_queue(status, priority, sequence, id);",
            )
            .map_err(sqlite_err)?;
        Ok(queue)
    }

    fn connect(&self) -> Result<rusqlite::Connection> {
        rusqlite::Connection::open(&self.path).map_err(sqlite_err)
    }

    fn recover_running_rows(&self) -> Result<()> {
        self.connect()?
            .execute(
                "UPDATE run_queue SET status='queued', claimed_at=NULL WHERE status='running'",
                [],
            )
            .map_err(sqlite_err)?;
        Ok(())
    }

    fn count_queued(&self) -> Result<usize> {
        let count: i64 = self
            .connect()?
            .query_row(
                "SELECT COUNT(1) FROM run_queue WHERE status='queued'",
                [],
                |row| row.get(0),
            )
            .map_err(sqlite_err)?;
        Ok(count as usize)
    }

    fn enqueue(&self, run_id: &str, priority: u8, sequence: u64) -> Result<()> {
        self.connect()?
            .execute(
                "INSERT INTO run_queue(run_id, priority, sequence, status, enqueued_at)
                 VALUES (?1, ?2, ?3, 'queued', ?4)",
                rusqlite::params![run_id, priority, sequence as i64, now_epoch()],
            )
            .map_err(sqlite_err)?;
        Ok(())
    }

    fn claim_next(&self) -> Result<Option<(i64, String)>> {
        let mut con = self.connect()?;
        let tx = con
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(sqlite_err)?;
        let row = tx
            .query_row(
                "SELECT id, run_id FROM run_queue
                 WHERE status='queued'
                 ORDER BY priority ASC, sequence ASC, id ASC
                 LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(sqlite_err(other)),
            })?;

        if let Some((row_id, _)) = &row {
            tx.execute(
                "UPDATE run_queue SET status='running', claimed_at=?1 WHERE id=?2",
                rusqlite::params![now_epoch(), row_id],
            )
            .map_err(sqlite_err)?;
        }
        tx.commit().map_err(sqlite_err)?;
        Ok(row)
    }

    fn complete(&self, row_id: i64) -> Result<()> {
        self.connect()?
            .execute("DELETE FROM run_queue WHERE id=?1", [row_id])
            .map_err(sqlite_err)?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn memory_config(max: usize, workers: usize) -> SchedulerConfig {
        SchedulerConfig {
            backend: QueueBackend::Memory,
            max_queue_size: max,
            worker_count: workers,
            persist_path: None,
        }
    }

    #[tokio::test]
    async fn submit_requires_running() {
        let scheduler = RunScheduler::new(&memory_config(8, 1)).unwrap();
        assert!(scheduler.submit("r1", RunPriority::Normal).is_err());
    }

    #[tokio::test]
    async fn workers_process_submissions() {
        let scheduler = RunScheduler::new(&memory_config(8, 2)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: RunHandler = Arc::new(move |run_id| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(run_id);
            })
        });
        scheduler.start(handler);
        scheduler.submit("r1", RunPriority::Normal).unwrap();
        scheduler.submit("r2", RunPriority::Normal).unwrap();

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(seen, vec!["r1", "r2"]);
        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn priority_beats_fifo_across_classes() {
        let scheduler = Arc::new(RunScheduler::new(&memory_config(8, 1)).unwrap());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = mpsc::unbounded_channel::<()>();
        let gate_rx = Arc::new(tokio::sync::Mutex::new(gate_rx));

        let handler: RunHandler = Arc::new(move |run_id| {
            let started_tx = started_tx.clone();
            let gate_rx = gate_rx.clone();
            Box::pin(async move {
                let _ = started_tx.send(run_id);
                let _ = gate_rx.lock().await.recv().await;
            })
        });
        scheduler.start(handler);

        // The single worker picks up "first" and blocks on the gate.
        scheduler.submit("first", RunPriority::Normal).unwrap();
        assert_eq!(started_rx.recv().await.unwrap(), "first");

        // While the worker is busy, lower- and higher-priority runs queue.
        scheduler.submit("batch", RunPriority::Batch).unwrap();
        scheduler
            .submit("interactive", RunPriority::Interactive)
            .unwrap();

        gate_tx.send(()).unwrap(); // release "first"
        assert_eq!(started_rx.recv().await.unwrap(), "interactive");
        gate_tx.send(()).unwrap();
        assert_eq!(started_rx.recv().await.unwrap(), "batch");
        gate_tx.send(()).unwrap();
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn saturation_reports_capacity() {
        let scheduler = RunScheduler::new(&memory_config(1, 1)).unwrap();
        // Start with a handler that never finishes so the queue backs up.
        let handler: RunHandler = Arc::new(|_| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        });
        scheduler.start(handler);
        // One run occupies the worker, the next fills the queue.
        scheduler.submit("a", RunPriority::Normal).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.submit("b", RunPriority::Normal).unwrap();
        let err = scheduler.submit("c", RunPriority::Normal).unwrap_err();
        assert!(matches!(
            err,
            Error::QueueFull {
                capacity: 1,
                ..
            }
        ));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn sqlite_claim_respects_priority_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteRunQueue::open(dir.path().join("runs.db")).unwrap();
        db.enqueue("normal", 1, 0).unwrap();
        db.enqueue("batch", 2, 1).unwrap();
        db.enqueue("interactive", 0, 2).unwrap();

        let (row_id, run_id) = db.claim_next().unwrap().unwrap();
        assert_eq!(run_id, "interactive");

        // A second claim skips the running row.
        let (_, second) = db.claim_next().unwrap().unwrap();
        assert_eq!(second, "normal");

        // Recovery re-queues claimed rows.
        db.recover_running_rows().unwrap();
        let (_, reclaimed) = db.claim_next().unwrap().unwrap();
        assert_eq!(reclaimed, "interactive");

        db.complete(row_id).unwrap();
    }

    #[tokio::test]
    async fn sqlite_scheduler_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = SchedulerConfig {
            backend: QueueBackend::Sqlite,
            max_queue_size: 8,
            worker_count: 1,
            persist_path: Some(dir.path().join("runs.db")),
        };
        let scheduler = RunScheduler::new(&config).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: RunHandler = Arc::new(move |run_id| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(run_id);
            })
        });
        scheduler.start(handler);
        scheduler.submit("r1", RunPriority::Normal).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "r1");
        scheduler.stop().await;
        assert_eq!(scheduler.queue_size(), 0);
    }
}
