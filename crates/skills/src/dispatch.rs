//! Skill dispatchers — local (inline) and queue-backed execution paths.
//!
//! The queued dispatcher supports an in-memory queue and a SQLite-backed
//! one with the same claim semantics as the run scheduler: rows are
//! claimed inside a `BEGIN IMMEDIATE` transaction, interrupted claims are
//! reset to `queued` on startup and shutdown, and saturation surfaces as
//! a queue-full error that the HTTP layer maps to 429 with
//! `Retry-After`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use lmx_domain::config::{QueueBackend, SkillDispatcherConfig};
use lmx_domain::{Error, Result};

use crate::executor::{Arguments, SkillExecutionResult, SkillExecutor};
use crate::manifest::SkillManifest;

/// Advisory retry hint returned with queue-full rejections.
pub const DISPATCH_RETRY_AFTER_SEC: u64 = 5;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait SkillDispatcher: Send + Sync {
    async fn execute(
        &self,
        manifest: &SkillManifest,
        arguments: Arguments,
        approved: bool,
        timeout: Option<Duration>,
    ) -> Result<SkillExecutionResult>;

    async fn close(&self);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Local dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LocalSkillDispatcher {
    executor: Arc<SkillExecutor>,
}

impl LocalSkillDispatcher {
    pub fn new(executor: Arc<SkillExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl SkillDispatcher for LocalSkillDispatcher {
    async fn execute(
        &self,
        manifest: &SkillManifest,
        arguments: Arguments,
        approved: bool,
        timeout: Option<Duration>,
    ) -> Result<SkillExecutionResult> {
        Ok(self
            .executor
            .execute(manifest, arguments, approved, timeout)
            .await)
    }

    async fn close(&self) {}
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queued dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct QueuedCall {
    manifest: SkillManifest,
    arguments: Arguments,
    approved: bool,
    timeout: Option<Duration>,
    responder: oneshot::Sender<SkillExecutionResult>,
}

enum QueueState {
    Memory {
        sender: mpsc::Sender<QueuedCall>,
        depth: Arc<AtomicUsize>,
    },
    Sqlite {
        db: SqliteQueue,
        futures: Arc<Mutex<HashMap<String, oneshot::Sender<SkillExecutionResult>>>>,
    },
}

pub struct QueuedSkillDispatcher {
    executor: Arc<SkillExecutor>,
    max_queue_size: usize,
    state: QueueState,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl QueuedSkillDispatcher {
    pub fn start(
        executor: Arc<SkillExecutor>,
        config: &SkillDispatcherConfig,
    ) -> Result<Arc<Self>> {
        let worker_count = config.worker_count.max(1);
        let max_queue_size = config.max_queue_size.max(1);

        match config.backend {
            QueueBackend::Memory => {
                let (sender, receiver) = mpsc::channel::<QueuedCall>(max_queue_size);
                let depth = Arc::new(AtomicUsize::new(0));
                let dispatcher = Arc::new(Self {
                    executor,
                    max_queue_size,
                    state: QueueState::Memory {
                        sender,
                        depth: depth.clone(),
                    },
                    workers: Mutex::new(Vec::new()),
                });

                let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
                let mut workers = Vec::with_capacity(worker_count);
                for _ in 0..worker_count {
                    let receiver = receiver.clone();
                    let executor = dispatcher.executor.clone();
                    let depth = depth.clone();
                    workers.push(tokio::spawn(async move {
                        loop {
                            let call = {
                                let mut receiver = receiver.lock().await;
                                receiver.recv().await
                            };
                            let Some(call) = call else { return };
                            depth.fetch_sub(1, Ordering::Relaxed);
                            let result = executor
                                .execute(
                                    &call.manifest,
                                    call.arguments,
                                    call.approved,
                                    call.timeout,
                                )
                                .await;
                            let _ = call.responder.send(result);
                        }
                    }));
                }
                *dispatcher.workers.lock() = workers;
                Ok(dispatcher)
            }
            QueueBackend::Sqlite => {
                let path = config.persist_path.clone().ok_or_else(|| {
                    Error::Validation("skills.dispatcher.persist_path is required".into())
                })?;
                let db = SqliteQueue::open(path)?;
                db.recover_running_rows()?;
                let futures: Arc<Mutex<HashMap<String, oneshot::Sender<SkillExecutionResult>>>> =
                    Arc::new(Mutex::new(HashMap::new()));

                let dispatcher = Arc::new(Self {
                    executor,
                    max_queue_size,
                    state: QueueState::Sqlite {
                        db: db.clone(),
                        futures: futures.clone(),
                    },
                    workers: Mutex::new(Vec::new()),
                });

                let mut workers = Vec::with_capacity(worker_count);
                for worker_index in 0..worker_count {
                    let db = db.clone();
                    let futures = futures.clone();
                    let executor = dispatcher.executor.clone();
                    workers.push(tokio::spawn(async move {
                        loop {
                            let claimed = {
                                let db = db.clone();
                                tokio::task::spawn_blocking(move || db.claim_next()).await
                            };
                            let claimed = match claimed {
                                Ok(Ok(row)) => row,
                                Ok(Err(e)) => {
                                    tracing::warn!(worker = worker_index, error = %e, "skill queue claim failed");
                                    tokio::time::sleep(Duration::from_millis(250)).await;
                                    continue;
                                }
                                Err(_) => return,
                            };
                            let Some((row_id, job_id, payload_json)) = claimed else {
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                continue;
                            };

                            let result = run_payload(&executor, &payload_json).await;
                            if let Some(responder) = futures.lock().remove(&job_id) {
                                let _ = responder.send(result);
                            }
                            let db = db.clone();
                            let _ = tokio::task::spawn_blocking(move || db.complete(row_id)).await;
                        }
                    }));
                }
                *dispatcher.workers.lock() = workers;
                Ok(dispatcher)
            }
        }
    }

    pub fn from_config(
        executor: Arc<SkillExecutor>,
        config: &SkillDispatcherConfig,
    ) -> Result<Arc<Self>> {
        Self::start(executor, config)
    }

    fn queue_full(&self, size: usize) -> Error {
        Error::QueueFull {
            size,
            capacity: self.max_queue_size,
        }
    }
}

async fn run_payload(executor: &SkillExecutor, payload_json: &str) -> SkillExecutionResult {
    #[derive(serde::Deserialize)]
    struct Payload {
        manifest: SkillManifest,
        #[serde(default)]
        arguments: Arguments,
        #[serde(default)]
        approved: bool,
        #[serde(default)]
        timeout_sec: Option<f64>,
    }

    match serde_json::from_str::<Payload>(payload_json) {
        Ok(payload) => {
            let timeout = payload.timeout_sec.map(Duration::from_secs_f64);
            executor
                .execute(&payload.manifest, payload.arguments, payload.approved, timeout)
                .await
        }
        Err(e) => SkillExecutionResult {
            skill_name: "unknown".into(),
            kind: "unknown".into(),
            ok: false,
            output: None,
            error: Some(format!("invalid queued payload: {e}")),
            duration_ms: 0,
            timed_out: false,
            denied: false,
            requires_approval: false,
        },
    }
}

#[async_trait]
impl SkillDispatcher for QueuedSkillDispatcher {
    async fn execute(
        &self,
        manifest: &SkillManifest,
        arguments: Arguments,
        approved: bool,
        timeout: Option<Duration>,
    ) -> Result<SkillExecutionResult> {
        match &self.state {
            QueueState::Memory { sender, depth } => {
                let (responder, receiver) = oneshot::channel();
                let call = QueuedCall {
                    manifest: manifest.clone(),
                    arguments,
                    approved,
                    timeout,
                    responder,
                };
                depth.fetch_add(1, Ordering::Relaxed);
                match sender.try_send(call) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let size = depth.fetch_sub(1, Ordering::Relaxed) - 1;
                        return Err(self.queue_full(size));
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        depth.fetch_sub(1, Ordering::Relaxed);
                        return Err(Error::Internal("skill queue closed".into()));
                    }
                }
                receiver
                    .await
                    .map_err(|_| Error::Internal("skill worker dropped the call".into()))
            }
            QueueState::Sqlite { db, futures } => {
                let queued = {
                    let db = db.clone();
                    tokio::task::spawn_blocking(move || db.count_queued())
                        .await
                        .map_err(|e| Error::Internal(format!("queue count: {e}")))??
                };
                if queued >= self.max_queue_size {
                    return Err(self.queue_full(queued));
                }

                let job_id = Uuid::new_v4().simple().to_string();
                let payload = serde_json::json!({
                    "manifest": manifest,
                    "arguments": arguments,
                    "approved": approved,
                    "timeout_sec": timeout.map(|t| t.as_secs_f64()),
                })
                .to_string();

                let (responder, receiver) = oneshot::channel();
                futures.lock().insert(job_id.clone(), responder);

                let enqueue = {
                    let db = db.clone();
                    let job_id = job_id.clone();
                    tokio::task::spawn_blocking(move || db.enqueue(&job_id, &payload))
                        .await
                        .map_err(|e| Error::Internal(format!("queue insert: {e}")))?
                };
                if let Err(e) = enqueue {
                    futures.lock().remove(&job_id);
                    return Err(e);
                }

                let result = receiver
                    .await
                    .map_err(|_| Error::Internal("skill worker dropped the call".into()));
                futures.lock().remove(&job_id);
                result
            }
        }
    }

    async fn close(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }
        if let QueueState::Sqlite { db, .. } = &self.state {
            if let Err(e) = db.recover_running_rows() {
                tracing::warn!(error = %e, "skill queue recovery on close failed");
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SQLite queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
struct SqliteQueue {
    path: PathBuf,
}

impl SqliteQueue {
    fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let queue = Self { path };
        let con = queue.connect()?;
        con.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS skill_queue (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 job_id TEXT NOT NULL UNIQUE,
                 payload_json TEXT NOT NULL,
                 status TEXT NOT NULL DEFAULT 'queued',
                 enqueued_at REAL NOT NULL,
                 claimed_at REAL
             );
             CREATE INDEX IF NOT EXISTS idx_skill_queue_status_id
             ON skill_queue(status, id);",
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
                "UPDATE skill_queue SET status='queued', claimed_at=NULL WHERE status='running'",
                [],
            )
            .map_err(sqlite_err)?;
        Ok(())
    }

    fn count_queued(&self) -> Result<usize> {
        let con = self.connect()?;
        let count: i64 = con
            .query_row(
                "SELECT COUNT(1) FROM skill_queue WHERE status='queued'",
                [],
                |row| row.get(0),
            )
            .map_err(sqlite_err)?;
        Ok(count as usize)
    }

    fn enqueue(&self, job_id: &str, payload_json: &str) -> Result<()> {
        self.connect()?
            .execute(
                "INSERT INTO skill_queue(job_id, payload_json, status, enqueued_at)
                 VALUES (?1, ?2, 'queued', ?3)",
                rusqlite::params![job_id, payload_json, now_epoch()],
            )
            .map_err(sqlite_err)?;
        Ok(())
    }

    fn claim_next(&self) -> Result<Option<(i64, String, String)>> {
        let mut con = self.connect()?;
        let tx = con
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(sqlite_err)?;
        let row = tx
            .query_row(
                "SELECT id, job_id, payload_json FROM skill_queue
                 WHERE status='queued' ORDER BY id ASC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(sqlite_err(other)),
            })?;

        if let Some((row_id, _, _)) = &row {
            tx.execute(
                "UPDATE skill_queue SET status='running', claimed_at=?1 WHERE id=?2",
                rusqlite::params![now_epoch(), row_id],
            )
            .map_err(sqlite_err)?;
        }
        tx.commit().map_err(sqlite_err)?;
        Ok(row)
    }

    fn complete(&self, row_id: i64) -> Result<()> {
        self.connect()?
            .execute("DELETE FROM skill_queue WHERE id=?1", [row_id])
            .map_err(sqlite_err)?;
        Ok(())
    }
}

fn sqlite_err(e: rusqlite::Error) -> Error {
    Error::Internal(format!("sqlite: {e}"))
}

fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::EntrypointRegistry;
    use crate::policy::SkillsPolicy;

    fn executor() -> Arc<SkillExecutor> {
        Arc::new(SkillExecutor::new(
            SkillsPolicy::default(),
            Arc::new(EntrypointRegistry::new()),
            4,
            Duration::from_secs(2),
        ))
    }

    fn prompt_manifest() -> SkillManifest {
        serde_json::from_value(serde_json::json!({
            "name": "echo",
            "description": "echo",
            "kind": "prompt",
            "prompt_template": "echo {value}",
        }))
        .unwrap()
    }

    fn args(value: &str) -> Arguments {
        let mut map = Arguments::new();
        map.insert("value".into(), serde_json::json!(value));
        map
    }

    #[tokio::test]
    async fn local_dispatcher_executes_inline() {
        let dispatcher = LocalSkillDispatcher::new(executor());
        let result = dispatcher
            .execute(&prompt_manifest(), args("hi"), false, None)
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.output, Some(serde_json::json!("echo hi")));
    }

    #[tokio::test]
    async fn queued_memory_resolves_future() {
        let config = SkillDispatcherConfig {
            mode: "queued".into(),
            backend: QueueBackend::Memory,
            worker_count: 2,
            max_queue_size: 8,
            persist_path: None,
        };
        let dispatcher = QueuedSkillDispatcher::start(executor(), &config).unwrap();
        let result = dispatcher
            .execute(&prompt_manifest(), args("queued"), false, None)
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.output, Some(serde_json::json!("echo queued")));
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn queued_sqlite_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = SkillDispatcherConfig {
            mode: "queued".into(),
            backend: QueueBackend::Sqlite,
            worker_count: 1,
            max_queue_size: 8,
            persist_path: Some(dir.path().join("skills.db")),
        };
        let dispatcher = QueuedSkillDispatcher::start(executor(), &config).unwrap();
        let result = dispatcher
            .execute(&prompt_manifest(), args("durable"), false, None)
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.output, Some(serde_json::json!("echo durable")));
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn sqlite_recovery_resets_running_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skills.db");
        let db = SqliteQueue::open(path.clone()).unwrap();
        db.enqueue("job1", "{}").unwrap();
        let claimed = db.claim_next().unwrap().unwrap();
        assert_eq!(claimed.1, "job1");
        // Nothing left to claim while the row is running.
        assert!(db.claim_next().unwrap().is_none());

        db.recover_running_rows().unwrap();
        let reclaimed = db.claim_next().unwrap().unwrap();
        assert_eq!(reclaimed.1, "job1");
    }

    #[tokio::test]
    async fn sqlite_queue_full_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skills.db");
        // Pre-fill the queue beyond capacity with no workers running.
        let db = SqliteQueue::open(path.clone()).unwrap();
        db.enqueue("a", "{}").unwrap();
        db.enqueue("b", "{}").unwrap();

        let config = SkillDispatcherConfig {
            mode: "queued".into(),
            backend: QueueBackend::Sqlite,
            worker_count: 1,
            max_queue_size: 2,
            persist_path: Some(path),
        };
        let dispatcher = QueuedSkillDispatcher::start(executor(), &config).unwrap();
        // The two pre-filled rows may drain quickly; only assert the error
        // shape when saturation is actually observed.
        let outcome = dispatcher
            .execute(&prompt_manifest(), args("x"), false, None)
            .await;
        if let Err(e) = outcome {
            assert!(matches!(e, Error::QueueFull { capacity: 2, .. }));
        }
        dispatcher.close().await;
    }
}
