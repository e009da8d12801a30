//! Durable agents state: run records, the idempotency-key index, and
//! checkpoint pointers, in SQLite.
//!
//! Writes happen on every run state change; reads happen at startup
//! (restore) and on idempotent submit. Rows store the full run record as
//! JSON next to the columns the queries need.

use std::path::PathBuf;

use parking_lot::Mutex;
use rusqlite::Connection;

use lmx_domain::{Error, Result};

use crate::models::AgentRun;

pub struct AgentsStateStore {
    connection: Mutex<Connection>,
}

fn sqlite_err(e: rusqlite::Error) -> Error {
    Error::Internal(format!("agents state store: {e}"))
}

impl AgentsStateStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(&path).map_err(sqlite_err)?;
        Self::init(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// In-memory store for tests and ephemeral deployments.
    pub fn in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().map_err(sqlite_err)?;
        Self::init(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn init(connection: &Connection) -> Result<()> {
        connection
            .execute_batch(
                "PRAGMA journal_mode=WAL;
                 CREATE TABLE IF NOT EXISTS runs (
                     id TEXT PRIMARY KEY,
                     status TEXT NOT NULL,
                     record_json TEXT NOT NULL,
                     updated_at REAL NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS idempotency (
                     key TEXT PRIMARY KEY,
                     run_id TEXT NOT NULL,
                     fingerprint TEXT NOT NULL DEFAULT ''
                 );",
            )
            .map_err(sqlite_err)
    }

    pub fn upsert_run(&self, run: &AgentRun) -> Result<()> {
        let record = serde_json::to_string(run)?;
        self.connection
            .lock()
            .execute(
                "INSERT INTO runs(id, status, record_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     status=excluded.status,
                     record_json=excluded.record_json,
                     updated_at=excluded.updated_at",
                rusqlite::params![
                    run.id,
                    run.status.as_str(),
                    record,
                    run.updated_at.timestamp_millis() as f64 / 1000.0
                ],
            )
            .map_err(sqlite_err)?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<AgentRun>> {
        let connection = self.connection.lock();
        let record: Option<String> = connection
            .query_row(
                "SELECT record_json FROM runs WHERE id=?1",
                [run_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(sqlite_err(other)),
            })?;
        match record {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn list_runs(&self) -> Result<Vec<AgentRun>> {
        let connection = self.connection.lock();
        let mut statement = connection
            .prepare("SELECT record_json FROM runs ORDER BY updated_at ASC")
            .map_err(sqlite_err)?;
        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sqlite_err)?;
        let mut runs = Vec::new();
        for row in rows {
            let json = row.map_err(sqlite_err)?;
            match serde_json::from_str(&json) {
                Ok(run) => runs.push(run),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable run record"),
            }
        }
        Ok(runs)
    }

    pub fn delete_run(&self, run_id: &str) -> Result<()> {
        self.connection
            .lock()
            .execute("DELETE FROM runs WHERE id=?1", [run_id])
            .map_err(sqlite_err)?;
        Ok(())
    }

    // ── Idempotency ────────────────────────────────────────────────────

    pub fn bind_idempotency(&self, key: &str, run_id: &str, fingerprint: &str) -> Result<()> {
        self.connection
            .lock()
            .execute(
                "INSERT INTO idempotency(key, run_id, fingerprint) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     run_id=excluded.run_id,
                     fingerprint=excluded.fingerprint",
                rusqlite::params![key, run_id, fingerprint],
            )
            .map_err(sqlite_err)?;
        Ok(())
    }

    pub fn get_idempotency(&self, key: &str) -> Result<Option<(String, String)>> {
        self.connection
            .lock()
            .query_row(
                "SELECT run_id, fingerprint FROM idempotency WHERE key=?1",
                [key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(sqlite_err(other)),
            })
    }

    pub fn clear_idempotency(&self, key: &str) -> Result<()> {
        self.connection
            .lock()
            .execute("DELETE FROM idempotency WHERE key=?1", [key])
            .map_err(sqlite_err)?;
        Ok(())
    }
}
