//! SQLite checkpoint store.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE runs (
//!     run_id TEXT PRIMARY KEY,
//!     config TEXT NOT NULL,
//!     created_at TEXT NOT NULL
//! );
//! CREATE TABLE checkpoints (
//!     run_id TEXT NOT NULL,
//!     sequence INTEGER NOT NULL,
//!     step_name TEXT NOT NULL,
//!     saved_at TEXT NOT NULL,
//!     halted_at TEXT,
//!     state TEXT NOT NULL,
//!     PRIMARY KEY (run_id, sequence)
//! );
//! ```
//!
//! Sequence numbers are assigned inside the insert transaction, which also
//! gives atomic visibility of each checkpoint.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::checkpoint_store::{next_saved_at, CheckpointStore};
use crate::domain::{Checkpoint, CheckpointReceipt, CheckpointSummary, PipelineState, RunConfig};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    config TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS checkpoints (
    run_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    step_name TEXT NOT NULL,
    saved_at TEXT NOT NULL,
    halted_at TEXT,
    state TEXT NOT NULL,
    PRIMARY KEY (run_id, sequence)
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_run_saved
    ON checkpoints(run_id, saved_at, sequence);
"#;

/// Checkpoint store backed by a SQLite database
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

/// Fixed-width timestamps so text ordering matches time ordering
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp in store: {}", raw))?
        .with_timezone(&Utc))
}

impl SqliteCheckpointStore {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn)
    }

    /// Volatile database, for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("Failed to open in-memory SQLite")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create checkpoint schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointReceipt> {
        let run_id = checkpoint.run_id.to_string();
        let step_name = checkpoint.step_name.clone();
        let halted_at = checkpoint.halted_at.clone();
        let state = serde_json::to_string(&checkpoint.state).context("Failed to serialize state")?;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let previous: Option<(i64, String)> = tx
                .query_row(
                    "SELECT sequence, saved_at FROM checkpoints
                     WHERE run_id = ?1 ORDER BY sequence DESC LIMIT 1",
                    params![run_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (sequence, previous_saved_at) = match previous {
                Some((seq, ts)) => (seq as u64 + 1, Some(parse_ts(&ts)?)),
                None => (1, None),
            };
            let saved_at = next_saved_at(previous_saved_at);

            tx.execute(
                "INSERT INTO checkpoints (run_id, sequence, step_name, saved_at, halted_at, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![run_id, sequence as i64, step_name, format_ts(saved_at), halted_at, state],
            )?;
            tx.commit().context("Failed to commit checkpoint")?;

            Ok(CheckpointReceipt { sequence, saved_at })
        })
        .await
    }

    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>> {
        let key = run_id.to_string();

        self.with_conn(move |conn| {
            let row: Option<(i64, String, String, Option<String>, String)> = conn
                .query_row(
                    "SELECT sequence, step_name, saved_at, halted_at, state FROM checkpoints
                     WHERE run_id = ?1 ORDER BY saved_at DESC, sequence DESC LIMIT 1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )
                .optional()?;

            let Some((sequence, step_name, saved_at, halted_at, state)) = row else {
                return Ok(None);
            };

            let state: PipelineState =
                serde_json::from_str(&state).context("Failed to parse stored state")?;

            Ok(Some(Checkpoint {
                run_id,
                step_name,
                sequence: sequence as u64,
                saved_at: parse_ts(&saved_at)?,
                halted_at,
                state,
            }))
        })
        .await
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<CheckpointSummary>> {
        let key = run_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT sequence, step_name, saved_at, halted_at, state FROM checkpoints
                 WHERE run_id = ?1 ORDER BY sequence ASC",
            )?;
            let rows = stmt.query_map(params![key], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut summaries = Vec::new();
            for row in rows {
                let (sequence, step_name, saved_at, halted_at, state) = row?;
                let state: PipelineState =
                    serde_json::from_str(&state).context("Failed to parse stored state")?;
                summaries.push(CheckpointSummary {
                    run_id,
                    step_name,
                    sequence: sequence as u64,
                    saved_at: parse_ts(&saved_at)?,
                    halted_at,
                    completed_steps: state.completed.len(),
                });
            }
            Ok(summaries)
        })
        .await
    }

    async fn save_manifest(&self, config: &RunConfig) -> Result<()> {
        let run_id = config.run_id.to_string();
        let json = serde_json::to_string(config).context("Failed to serialize run config")?;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO runs (run_id, config, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(run_id) DO UPDATE SET config = excluded.config",
                params![run_id, json, format_ts(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_manifest(&self, run_id: Uuid) -> Result<Option<RunConfig>> {
        let key = run_id.to_string();

        self.with_conn(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT config FROM runs WHERE run_id = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;

            json.map(|j| serde_json::from_str(&j).context("Failed to parse run config"))
                .transpose()
        })
        .await
    }

    async fn list_runs(&self) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id FROM runs
                 UNION SELECT DISTINCT run_id FROM checkpoints",
            )?;
            let ids = stmt.query_map([], |row| row.get::<_, String>(0))?;

            let mut runs = Vec::new();
            for id in ids {
                if let Ok(uuid) = Uuid::parse_str(&id?) {
                    runs.push(uuid);
                }
            }
            Ok(runs)
        })
        .await
    }
}
