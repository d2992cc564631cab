//! Database module for flowcast
//!
//! Provides SQLite storage for run history and the persistent task cache.

mod cache;
mod schema;

pub use cache::SqliteCache;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

use crate::execution::flow::{FlowRun, RunStatus, StepOutcome};

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        schema::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    // === Runs ===

    /// Archive a finished run, replacing any earlier record with its id
    pub fn record_run(&self, run: &FlowRun) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO runs (id, flow, started_at, finished_at, status, attempts, output)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.run_id,
                run.flow,
                run.started_at.to_rfc3339(),
                run.finished_at.to_rfc3339(),
                run.status.as_str(),
                run.attempts,
                run.output.as_ref().map(Value::to_string),
            ],
        )?;

        tx.execute("DELETE FROM step_results WHERE run_id = ?1", params![run.run_id])?;

        for (position, record) in run.records.iter().enumerate() {
            let (value, error, upstream, cached) = match &record.outcome {
                StepOutcome::Succeeded { value, cached, .. } => (Some(value.to_string()), None, None, *cached),
                StepOutcome::Failed { cause, .. } => (None, Some(cause.to_string()), None, false),
                StepOutcome::Aborted { upstream } => (None, None, Some(upstream.clone()), false),
            };

            tx.execute(
                "INSERT INTO step_results
                 (run_id, position, step, status, attempts, cached, duration_ms, started_at, inputs, value, error, upstream)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    run.run_id,
                    position as i64,
                    record.step,
                    record.outcome.as_str(),
                    record.outcome.attempts(),
                    cached,
                    record.duration_ms,
                    record.started_at.to_rfc3339(),
                    Value::from(record.inputs.clone()).to_string(),
                    value,
                    error,
                    upstream,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, flow, started_at, finished_at, status, attempts, output FROM runs WHERE id = ?1",
        )?;

        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(run_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_recent_runs(&self, limit: i32) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, flow, started_at, finished_at, status, attempts, output
             FROM runs ORDER BY started_at DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit], run_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_recent_runs_for_flow(&self, flow: &str, limit: i32) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, flow, started_at, finished_at, status, attempts, output
             FROM runs WHERE flow = ?1 ORDER BY started_at DESC LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![flow, limit], run_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    // === Step Results ===

    pub fn get_step_results(&self, run_id: &str) -> Result<Vec<StepResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, position, step, status, attempts, cached, duration_ms, started_at, inputs, value, error, upstream
             FROM step_results WHERE run_id = ?1 ORDER BY position",
        )?;

        let rows = stmt.query_map(params![run_id], |row| {
            let inputs: Value = json_column(row, 8)?;
            Ok(StepResult {
                run_id: row.get(0)?,
                position: row.get(1)?,
                step: row.get(2)?,
                status: row.get(3)?,
                attempts: row.get(4)?,
                cached: row.get(5)?,
                duration_ms: row.get(6)?,
                started_at: time_column(row, 7)?,
                inputs: match inputs {
                    Value::Array(items) => items,
                    other => vec![other],
                },
                value: optional_json_column(row, 9)?,
                error: row.get(10)?,
                upstream: row.get(11)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_run_summary(&self, run_id: &str) -> Result<Option<RunSummary>> {
        if let Some(run) = self.get_run(run_id)? {
            let steps = self.get_step_results(run_id)?;
            Ok(Some(RunSummary { run, steps }))
        } else {
            Ok(None)
        }
    }

    pub fn clear_history(&self) -> Result<usize> {
        let mut total = 0;
        total += self.conn.execute("DELETE FROM step_results", [])?;
        total += self.conn.execute("DELETE FROM runs", [])?;
        Ok(total)
    }
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn optional_json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(4)?;
    Ok(RunRecord {
        id: row.get(0)?,
        flow: row.get(1)?,
        started_at: time_column(row, 2)?,
        finished_at: time_column(row, 3)?,
        status: RunStatus::parse(&status).ok_or_else(|| {
            conversion_error(4, std::io::Error::other(format!("unknown run status '{}'", status)))
        })?,
        attempts: row.get(5)?,
        output: optional_json_column(row, 6)?,
    })
}

// === Data Types ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub flow: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub attempts: u32,
    pub output: Option<Value>,
}

impl RunRecord {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub run_id: String,
    pub position: i64,
    pub step: String,
    pub status: String,
    pub attempts: u32,
    pub cached: bool,
    pub duration_ms: i64,
    pub started_at: DateTime<Utc>,
    pub inputs: Vec<Value>,
    pub value: Option<Value>,
    pub error: Option<String>,
    pub upstream: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: RunRecord,
    pub steps: Vec<StepResult>,
}
