//! Database schema and migrations

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    let current_version = current_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

pub fn current_version(conn: &Connection) -> Result<i32> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Run history
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            flow TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 1,
            output TEXT
        );

        CREATE TABLE IF NOT EXISTS step_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            step TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            cached INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            inputs TEXT NOT NULL,
            value TEXT,
            error TEXT,
            upstream TEXT,
            FOREIGN KEY (run_id) REFERENCES runs(id)
        );

        CREATE INDEX IF NOT EXISTS idx_step_results_run_id ON step_results(run_id);
        CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);
        CREATE INDEX IF NOT EXISTS idx_runs_flow ON runs(flow);

        INSERT INTO schema_migrations (version, applied_at) VALUES (1, datetime('now'));
        "#,
    )?;

    Ok(())
}

/// Persistent task cache
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- expires_at_ms is NULL for entries that never expire
        CREATE TABLE IF NOT EXISTS task_cache (
            cache_key TEXT PRIMARY KEY,
            task_name TEXT NOT NULL,
            value TEXT NOT NULL,
            stored_at TEXT NOT NULL,
            stored_at_ms INTEGER NOT NULL,
            ttl_ms INTEGER NOT NULL,
            expires_at_ms INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_task_cache_task_name ON task_cache(task_name);
        CREATE INDEX IF NOT EXISTS idx_task_cache_expires ON task_cache(expires_at_ms);

        INSERT INTO schema_migrations (version, applied_at) VALUES (2, datetime('now'));
        "#,
    )?;

    Ok(())
}
