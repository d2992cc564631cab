//! Cache database operations

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::Database;
use crate::error::CacheError;
use crate::execution::cache::{CacheEntry, CacheKey, CacheStats, CacheStore};
use crate::execution::clock::Clock;

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl Database {
    pub fn get_cache_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let row = self
            .conn
            .query_row(
                "SELECT task_name, value, stored_at, ttl_ms FROM task_cache WHERE cache_key = ?1",
                params![key.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((task_name, value, stored_at, ttl_ms)) = row else {
            return Ok(None);
        };

        let stored_at = DateTime::parse_from_rfc3339(&stored_at)
            .map_err(|e| CacheError::Unavailable(format!("bad stored_at for {}: {}", key, e)))?
            .with_timezone(&Utc);

        Ok(Some(CacheEntry {
            key: key.clone(),
            task_name,
            value: serde_json::from_str(&value)?,
            stored_at,
            ttl: Duration::from_millis(ttl_ms.max(0) as u64),
        }))
    }

    /// Insert or replace the whole row for the entry's key
    pub fn put_cache_entry(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let stored_at_ms = entry.stored_at.timestamp_millis();
        let ttl_ms = ttl_millis(entry.ttl);

        self.conn.execute(
            "INSERT OR REPLACE INTO task_cache
             (cache_key, task_name, value, stored_at, stored_at_ms, ttl_ms, expires_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.key.as_str(),
                entry.task_name,
                serde_json::to_string(&entry.value)?,
                entry.stored_at.to_rfc3339(),
                stored_at_ms,
                ttl_ms,
                stored_at_ms.checked_add(ttl_ms),
            ],
        )?;

        Ok(())
    }

    pub fn invalidate_cache(&self, task_name: &str) -> Result<u64, CacheError> {
        let count = self
            .conn
            .execute("DELETE FROM task_cache WHERE task_name = ?1", params![task_name])?;
        Ok(count as u64)
    }

    /// Delete entries that expired at or before `now`
    pub fn clear_expired_cache(&self, now: DateTime<Utc>) -> Result<u64, CacheError> {
        let count = self.conn.execute(
            "DELETE FROM task_cache WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(count as u64)
    }

    pub fn clear_all_cache(&self) -> Result<u64, CacheError> {
        let count = self.conn.execute("DELETE FROM task_cache", [])?;
        Ok(count as u64)
    }

    pub fn get_cache_stats(&self, now: DateTime<Utc>) -> Result<CacheStats, CacheError> {
        let now_ms = now.timestamp_millis();

        let total_entries: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM task_cache", [], |row| row.get(0))?;

        let valid_entries: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM task_cache WHERE expires_at_ms IS NULL OR expires_at_ms > ?1",
            params![now_ms],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT task_name FROM task_cache
             WHERE expires_at_ms IS NULL OR expires_at_ms > ?1
             ORDER BY task_name",
        )?;
        let tasks_with_cache = stmt
            .query_map(params![now_ms], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        Ok(CacheStats {
            total_entries: total_entries as u64,
            valid_entries: valid_entries as u64,
            expired_entries: (total_entries - valid_entries) as u64,
            tasks_with_cache,
        })
    }
}

/// Cache store that survives process restarts
pub struct SqliteCache {
    db: Mutex<Database>,
    clock: Arc<dyn Clock>,
}

impl SqliteCache {
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?, clock))
    }

    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            db: Mutex::new(db),
            clock,
        }
    }

    fn db(&self) -> Result<MutexGuard<'_, Database>, CacheError> {
        self.db
            .lock()
            .map_err(|_| CacheError::Unavailable("cache database lock poisoned".to_string()))
    }
}

impl CacheStore for SqliteCache {
    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        self.db()?.get_cache_entry(key)
    }

    fn put(
        &self,
        key: &CacheKey,
        task_name: &str,
        value: &Value,
        ttl: Duration,
    ) -> Result<CacheEntry, CacheError> {
        let entry = CacheEntry {
            key: key.clone(),
            task_name: task_name.to_string(),
            value: value.clone(),
            stored_at: self.clock.now(),
            ttl,
        };
        self.db()?.put_cache_entry(&entry)?;
        Ok(entry)
    }

    fn invalidate(&self, task_name: &str) -> Result<u64, CacheError> {
        self.db()?.invalidate_cache(task_name)
    }

    fn prune_expired(&self) -> Result<u64, CacheError> {
        self.db()?.clear_expired_cache(self.clock.now())
    }

    fn clear(&self) -> Result<u64, CacheError> {
        self.db()?.clear_all_cache()
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        self.db()?.get_cache_stats(self.clock.now())
    }
}
