//! Result memoization for task execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::clock::Clock;
use crate::error::CacheError;

/// Digest of a task's name and its ordered inputs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for `task_name` invoked with `inputs`.
    ///
    /// Inputs are hashed as compact JSON; `serde_json` keeps object keys
    /// sorted, so equal values always serialize identically. Every part is
    /// length-prefixed so `("ab", "c")` and `("a", "bc")` cannot collide.
    pub fn derive(task_name: &str, inputs: &[Value]) -> Self {
        let mut hasher = Sha256::new();

        hasher.update((task_name.len() as u64).to_le_bytes());
        hasher.update(task_name.as_bytes());

        hasher.update((inputs.len() as u64).to_le_bytes());
        for input in inputs {
            let canonical = input.to_string();
            hasher.update((canonical.len() as u64).to_le_bytes());
            hasher.update(canonical.as_bytes());
        }

        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already computed digest (used when reading stored entries)
    pub fn from_hex(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored task result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub task_name: String,
    pub value: Value,
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    /// `None` when the TTL is too large to represent, i.e. never expires
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.stored_at.checked_add_signed(ttl))
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: u64,
    pub valid_entries: u64,
    pub expired_entries: u64,
    pub tasks_with_cache: Vec<String>,
}

/// Storage backend for cached task results.
///
/// Implementations synchronize internally; a `put` replaces the whole entry
/// for a key so readers never observe a partial record.
pub trait CacheStore: Send + Sync {
    fn clock(&self) -> &dyn Clock;

    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Store or overwrite `key`, stamping `stored_at` with the current time
    fn put(
        &self,
        key: &CacheKey,
        task_name: &str,
        value: &Value,
        ttl: Duration,
    ) -> Result<CacheEntry, CacheError>;

    fn is_valid(&self, entry: &CacheEntry) -> bool {
        entry.is_valid_at(self.clock().now())
    }

    /// Drop every entry stored for `task_name`
    fn invalidate(&self, task_name: &str) -> Result<u64, CacheError>;

    fn prune_expired(&self) -> Result<u64, CacheError>;

    fn clear(&self) -> Result<u64, CacheError>;

    fn stats(&self) -> Result<CacheStats, CacheError>;
}

/// Process-local cache store
#[derive(Debug)]
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }
}

fn poisoned<T>(_: T) -> CacheError {
    CacheError::Unavailable("cache lock poisoned".to_string())
}

impl CacheStore for MemoryCache {
    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(key).cloned())
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

        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(key.clone(), entry.clone());
        Ok(entry)
    }

    fn invalidate(&self, task_name: &str) -> Result<u64, CacheError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|_, entry| entry.task_name != task_name);
        Ok((before - entries.len()) as u64)
    }

    fn prune_expired(&self) -> Result<u64, CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_valid_at(now));
        Ok((before - entries.len()) as u64)
    }

    fn clear(&self) -> Result<u64, CacheError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let count = entries.len() as u64;
        entries.clear();
        Ok(count)
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        let now = self.clock.now();
        let entries = self.entries.read().map_err(poisoned)?;

        let valid: Vec<&CacheEntry> = entries.values().filter(|e| e.is_valid_at(now)).collect();
        let mut tasks_with_cache: Vec<String> = valid.iter().map(|e| e.task_name.clone()).collect();
        tasks_with_cache.sort();
        tasks_with_cache.dedup();

        Ok(CacheStats {
            total_entries: entries.len() as u64,
            valid_entries: valid.len() as u64,
            expired_entries: (entries.len() - valid.len()) as u64,
            tasks_with_cache,
        })
    }
}

/// The cache as tasks see it.
///
/// Store failures are logged and turned into misses, and a per-key lock
/// keeps concurrent invocations with the same key from all executing.
pub struct TaskCache {
    store: Option<Arc<dyn CacheStore>>,
    in_flight: Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>,
}

impl fmt::Debug for TaskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCache")
            .field("enabled", &self.store.is_some())
            .finish()
    }
}

impl TaskCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store: Some(store),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(MemoryCache::new(clock)))
    }

    /// Every lookup misses and nothing is stored
    pub fn disabled() -> Self {
        Self {
            store: None,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.store.as_ref()
    }

    /// Return the cached value for `key` if a valid entry exists
    pub fn lookup(&self, key: &CacheKey) -> Option<Value> {
        let store = self.store.as_ref()?;
        match store.get(key) {
            Ok(Some(entry)) if store.is_valid(&entry) => Some(entry.value),
            Ok(Some(_)) => {
                tracing::debug!(key = %key, "cache entry expired");
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    pub fn save(&self, key: &CacheKey, task_name: &str, value: &Value, ttl: Duration) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if let Err(e) = store.put(key, task_name, value, ttl) {
            tracing::warn!(task = task_name, key = %key, error = %e, "cache write failed");
        }
    }

    /// Wait until no other invocation holds `key`
    pub async fn lock(&self, key: &CacheKey) -> KeyGuard<'_> {
        let lock = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            in_flight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = lock.clone().lock_owned().await;

        KeyGuard {
            cache: self,
            key: key.clone(),
            lock,
            guard: Some(guard),
        }
    }
}

/// Held while one invocation computes the value for a key
pub struct KeyGuard<'a> {
    cache: &'a TaskCache,
    key: CacheKey,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();

        let mut in_flight = self.cache.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        // One reference in the map, one here: nobody else is waiting
        if Arc::strong_count(&self.lock) == 2 {
            in_flight.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::clock::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn test_cache_key_consistency() {
        let inputs = vec![json!(51.5), json!(-0.12)];
        let key1 = CacheKey::derive("Fetch weather", &inputs);
        let key2 = CacheKey::derive("Fetch weather", &inputs);

        assert_eq!(key1, key2);
        assert_eq!(key1.as_str().len(), 64);
    }

    #[test]
    fn test_cache_key_changes_with_inputs() {
        let base = CacheKey::derive("Fetch weather", &[json!(51.5), json!(-0.12)]);

        assert_ne!(base, CacheKey::derive("Fetch weather", &[json!(51.5), json!(-0.13)]));
        assert_ne!(base, CacheKey::derive("Fetch weather", &[json!(-0.12), json!(51.5)]));
        assert_ne!(base, CacheKey::derive("Fetch weather", &[json!(51.5)]));
        assert_ne!(base, CacheKey::derive("Save weather", &[json!(51.5), json!(-0.12)]));
    }

    #[test]
    fn test_cache_key_is_unambiguous() {
        let a = CacheKey::derive("task", &[json!("ab"), json!("c")]);
        let b = CacheKey::derive("task", &[json!("a"), json!("bc")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_cache_key_ignores_object_key_order() {
        let a: Value = serde_json::from_str(r#"{"time": [1], "rain": [2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"rain": [2], "time": [1]}"#).unwrap();
        assert_eq!(CacheKey::derive("t", &[a]), CacheKey::derive("t", &[b]));
    }

    #[test]
    fn test_memory_cache_expiry() {
        let clock = clock();
        let cache = MemoryCache::new(clock.clone());
        let key = CacheKey::derive("t", &[]);

        cache.put(&key, "t", &json!(1), Duration::from_secs(60)).unwrap();
        let entry = cache.get(&key).unwrap().unwrap();
        assert!(cache.is_valid(&entry));

        clock.advance(chrono::Duration::seconds(59));
        assert!(cache.is_valid(&entry));

        clock.advance(chrono::Duration::seconds(1));
        assert!(!cache.is_valid(&entry));

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.expired_entries, 1);

        assert_eq!(cache.prune_expired().unwrap(), 1);
        assert!(cache.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_memory_cache_overwrite() {
        let clock = clock();
        let cache = MemoryCache::new(clock.clone());
        let key = CacheKey::derive("t", &[]);

        cache.put(&key, "t", &json!("old"), Duration::from_secs(1)).unwrap();
        clock.advance(chrono::Duration::seconds(5));
        cache.put(&key, "t", &json!("new"), Duration::from_secs(1)).unwrap();

        let entry = cache.get(&key).unwrap().unwrap();
        assert_eq!(entry.value, json!("new"));
        assert_eq!(entry.stored_at, clock.now());
        assert!(cache.is_valid(&entry));
    }

    #[test]
    fn test_memory_cache_invalidate_and_clear() {
        let cache = MemoryCache::new(clock());
        cache.put(&CacheKey::derive("a", &[json!(1)]), "a", &json!(1), Duration::from_secs(60)).unwrap();
        cache.put(&CacheKey::derive("a", &[json!(2)]), "a", &json!(2), Duration::from_secs(60)).unwrap();
        cache.put(&CacheKey::derive("b", &[]), "b", &json!(3), Duration::from_secs(60)).unwrap();

        assert_eq!(cache.stats().unwrap().tasks_with_cache, vec!["a", "b"]);
        assert_eq!(cache.invalidate("a").unwrap(), 2);
        assert_eq!(cache.clear().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_writers_leave_complete_entry() {
        let cache = Arc::new(MemoryCache::new(clock()));
        let key = CacheKey::derive("t", &[]);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cache
                            .put(&key, "t", &json!({"a": i, "b": i}), Duration::from_secs(60))
                            .unwrap();
                        let entry = cache.get(&key).unwrap().unwrap();
                        assert_eq!(entry.value["a"], entry.value["b"]);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let entry = cache.get(&key).unwrap().unwrap();
        assert_eq!(entry.value["a"], entry.value["b"]);
    }

    struct BrokenStore {
        clock: ManualClock,
    }

    impl CacheStore for BrokenStore {
        fn clock(&self) -> &dyn Clock {
            &self.clock
        }
        fn get(&self, _: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
            Err(CacheError::Unavailable("disk gone".into()))
        }
        fn put(&self, _: &CacheKey, _: &str, _: &Value, _: Duration) -> Result<CacheEntry, CacheError> {
            Err(CacheError::Unavailable("disk gone".into()))
        }
        fn invalidate(&self, _: &str) -> Result<u64, CacheError> {
            Ok(0)
        }
        fn prune_expired(&self) -> Result<u64, CacheError> {
            Ok(0)
        }
        fn clear(&self) -> Result<u64, CacheError> {
            Ok(0)
        }
        fn stats(&self) -> Result<CacheStats, CacheError> {
            Ok(CacheStats::default())
        }
    }

    #[test]
    fn test_store_failure_degrades_to_miss() {
        let cache = TaskCache::new(Arc::new(BrokenStore {
            clock: ManualClock::new(Utc::now()),
        }));
        let key = CacheKey::derive("t", &[]);

        cache.save(&key, "t", &json!(1), Duration::from_secs(60));
        assert_eq!(cache.lookup(&key), None);
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let cache = TaskCache::disabled();
        let key = CacheKey::derive("t", &[]);

        cache.save(&key, "t", &json!(1), Duration::from_secs(60));
        assert!(!cache.is_enabled());
        assert_eq!(cache.lookup(&key), None);
    }

    #[tokio::test]
    async fn test_key_lock_released_and_cleaned_up() {
        let cache = TaskCache::in_memory(clock());
        let key = CacheKey::derive("t", &[]);

        {
            let _guard = cache.lock(&key).await;
            assert_eq!(cache.in_flight.lock().unwrap().len(), 1);
        }
        assert!(cache.in_flight.lock().unwrap().is_empty());

        // Re-acquiring after release must not deadlock
        let _guard = cache.lock(&key).await;
    }
}
