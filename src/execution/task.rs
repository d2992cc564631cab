//! Named units of work with cache and retry policies

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::cache::CacheKey;
use super::context::RunContext;
use super::retry::{execute_with_retry, RetryPolicy};
use crate::error::{FinalFailure, TaskFailure};

pub type TaskResult = Result<Value, TaskFailure>;

type WorkFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// Results are reused for `ttl` after a successful execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
}

/// The value a task produced and how it was obtained
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub value: Value,
    pub cached: bool,
    /// Attempts made in this invocation, 0 on a cache hit
    pub attempts: u32,
}

#[derive(Clone)]
pub struct Task {
    name: String,
    work: WorkFn,
    cache_policy: Option<CachePolicy>,
    retry_policy: RetryPolicy,
    timeout: Option<Duration>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("cache_policy", &self.cache_policy)
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Task {
    /// A task with no caching and a single attempt
    pub fn new<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            work: Arc::new(move |inputs| Box::pin(work(inputs))),
            cache_policy: None,
            retry_policy: RetryPolicy::none(),
            timeout: None,
        }
    }

    pub fn with_cache(mut self, ttl: Duration) -> Self {
        self.cache_policy = Some(CachePolicy { ttl });
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Limit each attempt, not the invocation as a whole
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_policy(&self) -> Option<CachePolicy> {
        self.cache_policy
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn cache_key(&self, inputs: &[Value]) -> CacheKey {
        CacheKey::derive(&self.name, inputs)
    }

    /// Run the task for `inputs`.
    ///
    /// With a cache policy, a valid cached value is returned without calling
    /// the work function. Failures are never cached.
    pub async fn invoke(&self, inputs: Vec<Value>, ctx: &RunContext) -> Result<TaskOutput, FinalFailure> {
        let Some(policy) = self.cache_policy else {
            return self.execute(inputs, ctx).await;
        };

        let cache = ctx.cache();
        let key = self.cache_key(&inputs);

        if let Some(value) = cache.lookup(&key) {
            tracing::debug!(task = %self.name, key = %key, "cache hit");
            return Ok(cached(value));
        }

        let _guard = cache.lock(&key).await;
        // Another invocation may have filled the entry while we waited
        if let Some(value) = cache.lookup(&key) {
            tracing::debug!(task = %self.name, key = %key, "cache filled while waiting");
            return Ok(cached(value));
        }

        tracing::debug!(task = %self.name, key = %key, "cache miss");
        let output = self.execute(inputs, ctx).await?;
        cache.save(&key, &self.name, &output.value, policy.ttl);

        Ok(output)
    }

    async fn execute(&self, inputs: Vec<Value>, ctx: &RunContext) -> Result<TaskOutput, FinalFailure> {
        let (value, attempts) = execute_with_retry(
            &self.name,
            &self.retry_policy,
            self.timeout,
            ctx.observer(),
            |_| (self.work)(inputs.clone()),
        )
        .await?;

        Ok(TaskOutput {
            value,
            cached: false,
            attempts,
        })
    }
}

fn cached(value: Value) -> TaskOutput {
    TaskOutput {
        value,
        cached: true,
        attempts: 0,
    }
}

/// Decode input `index` as `T`
pub fn input<T: DeserializeOwned>(inputs: &[Value], index: usize) -> Result<T, TaskFailure> {
    let value = inputs
        .get(index)
        .ok_or_else(|| TaskFailure::permanent(format!("missing input #{}", index)))?;

    T::deserialize(value)
        .map_err(|e| TaskFailure::permanent(format!("input #{} has the wrong shape: {}", index, e)))
}

/// Encode a task result
pub fn output<T: Serialize>(value: T) -> TaskResult {
    serde_json::to_value(value).map_err(|e| TaskFailure::permanent(format!("unencodable output: {}", e)))
}
