//! Per-run execution context

use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cache::TaskCache;
use super::clock::{Clock, SystemClock};
use super::retry::{AttemptObserver, TracingObserver};
use crate::artifacts::{Artifact, ArtifactSink, MemoryArtifactSink};
use crate::error::ArtifactError;

/// Everything a flow run needs from its surroundings.
///
/// Create one per run. The cache is shared between runs through the `Arc`;
/// the run id, cancellation token and observer belong to this run only.
pub struct RunContext {
    run_id: String,
    cache: Arc<TaskCache>,
    artifacts: Arc<dyn ArtifactSink>,
    observer: Arc<dyn AttemptObserver>,
    clock: Arc<dyn Clock>,
    cancellation: CancellationToken,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("cache", &self.cache)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

impl RunContext {
    pub fn new(cache: Arc<TaskCache>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            cache,
            artifacts: Arc::new(MemoryArtifactSink::new()),
            observer: Arc::new(TracingObserver),
            clock: Arc::new(SystemClock),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactSink>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn AttemptObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cache(&self) -> &TaskCache {
        &self.cache
    }

    pub fn artifacts(&self) -> &dyn ArtifactSink {
        self.artifacts.as_ref()
    }

    pub fn observer(&self) -> &dyn AttemptObserver {
        self.observer.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Stamp and durably record an artifact for this run
    pub fn record_artifact(
        &self,
        key: &str,
        content: impl Into<String>,
        description: &str,
    ) -> Result<Artifact, ArtifactError> {
        let artifact = Artifact {
            run_id: self.run_id.clone(),
            key: key.to_string(),
            content: content.into(),
            description: description.to_string(),
            produced_at: self.clock.now(),
        };
        self.artifacts.record(&artifact)?;
        Ok(artifact)
    }
}
