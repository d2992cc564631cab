//! Durable, human-readable records of what a run produced

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::atomic::write_atomic;
use crate::error::ArtifactError;

/// Default directory (relative to the output dir) for artifacts
pub const ARTIFACTS_DIR: &str = "artifacts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub run_id: String,
    pub key: String,
    pub content: String,
    pub description: String,
    pub produced_at: DateTime<Utc>,
}

/// Persists artifacts before `record` returns.
///
/// Recording the same key twice in one run replaces the first record.
pub trait ArtifactSink: Send + Sync {
    fn record(&self, artifact: &Artifact) -> Result<(), ArtifactError>;
}

/// Stores each artifact as `<dir>/<key>/<run_id>.json`
#[derive(Debug, Clone)]
pub struct FileArtifactSink {
    dir: PathBuf,
}

impl FileArtifactSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str, run_id: &str) -> PathBuf {
        self.dir
            .join(sanitize_filename(key))
            .join(format!("{}.json", sanitize_filename(run_id)))
    }
}

impl ArtifactSink for FileArtifactSink {
    fn record(&self, artifact: &Artifact) -> Result<(), ArtifactError> {
        let json = serde_json::to_string_pretty(artifact).map_err(|source| ArtifactError::Encoding {
            key: artifact.key.clone(),
            source,
        })?;

        let path = self.path_for(&artifact.key, &artifact.run_id);
        write_atomic(&path, json).map_err(|source| ArtifactError::Io {
            key: artifact.key.clone(),
            source,
        })?;

        tracing::debug!(key = %artifact.key, path = %path.display(), "artifact recorded");
        Ok(())
    }
}

/// Keeps artifacts in memory
#[derive(Debug, Default)]
pub struct MemoryArtifactSink {
    artifacts: Mutex<Vec<Artifact>>,
}

impl MemoryArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        self.artifacts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl ArtifactSink for MemoryArtifactSink {
    fn record(&self, artifact: &Artifact) -> Result<(), ArtifactError> {
        let mut artifacts = self.artifacts.lock().unwrap_or_else(|p| p.into_inner());
        artifacts.retain(|a| !(a.run_id == artifact.run_id && a.key == artifact.key));
        artifacts.push(artifact.clone());
        Ok(())
    }
}

/// Sanitize a key for use as a single normal path component.
///
/// Separators become `_`; empty, `.` and `..` keys are rewritten so they
/// stay inside the artifact directory.
fn sanitize_filename(name: &str) -> String {
    let sanitized = name.replace("::", "_").replace(['/', '\\', ' ', ':'], "_");
    if sanitized.chars().all(|c| c == '.') {
        format!("_{}", sanitized.replace('.', "_"))
    } else {
        sanitized
    }
}

/// Load every artifact under `dir`, oldest first
pub fn load_artifacts(dir: &Path) -> Result<Vec<Artifact>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut artifacts = Vec::new();

    for key_dir in fs::read_dir(dir)? {
        let key_dir = key_dir?.path();
        if !key_dir.is_dir() {
            continue;
        }

        for entry in fs::read_dir(&key_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match load_artifact(&path) {
                    Ok(artifact) => artifacts.push(artifact),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to load artifact"),
                }
            }
        }
    }

    artifacts.sort_by(|a, b| a.produced_at.cmp(&b.produced_at));
    Ok(artifacts)
}

pub fn load_artifact(path: &Path) -> Result<Artifact> {
    let content = fs::read_to_string(path)?;
    let artifact: Artifact = serde_json::from_str(&content)?;
    Ok(artifact)
}

/// Most recent artifact recorded under `key`
pub fn latest_artifact(dir: &Path, key: &str) -> Result<Option<Artifact>> {
    Ok(load_artifacts(dir)?.into_iter().filter(|a| a.key == key).last())
}

pub fn clear_artifacts(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    Ok(())
}
