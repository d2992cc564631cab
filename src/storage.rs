//! Object storage for pipeline uploads

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use crate::atomic::write_atomic;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `path` under `key`, replacing any existing object
    async fn upload(&self, path: &Path, key: &str) -> Result<()>;
}

/// A bucket backed by a local directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `key` is stored; keys may not escape the root
    pub fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            bail!("Invalid object key: {}", key);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, path: &Path, key: &str) -> Result<()> {
        let target = self.object_path(key)?;
        let contents = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        write_atomic(&target, contents)
            .with_context(|| format!("Failed to upload {} to {}", path.display(), target.display()))?;

        tracing::debug!(key, target = %target.display(), "object uploaded");
        Ok(())
    }
}
