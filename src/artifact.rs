//! Content-addressed artifact cache shared by all runners on a node.
//!
//! Reads are lock-free once a deployable is cached; a fetch holds a
//! per-artifact mutex so concurrent runners never write the same entry twice.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

pub struct ArtifactCache {
    repo_path: PathBuf,
    fetch_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArtifactCache {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            fetch_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a deployable to its cached local path, fetching it from the
    /// registered source on a cache miss.
    pub async fn ensure(&self, artifact_path: &str) -> Result<PathBuf> {
        let key = cache_key(artifact_path);
        let cached = self.repo_path.join(&key);
        if tokio::fs::try_exists(&cached).await? {
            return Ok(cached);
        }

        let lock = self.fetch_lock(&key).await;
        let _guard = lock.lock().await;
        // Another runner may have completed the fetch while we waited.
        if tokio::fs::try_exists(&cached).await? {
            return Ok(cached);
        }

        let source = resolve_source(artifact_path)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(Error::ArtifactUnavailable(format!(
                "deployable {artifact_path} does not exist"
            )));
        }
        tokio::fs::create_dir_all(&self.repo_path).await?;
        // Fetch to a temp name, publish with an atomic rename.
        let staging = self.repo_path.join(format!("{key}.fetch"));
        tokio::fs::copy(&source, &staging)
            .await
            .map_err(|e| Error::ArtifactUnavailable(format!("fetch of {artifact_path}: {e}")))?;
        tokio::fs::rename(&staging, &cached).await?;
        debug!(artifact = artifact_path, cache_entry = %cached.display(), "artifact fetched");
        Ok(cached)
    }

    async fn fetch_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.fetch_locks.lock().await;
        locks.entry(key.to_string()).or_default().clone()
    }
}

fn cache_key(artifact_path: &str) -> String {
    let digest = Sha256::digest(artifact_path.as_bytes());
    format!("{digest:x}")
}

fn resolve_source(artifact_path: &str) -> Result<PathBuf> {
    if let Some(path) = artifact_path.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if artifact_path.contains("://") {
        return Err(Error::ArtifactUnavailable(format!(
            "unsupported artifact scheme: {artifact_path}"
        )));
    }
    Ok(PathBuf::from(artifact_path))
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("repo_path", &self.repo_path)
            .finish()
    }
}
