//! Deliverable capture: move a payload file into the node's store, hash it,
//! record the row.
//!
//! The move happens before the row insert; a failed move records nothing and
//! surfaces as an I/O failure, so a Deliverable row always points at a file
//! that exists in the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{DeliverableId, InstanceId};
use crate::store::{NewDeliverable, Store};

pub struct DeliverableStore {
    dl_repo: PathBuf,
    store: Arc<dyn Store>,
}

impl DeliverableStore {
    pub fn new(dl_repo: impl Into<PathBuf>, store: Arc<dyn Store>) -> Self {
        Self {
            dl_repo: dl_repo.into(),
            store,
        }
    }

    /// Move `src` into the store and record it. The source file is consumed.
    pub async fn add(
        &self,
        instance: InstanceId,
        src: &Path,
        label: Option<String>,
    ) -> Result<DeliverableId> {
        let metadata = tokio::fs::metadata(src).await?;
        if !metadata.is_file() {
            return Err(Error::Invalid(format!(
                "deliverable source {} is not a file",
                src.display()
            )));
        }

        let instance_dir = self.dl_repo.join(instance.to_string());
        tokio::fs::create_dir_all(&instance_dir).await?;
        let file_name = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "deliverable".to_string());
        let dest = instance_dir.join(format!("{}-{}", Uuid::new_v4(), file_name));

        move_file(src, &dest).await?;
        let (file_hash, size) = hash_file(&dest).await?;

        let recorded = self
            .store
            .record_deliverable(NewDeliverable {
                instance,
                file_path: dest.clone(),
                label,
                file_hash,
                size,
            })
            .await;
        match recorded {
            Ok(id) => {
                debug!(instance_id = %instance, deliverable_id = %id, file = %dest.display(),
                       "deliverable captured");
                Ok(id)
            }
            Err(e) => {
                // Best effort: hand the file back so the payload can retry.
                if let Err(undo) = move_file(&dest, src).await {
                    warn!(file = %dest.display(), error = %undo,
                          "could not return deliverable after failed record");
                }
                Err(e)
            }
        }
    }
}

/// Rename when source and destination share a device; copy, fsync and unlink
/// otherwise.
async fn move_file(src: &Path, dest: &Path) -> Result<()> {
    match tokio::fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(src, dest).await?;
            let file = tokio::fs::File::open(dest).await?;
            file.sync_all().await?;
            tokio::fs::remove_file(src).await?;
            Ok(())
        }
    }
}

async fn hash_file(path: &Path) -> Result<(String, i64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut size: i64 = 0;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as i64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

impl std::fmt::Debug for DeliverableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliverableStore")
            .field("dl_repo", &self.dl_repo)
            .finish()
    }
}
