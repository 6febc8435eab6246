//! The capability object handed to a running payload.
//!
//! Everything a payload may do goes through here; each method checks the
//! pending-kill marker first, so any engine-API call is also a cancellation
//! point.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::deliverable::DeliverableStore;
use crate::error::Error;
use crate::model::{DeliverableId, EnqueueRequest, InstanceId, JobDefinition, UserTags};
use crate::payload::JobError;
use crate::reporting::{Reporter, RunLog};
use crate::store::Store;

pub(crate) struct ContextParts {
    pub instance: InstanceId,
    pub definition: JobDefinition,
    pub parent: Option<InstanceId>,
    pub tags: UserTags,
    pub parameters: HashMap<String, String>,
    pub work_dir: PathBuf,
    pub store: Arc<dyn Store>,
    pub reporter: Reporter,
    pub deliverables: Arc<DeliverableStore>,
    pub run_log: RunLog,
    pub max_message_chars: usize,
}

/// Handle a payload uses to talk to the engine. Cheap to clone.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<ContextParts>,
}

impl JobContext {
    pub(crate) fn new(parts: ContextParts) -> Self {
        Self {
            inner: Arc::new(parts),
        }
    }

    // ---- characteristics of the running instance -------------------------

    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance
    }

    pub fn definition_id(&self) -> crate::model::JobDefId {
        self.inner.definition.id
    }

    pub fn application_name(&self) -> &str {
        &self.inner.definition.application_name
    }

    pub fn can_be_restarted(&self) -> bool {
        self.inner.definition.can_restart
    }

    pub fn parent_id(&self) -> Option<InstanceId> {
        self.inner.parent
    }

    pub fn tags(&self) -> &UserTags {
        &self.inner.tags
    }

    pub fn session_id(&self) -> Option<&str> {
        self.inner.tags.session_id.as_deref()
    }

    /// Definition defaults merged with enqueue-time values; runtime wins.
    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.inner.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.inner.parameters.get(key).map(String::as_str)
    }

    /// Instance-private scratch directory, purged at the end of the run.
    pub fn work_dir(&self) -> &Path {
        &self.inner.work_dir
    }

    // ---- engine calls ----------------------------------------------------

    /// Cooperative cancellation check. Call regularly; it is the only way
    /// the engine can interrupt this instance.
    pub async fn yield_now(&self) -> Result<(), JobError> {
        match self.inner.store.kill_requested(self.inner.instance).await {
            Ok(true) => Err(JobError::Cancelled),
            Ok(false) => Ok(()),
            // Transient store trouble: the next yield will check again.
            Err(e) => {
                debug!(instance_id = %self.inner.instance, error = %e,
                       "kill check skipped");
                Ok(())
            }
        }
    }

    /// Record a human-readable progress note, truncated to the configured
    /// bound.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), JobError> {
        self.yield_now().await?;
        let mut body: String = text.into();
        if body.chars().count() > self.inner.max_message_chars {
            body = body.chars().take(self.inner.max_message_chars).collect();
        }
        self.inner.run_log.append(&body).await;
        self.inner.reporter.message(self.inner.instance, body).await;
        Ok(())
    }

    /// Record a numeric advancement, clamped to 0..=100. Overwrites the
    /// previous value.
    pub async fn send_progress(&self, progress: i32) -> Result<(), JobError> {
        self.yield_now().await?;
        let value = progress.clamp(0, 100);
        self.inner.reporter.progress(self.inner.instance, value).await;
        Ok(())
    }

    /// Move a file into the node's deliverable store and make it retrievable
    /// by clients. The file is consumed.
    pub async fn add_deliverable(
        &self,
        path: impl AsRef<Path>,
        label: impl Into<String>,
    ) -> Result<DeliverableId, JobError> {
        self.yield_now().await?;
        self.inner
            .deliverables
            .add(self.inner.instance, path.as_ref(), Some(label.into()))
            .await
            .map_err(into_job_error)
    }

    /// Enqueue a child execution request; it inherits this instance as its
    /// parent.
    pub async fn enqueue(&self, mut request: EnqueueRequest) -> Result<InstanceId, JobError> {
        self.yield_now().await?;
        request.parent = Some(self.inner.instance);
        self.inner
            .store
            .enqueue(request)
            .await
            .map_err(into_job_error)
    }
}

fn into_job_error(err: Error) -> JobError {
    match err {
        Error::Io(e) => JobError::Io(e),
        Error::Cancelled(_) => JobError::Cancelled,
        other => JobError::Failed(other.to_string()),
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("instance", &self.inner.instance)
            .field("application", &self.inner.definition.application_name)
            .finish()
    }
}
