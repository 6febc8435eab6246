//! Producer and monitor surface: enqueue, query, control.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{
    Deliverable, DeliverableId, EnqueueRequest, InstanceFilter, InstanceId, JobInstance, Message,
    UserTags,
};
use crate::state::InstanceState;
use crate::store::Store;

const SYNC_POLL: Duration = Duration::from_millis(100);

/// Client handle over a store. Cheap to clone; every method is one or two
/// gateway calls.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Store>,
}

impl Client {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Post an execution request and return as soon as it is persisted.
    pub async fn enqueue(
        &self,
        application_name: &str,
        tags: UserTags,
        parameters: HashMap<String, String>,
    ) -> Result<InstanceId> {
        self.enqueue_request(EnqueueRequest {
            application_name: application_name.to_string(),
            tags,
            parameters,
            ..EnqueueRequest::default()
        })
        .await
    }

    /// Enqueue with queue/priority overrides.
    pub async fn enqueue_request(&self, request: EnqueueRequest) -> Result<InstanceId> {
        self.store.enqueue(request).await
    }

    /// Enqueue and block until the instance reaches a terminal state.
    /// Killed and cancelled instances surface as errors.
    pub async fn enqueue_sync(&self, request: EnqueueRequest) -> Result<InstanceId> {
        let id = self.store.enqueue(request).await?;
        self.await_terminal(id).await?;
        Ok(id)
    }

    /// Poll until `id` is terminal; returns its final state for Ended and
    /// Crashed, errors for Killed and Cancelled.
    pub async fn await_terminal(&self, id: InstanceId) -> Result<InstanceState> {
        loop {
            let state = self.store.get_state(id).await?;
            if !state.is_terminal() {
                tokio::time::sleep(SYNC_POLL).await;
                continue;
            }
            return match state {
                InstanceState::Killed => {
                    let timed_out = self
                        .store
                        .get_history(id)
                        .await?
                        .and_then(|h| h.instance.end_reason)
                        .is_some_and(|reason| reason == "timeout");
                    if timed_out {
                        Err(Error::Timeout(id))
                    } else {
                        Err(Error::Cancelled(id))
                    }
                }
                InstanceState::Cancelled => Err(Error::Cancelled(id)),
                other => Ok(other),
            };
        }
    }

    pub async fn get_state(&self, id: InstanceId) -> Result<InstanceState> {
        self.store.get_state(id).await
    }

    pub async fn list_instances(&self, filter: InstanceFilter) -> Result<Vec<JobInstance>> {
        self.store.list_instances(filter).await
    }

    pub async fn get_messages(&self, id: InstanceId) -> Result<Vec<Message>> {
        self.store.get_messages(id).await
    }

    pub async fn get_progress(&self, id: InstanceId) -> Result<Option<i32>> {
        self.store.get_progress(id).await
    }

    pub async fn get_deliverables(&self, id: InstanceId) -> Result<Vec<Deliverable>> {
        self.store.get_deliverables(id).await
    }

    /// Fetch the bytes of a captured deliverable.
    pub async fn download_deliverable(&self, id: DeliverableId) -> Result<Vec<u8>> {
        let deliverable = self.store.get_deliverable(id).await?;
        Ok(tokio::fs::read(&deliverable.file_path).await?)
    }

    /// Stop an instance. Waiting instances are cancelled outright; running
    /// ones get the pending-kill marker and stop at their next yield.
    pub async fn kill(&self, id: InstanceId) -> Result<()> {
        let state = self.store.get_state(id).await?;
        match state {
            InstanceState::Submitted | InstanceState::Hold => {
                match self
                    .store
                    .transition(
                        id,
                        state,
                        InstanceState::Cancelled,
                        Some("cancelled by request".to_string()),
                    )
                    .await
                {
                    Ok(()) => self.store.archive_terminal(id).await,
                    // It started in the meantime; fall back to the marker.
                    Err(Error::StateConflict { .. }) => self.store.request_kill(id).await,
                    Err(e) => Err(e),
                }
            }
            InstanceState::Attributed | InstanceState::Running => self.store.request_kill(id).await,
            terminal => {
                debug!(instance_id = %id, state = %terminal, "kill on finished instance ignored");
                Ok(())
            }
        }
    }

    /// Park a submitted instance; it will not be reserved until resumed.
    pub async fn pause(&self, id: InstanceId) -> Result<()> {
        self.store
            .transition(id, InstanceState::Submitted, InstanceState::Hold, None)
            .await
            .map_err(hide_conflict("pause"))
    }

    pub async fn resume(&self, id: InstanceId) -> Result<()> {
        self.store
            .transition(id, InstanceState::Hold, InstanceState::Submitted, None)
            .await
            .map_err(hide_conflict("resume"))
    }

    pub async fn set_priority(&self, id: InstanceId, priority: i32) -> Result<()> {
        self.store.set_priority(id, priority).await
    }
}

/// State conflicts are internal vocabulary; clients get a plain refusal.
fn hide_conflict(verb: &'static str) -> impl Fn(Error) -> Error {
    move |err| match err {
        Error::StateConflict { id, actual, .. } => {
            Error::Invalid(format!("cannot {verb} instance {id} in state {actual}"))
        }
        other => other,
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish()
    }
}
