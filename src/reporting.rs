//! Asynchronous, per-instance-ordered persistence of messages and progress.
//!
//! Payload calls enqueue events on a channel; a single writer task drains it,
//! so events for one instance reach the store in submission order even though
//! the payload never waits on a database round-trip.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::error::Error;
use crate::model::InstanceId;
use crate::store::Store;

const CHANNEL_CAPACITY: usize = 256;
const MAX_WRITE_ATTEMPTS: u32 = 5;

#[derive(Debug)]
enum ReportEvent {
    Message { instance: InstanceId, body: String },
    Progress { instance: InstanceId, value: i32 },
}

/// Sending half handed to job contexts.
#[derive(Clone)]
pub struct Reporter {
    tx: mpsc::Sender<ReportEvent>,
}

impl Reporter {
    pub async fn message(&self, instance: InstanceId, body: String) {
        if self
            .tx
            .send(ReportEvent::Message { instance, body })
            .await
            .is_err()
        {
            warn!(instance_id = %instance, "reporter closed, dropping message");
        }
    }

    pub async fn progress(&self, instance: InstanceId, value: i32) {
        if self
            .tx
            .send(ReportEvent::Progress { instance, value })
            .await
            .is_err()
        {
            warn!(instance_id = %instance, "reporter closed, dropping progress update");
        }
    }
}

/// Start the writer task. It exits once every `Reporter` clone is dropped and
/// the channel has drained.
pub fn spawn_reporter(store: Arc<dyn Store>) -> (Reporter, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            deliver(store.as_ref(), event).await;
        }
    });
    (Reporter { tx }, handle)
}

async fn deliver(store: &dyn Store, event: ReportEvent) {
    let mut backoff = Backoff::new(Duration::from_millis(100));
    loop {
        let result = match &event {
            ReportEvent::Message { instance, body } => {
                store.record_message(*instance, body.clone()).await
            }
            ReportEvent::Progress { instance, value } => {
                store.update_progress(*instance, *value).await
            }
        };
        match result {
            Ok(()) => return,
            // The instance finished and was archived before the write landed.
            Err(Error::NotFound { .. }) => {
                debug!(?event, "dropping report for archived instance");
                return;
            }
            Err(e) if e.is_transient() && backoff.attempt() < MAX_WRITE_ATTEMPTS => {
                tokio::time::sleep(backoff.next_delay()).await;
            }
            Err(e) => {
                metrics::counter!("jobmill_report_write_failures_total").increment(1);
                warn!(?event, error = %e, "report write failed");
                return;
            }
        }
    }
}

/// Append-only per-instance run log kept in the work directory and captured
/// as an implicit deliverable at the end of the run.
#[derive(Clone, Debug)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub async fn append(&self, line: &str) {
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(e) = result {
            warn!(log = %self.path.display(), error = %e, "run log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EnqueueRequest;
    use crate::store::{MemoryStore, NewJobDefinition, NewQueue, Store};
    use std::collections::HashMap;

    #[tokio::test]
    async fn writer_preserves_per_instance_order() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let queue = store.create_queue(NewQueue::named("q")).await?;
        store
            .create_job_definition(NewJobDefinition {
                application_name: "app".to_string(),
                entry_point: "app.Main".to_string(),
                artifact_path: "/dev/null".to_string(),
                default_queue: queue,
                can_restart: false,
                highlander: false,
                max_time_running_ms: None,
                default_parameters: HashMap::new(),
            })
            .await?;
        let id = store.enqueue(EnqueueRequest::new("app")).await?;

        let store_dyn: Arc<dyn Store> = store.clone();
        let (reporter, handle) = spawn_reporter(store_dyn);
        for n in 0..20 {
            reporter.message(id, format!("step {n}")).await;
        }
        reporter.progress(id, 100).await;
        drop(reporter);
        handle.await?;

        let messages = store.get_messages(id).await?;
        let bodies: Vec<&str> = messages.iter().map(|m| m.body.as_str()).collect();
        let expected: Vec<String> = (0..20).map(|n| format!("step {n}")).collect();
        assert_eq!(bodies, expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(store.get_progress(id).await?, Some(100));
        Ok(())
    }

    #[tokio::test]
    async fn run_log_appends_lines() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = RunLog::new(dir.path().join("run.log"));
        log.append("first").await;
        log.append("second").await;
        let text = tokio::fs::read_to_string(log.path()).await?;
        assert_eq!(text, "first\nsecond\n");
        Ok(())
    }
}
