//! Persistence gateway: typed CRUD plus pessimistic reservation over the
//! engine state tables.
//!
//! The gateway owns every mutable entity row. Engine components hold
//! transient in-memory handles and reconcile them back through explicit calls
//! here; each call either runs in its own transaction or documents otherwise.

mod memory;
mod postgres;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    BindingId, DeliverableId, Deliverable, DeploymentBinding, EnqueueRequest, HistoryRecord,
    InstanceFilter, InstanceId, JobDefId, JobDefinition, JobInstance, Message, Node, NodeId, Queue,
    QueueId,
};
use crate::state::InstanceState;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Queue creation payload.
#[derive(Debug, Clone)]
pub struct NewQueue {
    pub name: String,
    pub description: String,
    pub default_priority: i32,
    pub max_size: i32,
}

impl NewQueue {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            default_priority: 0,
            max_size: 0,
        }
    }
}

/// Node registration payload.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub host: String,
    pub port: i32,
    pub repo_path: PathBuf,
    pub tmp_path: PathBuf,
    pub dl_repo: PathBuf,
}

/// Definition registration payload.
#[derive(Debug, Clone)]
pub struct NewJobDefinition {
    pub application_name: String,
    pub entry_point: String,
    pub artifact_path: String,
    pub default_queue: QueueId,
    pub can_restart: bool,
    pub highlander: bool,
    pub max_time_running_ms: Option<i64>,
    pub default_parameters: HashMap<String, String>,
}

/// Binding registration payload.
#[derive(Debug, Clone)]
pub struct NewBinding {
    pub node: NodeId,
    pub queue: QueueId,
    pub max_concurrent: i32,
    pub poll_interval_ms: Option<i64>,
    pub enabled: bool,
}

/// Deliverable row payload; the file has already been moved into the node's
/// deliverable store when this is recorded.
#[derive(Debug, Clone)]
pub struct NewDeliverable {
    pub instance: InstanceId,
    pub file_path: PathBuf,
    pub label: Option<String>,
    pub file_hash: String,
    pub size: i64,
}

/// Transactional persistence gateway with read-committed visibility and
/// row-level reservation locking.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- registry --------------------------------------------------------

    async fn create_queue(&self, queue: NewQueue) -> Result<QueueId>;
    async fn get_queue(&self, id: QueueId) -> Result<Queue>;
    async fn get_queue_by_name(&self, name: &str) -> Result<Queue>;

    async fn create_node(&self, node: NewNode) -> Result<NodeId>;
    async fn get_node(&self, id: NodeId) -> Result<Node>;
    async fn get_node_by_name(&self, name: &str) -> Result<Node>;
    async fn set_node_enabled(&self, id: NodeId, enabled: bool) -> Result<()>;

    async fn create_job_definition(&self, def: NewJobDefinition) -> Result<JobDefId>;
    async fn get_job_definition(&self, id: JobDefId) -> Result<JobDefinition>;
    async fn get_job_definition_by_name(&self, application_name: &str) -> Result<JobDefinition>;
    /// Refused while any live or archived instance still references the
    /// definition.
    async fn delete_job_definition(&self, id: JobDefId) -> Result<()>;

    async fn create_binding(&self, binding: NewBinding) -> Result<BindingId>;
    async fn get_binding(&self, id: BindingId) -> Result<DeploymentBinding>;
    async fn update_binding(&self, binding: DeploymentBinding) -> Result<()>;
    async fn delete_binding(&self, id: BindingId) -> Result<()>;
    /// Current bindings for a node; pollers re-read these every tick.
    async fn bindings_for_node(&self, node: NodeId) -> Result<Vec<DeploymentBinding>>;

    // ---- queue operations ------------------------------------------------

    /// Size-check plus insert in one transaction. Fails with `QueueFull` when
    /// the target queue is at its bound.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<InstanceId>;

    /// Reserve up to `limit` runnable instances for `node`, ordered by
    /// `(priority DESC, enqueue_time ASC, id ASC)`, each transitioned to
    /// ATTRIBUTED under a row lock. Instances whose definition already has a
    /// live instance are skipped when the definition is highlander, including
    /// duplicates inside the same batch.
    async fn reserve_next(
        &self,
        node: NodeId,
        queue: QueueId,
        limit: usize,
    ) -> Result<Vec<JobInstance>>;

    /// CAS on `(id, state)`. Field discipline follows the target state:
    /// Running sets start_time, Submitted clears attribution, terminal states
    /// set end_time and the reason. Fails with `StateConflict` when the
    /// observed state differs from `from`.
    async fn transition(
        &self,
        id: InstanceId,
        from: InstanceState,
        to: InstanceState,
        reason: Option<String>,
    ) -> Result<()>;

    /// Set the pending-kill marker; observed at payload yield points.
    async fn request_kill(&self, id: InstanceId) -> Result<()>;
    async fn kill_requested(&self, id: InstanceId) -> Result<bool>;

    async fn set_priority(&self, id: InstanceId, priority: i32) -> Result<()>;

    // ---- run side effects ------------------------------------------------

    async fn record_message(&self, id: InstanceId, body: String) -> Result<()>;
    async fn update_progress(&self, id: InstanceId, progress: i32) -> Result<()>;
    async fn record_deliverable(&self, deliverable: NewDeliverable) -> Result<DeliverableId>;

    // ---- lifecycle -------------------------------------------------------

    /// Move a terminal instance row into the history table atomically.
    async fn archive_terminal(&self, id: InstanceId) -> Result<()>;

    /// Boot recovery: every instance attributed to `node` still in
    /// ATTRIBUTED or RUNNING goes to CRASHED and is archived. Returns the
    /// number of recovered instances.
    async fn recover_crashed(&self, node: NodeId) -> Result<u64>;

    // ---- queries ---------------------------------------------------------

    /// Live instance row, if not yet archived.
    async fn get_instance(&self, id: InstanceId) -> Result<Option<JobInstance>>;
    /// State of a live or archived instance.
    async fn get_state(&self, id: InstanceId) -> Result<InstanceState>;
    async fn get_history(&self, id: InstanceId) -> Result<Option<HistoryRecord>>;
    async fn list_instances(&self, filter: InstanceFilter) -> Result<Vec<JobInstance>>;
    async fn get_messages(&self, id: InstanceId) -> Result<Vec<Message>>;
    async fn get_progress(&self, id: InstanceId) -> Result<Option<i32>>;
    async fn get_deliverables(&self, id: InstanceId) -> Result<Vec<Deliverable>>;
    async fn get_deliverable(&self, id: DeliverableId) -> Result<Deliverable>;
}
