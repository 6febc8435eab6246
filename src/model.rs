//! Entity records persisted by the store.
//!
//! Flat records keyed by monotonically-assigned integer ids; relationships
//! are foreign-key fields loaded through explicit store calls, never
//! traversable object graphs.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::InstanceState;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(JobDefId);
id_type!(QueueId);
id_type!(NodeId);
id_type!(BindingId);
id_type!(InstanceId);
id_type!(DeliverableId);

/// Template for an execution: what to run and where it lands by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: JobDefId,
    pub application_name: String,
    /// Name the payload registry resolves to executable code.
    pub entry_point: String,
    /// URI of the deployable container (plain path or `file://`).
    pub artifact_path: String,
    pub default_queue: QueueId,
    pub can_restart: bool,
    /// At most one instance of this definition may be live at a time.
    pub highlander: bool,
    /// Run deadline in milliseconds; exceeded runs are killed cooperatively.
    pub max_time_running_ms: Option<i64>,
    pub default_parameters: HashMap<String, String>,
}

/// Named buffer of submitted instances with a priority tiebreaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub id: QueueId,
    pub name: String,
    pub description: String,
    pub default_priority: i32,
    /// Bound on SUBMITTED instances; 0 means unbounded.
    pub max_size: i32,
}

/// One engine process and its local directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub host: String,
    pub port: i32,
    /// Artifact cache shared by all runners on the node.
    pub repo_path: PathBuf,
    /// Root for per-instance work directories.
    pub tmp_path: PathBuf,
    /// Deliverable store files are moved into.
    pub dl_repo: PathBuf,
    pub enabled: bool,
}

/// (node, queue) consumption grant. The only way a queue is consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentBinding {
    pub id: BindingId,
    pub node: NodeId,
    pub queue: QueueId,
    pub max_concurrent: i32,
    /// Poll cadence; absent means the node-wide default applies.
    pub poll_interval_ms: Option<i64>,
    pub enabled: bool,
}

/// Opaque user classification carried through enqueue and reporting queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTags {
    pub application: Option<String>,
    pub module: Option<String>,
    pub keyword1: Option<String>,
    pub keyword2: Option<String>,
    pub keyword3: Option<String>,
    pub session_id: Option<String>,
    pub user: Option<String>,
    pub mail: Option<String>,
}

/// One scheduled execution of a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: InstanceId,
    pub job_def: JobDefId,
    /// Copied at enqueue; may differ from the definition default.
    pub queue: QueueId,
    pub state: InstanceState,
    pub priority: i32,
    /// Copied from the definition at enqueue so reservation can enforce the
    /// single-live-instance rule without a join.
    pub highlander: bool,
    pub enqueue_time: DateTime<Utc>,
    pub attribution_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub attributed_node: Option<NodeId>,
    pub progress: Option<i32>,
    /// Pending-kill marker observed at payload yield points.
    pub kill_requested: bool,
    /// Position in a restart chain; 0 for an original request.
    pub restart_count: i32,
    pub tags: UserTags,
    /// Runtime overrides merged over the definition defaults at run time.
    pub parameters: HashMap<String, String>,
    pub parent: Option<InstanceId>,
    pub end_reason: Option<String>,
}

/// Free-text progress note emitted by a running payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub instance: InstanceId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// File produced by a payload and retained in the node's deliverable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deliverable {
    pub id: DeliverableId,
    pub instance: InstanceId,
    pub file_path: PathBuf,
    pub label: Option<String>,
    /// sha-256 of the stored file, hex encoded.
    pub file_hash: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

/// Immutable archival snapshot taken when an instance reaches a terminal
/// state. Queryable after the live row is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub instance: JobInstance,
    pub archived_at: DateTime<Utc>,
}

/// Enqueue payload accepted by the store and the client surface.
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    pub application_name: String,
    /// Queue override; absent means the definition default.
    pub queue: Option<QueueId>,
    /// Priority override; absent means the queue default.
    pub priority: Option<i32>,
    pub tags: UserTags,
    pub parameters: HashMap<String, String>,
    pub parent: Option<InstanceId>,
    pub restart_count: i32,
}

impl EnqueueRequest {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            ..Self::default()
        }
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn on_queue(mut self, queue: QueueId) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Filter for instance listing. Empty filter matches every live instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub application_name: Option<String>,
    pub queue: Option<QueueId>,
    pub node: Option<NodeId>,
    pub states: Option<Vec<InstanceState>>,
    pub user: Option<String>,
    /// Also scan archived instances.
    pub include_history: bool,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &JobInstance, application_name: &str) -> bool {
        if let Some(app) = &self.application_name {
            if app != application_name {
                return false;
            }
        }
        if let Some(queue) = self.queue {
            if queue != instance.queue {
                return false;
            }
        }
        if let Some(node) = self.node {
            if instance.attributed_node != Some(node) {
                return false;
            }
        }
        if let Some(states) = &self.states {
            if !states.contains(&instance.state) {
                return false;
            }
        }
        if let Some(user) = &self.user {
            if instance.tags.user.as_deref() != Some(user.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Merge definition defaults with runtime overrides; runtime wins.
pub fn merge_parameters(
    defaults: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}
