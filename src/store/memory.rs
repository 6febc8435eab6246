//! In-memory store for tests and embedded runs.
//!
//! Single-mutex table set; every trait call takes the lock once, which gives
//! the same atomicity the Postgres store gets from one transaction per call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use super::{NewBinding, NewDeliverable, NewJobDefinition, NewNode, NewQueue, Store};
use crate::error::{Error, Result};
use crate::model::{
    BindingId, Deliverable, DeliverableId, DeploymentBinding, EnqueueRequest, HistoryRecord,
    InstanceFilter, InstanceId, JobDefId, JobDefinition, JobInstance, Message, Node, NodeId, Queue,
    QueueId,
};
use crate::state::InstanceState;

#[derive(Default)]
struct Sequences {
    queue: i64,
    node: i64,
    def: i64,
    binding: i64,
    instance: i64,
    deliverable: i64,
}

impl Sequences {
    fn next(field: &mut i64) -> i64 {
        *field += 1;
        *field
    }
}

#[derive(Default)]
struct Inner {
    seq: Sequences,
    queues: HashMap<QueueId, Queue>,
    nodes: HashMap<NodeId, Node>,
    defs: HashMap<JobDefId, JobDefinition>,
    bindings: HashMap<BindingId, DeploymentBinding>,
    instances: BTreeMap<InstanceId, JobInstance>,
    history: HashMap<InstanceId, HistoryRecord>,
    messages: HashMap<InstanceId, Vec<Message>>,
    deliverables: BTreeMap<DeliverableId, Deliverable>,
}

/// Store backed by process memory. Cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store poisoned")
    }
}

impl Inner {
    fn submitted_count(&self, queue: QueueId) -> usize {
        self.instances
            .values()
            .filter(|i| i.queue == queue && i.state == InstanceState::Submitted)
            .count()
    }

    /// Definitions with a live instance a node currently owns.
    fn active_defs(&self) -> HashSet<JobDefId> {
        self.instances
            .values()
            .filter(|i| i.state.is_attributed())
            .map(|i| i.job_def)
            .collect()
    }

    fn apply_transition(
        instance: &mut JobInstance,
        to: InstanceState,
        reason: Option<String>,
    ) {
        let now = Utc::now();
        instance.state = to;
        match to {
            InstanceState::Running => instance.start_time = Some(now),
            InstanceState::Submitted => {
                instance.attributed_node = None;
                instance.attribution_time = None;
            }
            _ if to.is_terminal() => {
                instance.end_time = Some(now);
                instance.end_reason = Some(reason.unwrap_or_else(|| default_reason(to)));
            }
            _ => {}
        }
    }
}

fn default_reason(state: InstanceState) -> String {
    match state {
        InstanceState::Ended => "ok".to_string(),
        InstanceState::Crashed => "payload failure".to_string(),
        InstanceState::Killed => "killed".to_string(),
        InstanceState::Cancelled => "cancelled".to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_queue(&self, queue: NewQueue) -> Result<QueueId> {
        let mut inner = self.lock();
        if inner.queues.values().any(|q| q.name == queue.name) {
            return Err(Error::Invalid(format!("queue {} already exists", queue.name)));
        }
        let id = QueueId(Sequences::next(&mut inner.seq.queue));
        inner.queues.insert(
            id,
            Queue {
                id,
                name: queue.name,
                description: queue.description,
                default_priority: queue.default_priority,
                max_size: queue.max_size,
            },
        );
        Ok(id)
    }

    async fn get_queue(&self, id: QueueId) -> Result<Queue> {
        self.lock()
            .queues
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("queue", id))
    }

    async fn get_queue_by_name(&self, name: &str) -> Result<Queue> {
        self.lock()
            .queues
            .values()
            .find(|q| q.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found("queue", name))
    }

    async fn create_node(&self, node: NewNode) -> Result<NodeId> {
        let mut inner = self.lock();
        if inner.nodes.values().any(|n| n.name == node.name) {
            return Err(Error::Invalid(format!("node {} already exists", node.name)));
        }
        let id = NodeId(Sequences::next(&mut inner.seq.node));
        inner.nodes.insert(
            id,
            Node {
                id,
                name: node.name,
                host: node.host,
                port: node.port,
                repo_path: node.repo_path,
                tmp_path: node.tmp_path,
                dl_repo: node.dl_repo,
                enabled: true,
            },
        );
        Ok(id)
    }

    async fn get_node(&self, id: NodeId) -> Result<Node> {
        self.lock()
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("node", id))
    }

    async fn get_node_by_name(&self, name: &str) -> Result<Node> {
        self.lock()
            .nodes
            .values()
            .find(|n| n.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found("node", name))
    }

    async fn set_node_enabled(&self, id: NodeId, enabled: bool) -> Result<()> {
        let mut inner = self.lock();
        let node = inner
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("node", id))?;
        node.enabled = enabled;
        Ok(())
    }

    async fn create_job_definition(&self, def: NewJobDefinition) -> Result<JobDefId> {
        let mut inner = self.lock();
        if !inner.queues.contains_key(&def.default_queue) {
            return Err(Error::not_found("queue", def.default_queue));
        }
        if inner
            .defs
            .values()
            .any(|d| d.application_name == def.application_name)
        {
            return Err(Error::Invalid(format!(
                "definition {} already exists",
                def.application_name
            )));
        }
        let id = JobDefId(Sequences::next(&mut inner.seq.def));
        inner.defs.insert(
            id,
            JobDefinition {
                id,
                application_name: def.application_name,
                entry_point: def.entry_point,
                artifact_path: def.artifact_path,
                default_queue: def.default_queue,
                can_restart: def.can_restart,
                highlander: def.highlander,
                max_time_running_ms: def.max_time_running_ms,
                default_parameters: def.default_parameters,
            },
        );
        Ok(id)
    }

    async fn get_job_definition(&self, id: JobDefId) -> Result<JobDefinition> {
        self.lock()
            .defs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("job definition", id))
    }

    async fn get_job_definition_by_name(&self, application_name: &str) -> Result<JobDefinition> {
        self.lock()
            .defs
            .values()
            .find(|d| d.application_name == application_name)
            .cloned()
            .ok_or_else(|| Error::not_found("job definition", application_name))
    }

    async fn delete_job_definition(&self, id: JobDefId) -> Result<()> {
        let mut inner = self.lock();
        if !inner.defs.contains_key(&id) {
            return Err(Error::not_found("job definition", id));
        }
        let referenced = inner.instances.values().any(|i| i.job_def == id)
            || inner.history.values().any(|h| h.instance.job_def == id);
        if referenced {
            return Err(Error::Invalid(format!(
                "definition {id} still has instances"
            )));
        }
        inner.defs.remove(&id);
        Ok(())
    }

    async fn create_binding(&self, binding: NewBinding) -> Result<BindingId> {
        let mut inner = self.lock();
        if !inner.nodes.contains_key(&binding.node) {
            return Err(Error::not_found("node", binding.node));
        }
        if !inner.queues.contains_key(&binding.queue) {
            return Err(Error::not_found("queue", binding.queue));
        }
        if inner
            .bindings
            .values()
            .any(|b| b.node == binding.node && b.queue == binding.queue)
        {
            return Err(Error::Invalid("binding already exists".to_string()));
        }
        let id = BindingId(Sequences::next(&mut inner.seq.binding));
        inner.bindings.insert(
            id,
            DeploymentBinding {
                id,
                node: binding.node,
                queue: binding.queue,
                max_concurrent: binding.max_concurrent,
                poll_interval_ms: binding.poll_interval_ms,
                enabled: binding.enabled,
            },
        );
        Ok(id)
    }

    async fn get_binding(&self, id: BindingId) -> Result<DeploymentBinding> {
        self.lock()
            .bindings
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("binding", id))
    }

    async fn update_binding(&self, binding: DeploymentBinding) -> Result<()> {
        let mut inner = self.lock();
        if !inner.bindings.contains_key(&binding.id) {
            return Err(Error::not_found("binding", binding.id));
        }
        inner.bindings.insert(binding.id, binding);
        Ok(())
    }

    async fn delete_binding(&self, id: BindingId) -> Result<()> {
        self.lock()
            .bindings
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("binding", id))
    }

    async fn bindings_for_node(&self, node: NodeId) -> Result<Vec<DeploymentBinding>> {
        let inner = self.lock();
        let mut bindings: Vec<DeploymentBinding> = inner
            .bindings
            .values()
            .filter(|b| b.node == node)
            .cloned()
            .collect();
        bindings.sort_by_key(|b| b.id);
        Ok(bindings)
    }

    async fn enqueue(&self, request: EnqueueRequest) -> Result<InstanceId> {
        let mut inner = self.lock();
        let def = inner
            .defs
            .values()
            .find(|d| d.application_name == request.application_name)
            .cloned()
            .ok_or_else(|| Error::not_found("job definition", &request.application_name))?;
        let queue_id = request.queue.unwrap_or(def.default_queue);
        let queue = inner
            .queues
            .get(&queue_id)
            .cloned()
            .ok_or_else(|| Error::not_found("queue", queue_id))?;
        if queue.max_size > 0 && inner.submitted_count(queue_id) >= queue.max_size as usize {
            return Err(Error::QueueFull(queue.name));
        }
        let id = InstanceId(Sequences::next(&mut inner.seq.instance));
        inner.instances.insert(
            id,
            JobInstance {
                id,
                job_def: def.id,
                queue: queue_id,
                state: InstanceState::Submitted,
                priority: request.priority.unwrap_or(queue.default_priority),
                highlander: def.highlander,
                enqueue_time: Utc::now(),
                attribution_time: None,
                start_time: None,
                end_time: None,
                attributed_node: None,
                progress: None,
                kill_requested: false,
                restart_count: request.restart_count,
                tags: request.tags,
                parameters: request.parameters,
                parent: request.parent,
                end_reason: None,
            },
        );
        Ok(id)
    }

    async fn reserve_next(
        &self,
        node: NodeId,
        queue: QueueId,
        limit: usize,
    ) -> Result<Vec<JobInstance>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut inner = self.lock();
        let mut active = inner.active_defs();

        let mut candidates: Vec<InstanceId> = inner
            .instances
            .values()
            .filter(|i| i.queue == queue && i.state == InstanceState::Submitted)
            .map(|i| i.id)
            .collect();
        candidates.sort_by(|a, b| {
            let ia = &inner.instances[a];
            let ib = &inner.instances[b];
            ib.priority
                .cmp(&ia.priority)
                .then(ia.enqueue_time.cmp(&ib.enqueue_time))
                .then(ia.id.cmp(&ib.id))
        });

        let now = Utc::now();
        let mut reserved = Vec::new();
        for id in candidates {
            if reserved.len() == limit {
                break;
            }
            let Some(instance) = inner.instances.get_mut(&id) else {
                continue;
            };
            if instance.highlander && active.contains(&instance.job_def) {
                continue;
            }
            instance.state = InstanceState::Attributed;
            instance.attributed_node = Some(node);
            instance.attribution_time = Some(now);
            active.insert(instance.job_def);
            reserved.push(instance.clone());
        }
        Ok(reserved)
    }

    async fn transition(
        &self,
        id: InstanceId,
        from: InstanceState,
        to: InstanceState,
        reason: Option<String>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let instance = inner
            .instances
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("instance", id))?;
        if instance.state != from {
            return Err(Error::StateConflict {
                id,
                expected: from,
                actual: instance.state,
            });
        }
        if !from.can_transition_to(to) {
            return Err(Error::StateConflict {
                id,
                expected: from,
                actual: instance.state,
            });
        }
        Inner::apply_transition(instance, to, reason);
        Ok(())
    }

    async fn request_kill(&self, id: InstanceId) -> Result<()> {
        let mut inner = self.lock();
        if let Some(instance) = inner.instances.get_mut(&id) {
            instance.kill_requested = true;
            return Ok(());
        }
        if inner.history.contains_key(&id) {
            return Ok(());
        }
        Err(Error::not_found("instance", id))
    }

    async fn kill_requested(&self, id: InstanceId) -> Result<bool> {
        let inner = self.lock();
        if let Some(instance) = inner.instances.get(&id) {
            return Ok(instance.kill_requested);
        }
        if inner.history.contains_key(&id) {
            return Ok(false);
        }
        Err(Error::not_found("instance", id))
    }

    async fn set_priority(&self, id: InstanceId, priority: i32) -> Result<()> {
        let mut inner = self.lock();
        let instance = inner
            .instances
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("instance", id))?;
        instance.priority = priority;
        Ok(())
    }

    async fn record_message(&self, id: InstanceId, body: String) -> Result<()> {
        let mut inner = self.lock();
        if !inner.instances.contains_key(&id) && !inner.history.contains_key(&id) {
            return Err(Error::not_found("instance", id));
        }
        inner.messages.entry(id).or_default().push(Message {
            instance: id,
            body,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn update_progress(&self, id: InstanceId, progress: i32) -> Result<()> {
        let mut inner = self.lock();
        let instance = inner
            .instances
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("instance", id))?;
        instance.progress = Some(progress);
        Ok(())
    }

    async fn record_deliverable(&self, deliverable: NewDeliverable) -> Result<DeliverableId> {
        let mut inner = self.lock();
        if !inner.instances.contains_key(&deliverable.instance)
            && !inner.history.contains_key(&deliverable.instance)
        {
            return Err(Error::not_found("instance", deliverable.instance));
        }
        let id = DeliverableId(Sequences::next(&mut inner.seq.deliverable));
        inner.deliverables.insert(
            id,
            Deliverable {
                id,
                instance: deliverable.instance,
                file_path: deliverable.file_path,
                label: deliverable.label,
                file_hash: deliverable.file_hash,
                size: deliverable.size,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn archive_terminal(&self, id: InstanceId) -> Result<()> {
        let mut inner = self.lock();
        if inner.history.contains_key(&id) {
            return Ok(());
        }
        let Some(instance) = inner.instances.remove(&id) else {
            return Err(Error::not_found("instance", id));
        };
        if !instance.state.is_terminal() {
            let actual = instance.state;
            inner.instances.insert(id, instance);
            return Err(Error::StateConflict {
                id,
                expected: InstanceState::Ended,
                actual,
            });
        }
        inner.history.insert(
            id,
            HistoryRecord {
                instance,
                archived_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn recover_crashed(&self, node: NodeId) -> Result<u64> {
        let mut inner = self.lock();
        let stranded: Vec<InstanceId> = inner
            .instances
            .values()
            .filter(|i| i.attributed_node == Some(node) && i.state.is_attributed())
            .map(|i| i.id)
            .collect();
        let count = stranded.len() as u64;
        for id in stranded {
            let Some(mut instance) = inner.instances.remove(&id) else {
                continue;
            };
            Inner::apply_transition(
                &mut instance,
                InstanceState::Crashed,
                Some("node crash recovery".to_string()),
            );
            inner.history.insert(
                id,
                HistoryRecord {
                    instance,
                    archived_at: Utc::now(),
                },
            );
        }
        // Terminal rows whose archival was interrupted mid-flight.
        let orphaned: Vec<InstanceId> = inner
            .instances
            .values()
            .filter(|i| i.state.is_terminal())
            .map(|i| i.id)
            .collect();
        for id in orphaned {
            if let Some(instance) = inner.instances.remove(&id) {
                inner.history.insert(
                    id,
                    HistoryRecord {
                        instance,
                        archived_at: Utc::now(),
                    },
                );
            }
        }
        Ok(count)
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Option<JobInstance>> {
        Ok(self.lock().instances.get(&id).cloned())
    }

    async fn get_state(&self, id: InstanceId) -> Result<InstanceState> {
        let inner = self.lock();
        if let Some(instance) = inner.instances.get(&id) {
            return Ok(instance.state);
        }
        if let Some(record) = inner.history.get(&id) {
            return Ok(record.instance.state);
        }
        Err(Error::not_found("instance", id))
    }

    async fn get_history(&self, id: InstanceId) -> Result<Option<HistoryRecord>> {
        Ok(self.lock().history.get(&id).cloned())
    }

    async fn list_instances(&self, filter: InstanceFilter) -> Result<Vec<JobInstance>> {
        let inner = self.lock();
        let app_name = |def: JobDefId| -> String {
            inner
                .defs
                .get(&def)
                .map(|d| d.application_name.clone())
                .unwrap_or_default()
        };
        let mut out: Vec<JobInstance> = inner
            .instances
            .values()
            .filter(|i| filter.matches(i, &app_name(i.job_def)))
            .cloned()
            .collect();
        if filter.include_history {
            out.extend(
                inner
                    .history
                    .values()
                    .filter(|h| filter.matches(&h.instance, &app_name(h.instance.job_def)))
                    .map(|h| h.instance.clone()),
            );
        }
        out.sort_by_key(|i| i.id);
        Ok(out)
    }

    async fn get_messages(&self, id: InstanceId) -> Result<Vec<Message>> {
        Ok(self.lock().messages.get(&id).cloned().unwrap_or_default())
    }

    async fn get_progress(&self, id: InstanceId) -> Result<Option<i32>> {
        let inner = self.lock();
        if let Some(instance) = inner.instances.get(&id) {
            return Ok(instance.progress);
        }
        if let Some(record) = inner.history.get(&id) {
            return Ok(record.instance.progress);
        }
        Err(Error::not_found("instance", id))
    }

    async fn get_deliverables(&self, id: InstanceId) -> Result<Vec<Deliverable>> {
        Ok(self
            .lock()
            .deliverables
            .values()
            .filter(|d| d.instance == id)
            .cloned()
            .collect())
    }

    async fn get_deliverable(&self, id: DeliverableId) -> Result<Deliverable> {
        self.lock()
            .deliverables
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("deliverable", id))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;
    use crate::model::EnqueueRequest;

    async fn seeded() -> (MemoryStore, QueueId, NodeId) {
        let store = MemoryStore::new();
        let queue = store
            .create_queue(NewQueue {
                name: "default".to_string(),
                description: String::new(),
                default_priority: 0,
                max_size: 0,
            })
            .await
            .unwrap();
        let node = store
            .create_node(NewNode {
                name: "n0".to_string(),
                host: "localhost".to_string(),
                port: 1789,
                repo_path: "/tmp/repo".into(),
                tmp_path: "/tmp/work".into(),
                dl_repo: "/tmp/dl".into(),
            })
            .await
            .unwrap();
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
            .await
            .unwrap();
        (store, queue, node)
    }

    #[tokio::test]
    async fn reservation_follows_priority_then_enqueue_order() {
        let (store, queue, node) = seeded().await;
        let low = store
            .enqueue(EnqueueRequest::new("app").with_priority(1))
            .await
            .unwrap();
        let high = store
            .enqueue(EnqueueRequest::new("app").with_priority(9))
            .await
            .unwrap();
        let mid = store
            .enqueue(EnqueueRequest::new("app").with_priority(5))
            .await
            .unwrap();

        let reserved = store.reserve_next(node, queue, 10).await.unwrap();
        let order: Vec<InstanceId> = reserved.iter().map(|i| i.id).collect();
        assert_eq!(order, vec![high, mid, low]);
        for instance in &reserved {
            assert_eq!(instance.state, InstanceState::Attributed);
            assert_eq!(instance.attributed_node, Some(node));
        }
    }

    #[tokio::test]
    async fn equal_priority_breaks_ties_by_id() {
        let (store, queue, node) = seeded().await;
        let a = store.enqueue(EnqueueRequest::new("app")).await.unwrap();
        let b = store.enqueue(EnqueueRequest::new("app")).await.unwrap();
        let reserved = store.reserve_next(node, queue, 2).await.unwrap();
        assert_eq!(
            reserved.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![a, b]
        );
    }

    #[tokio::test]
    async fn queue_size_bound_rejects_enqueue() {
        let (store, _, _) = seeded().await;
        let slow = store
            .create_queue(NewQueue {
                name: "slow".to_string(),
                description: String::new(),
                default_priority: 0,
                max_size: 3,
            })
            .await
            .unwrap();
        for _ in 0..3 {
            store
                .enqueue(EnqueueRequest::new("app").on_queue(slow))
                .await
                .unwrap();
        }
        let err = store
            .enqueue(EnqueueRequest::new("app").on_queue(slow))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull(ref name) if name == "slow"));
    }

    #[tokio::test]
    async fn highlander_definition_reserves_one_at_a_time() {
        let (store, queue, node) = seeded().await;
        store
            .create_job_definition(NewJobDefinition {
                application_name: "only-one".to_string(),
                entry_point: "only.One".to_string(),
                artifact_path: "/dev/null".to_string(),
                default_queue: queue,
                can_restart: false,
                highlander: true,
                max_time_running_ms: None,
                default_parameters: HashMap::new(),
            })
            .await
            .unwrap();
        let first = store.enqueue(EnqueueRequest::new("only-one")).await.unwrap();
        store.enqueue(EnqueueRequest::new("only-one")).await.unwrap();

        let reserved = store.reserve_next(node, queue, 10).await.unwrap();
        assert_eq!(reserved.len(), 1);
        assert_eq!(reserved[0].id, first);

        // Still blocked while the first is live.
        assert!(store.reserve_next(node, queue, 10).await.unwrap().is_empty());

        store
            .transition(first, InstanceState::Attributed, InstanceState::Running, None)
            .await
            .unwrap();
        store
            .transition(first, InstanceState::Running, InstanceState::Ended, None)
            .await
            .unwrap();
        store.archive_terminal(first).await.unwrap();

        let reserved = store.reserve_next(node, queue, 10).await.unwrap();
        assert_eq!(reserved.len(), 1);
    }

    #[tokio::test]
    async fn transition_cas_rejects_stale_observers() {
        let (store, queue, node) = seeded().await;
        let id = store.enqueue(EnqueueRequest::new("app")).await.unwrap();
        store.reserve_next(node, queue, 1).await.unwrap();

        let err = store
            .transition(id, InstanceState::Submitted, InstanceState::Hold, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateConflict { .. }));

        store
            .transition(id, InstanceState::Attributed, InstanceState::Running, None)
            .await
            .unwrap();
        assert_eq!(store.get_state(id).await.unwrap(), InstanceState::Running);
    }

    #[tokio::test]
    async fn archive_refuses_live_instances_and_keeps_history() {
        let (store, queue, node) = seeded().await;
        let id = store.enqueue(EnqueueRequest::new("app")).await.unwrap();
        assert!(matches!(
            store.archive_terminal(id).await.unwrap_err(),
            Error::StateConflict { .. }
        ));

        store.reserve_next(node, queue, 1).await.unwrap();
        store
            .transition(id, InstanceState::Attributed, InstanceState::Running, None)
            .await
            .unwrap();
        store
            .transition(
                id,
                InstanceState::Running,
                InstanceState::Ended,
                Some("ok".to_string()),
            )
            .await
            .unwrap();
        store.archive_terminal(id).await.unwrap();

        assert!(store.get_instance(id).await.unwrap().is_none());
        let record = store.get_history(id).await.unwrap().unwrap();
        assert_eq!(record.instance.state, InstanceState::Ended);
        assert_eq!(record.instance.end_reason.as_deref(), Some("ok"));
        assert_eq!(store.get_state(id).await.unwrap(), InstanceState::Ended);
    }

    #[tokio::test]
    async fn recover_crashed_archives_stranded_instances() {
        let (store, queue, node) = seeded().await;
        let a = store.enqueue(EnqueueRequest::new("app")).await.unwrap();
        let b = store.enqueue(EnqueueRequest::new("app")).await.unwrap();
        store.reserve_next(node, queue, 2).await.unwrap();
        store
            .transition(a, InstanceState::Attributed, InstanceState::Running, None)
            .await
            .unwrap();

        let recovered = store.recover_crashed(node).await.unwrap();
        assert_eq!(recovered, 2);
        for id in [a, b] {
            assert_eq!(store.get_state(id).await.unwrap(), InstanceState::Crashed);
            let record = store.get_history(id).await.unwrap().unwrap();
            assert_eq!(
                record.instance.end_reason.as_deref(),
                Some("node crash recovery")
            );
        }
        assert_eq!(store.recover_crashed(node).await.unwrap(), 0);
    }

    proptest! {
        #[test]
        fn reservation_order_is_total_and_fair(priorities in prop::collection::vec(0i32..4, 1..24)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            runtime.block_on(async {
                let (store, queue, node) = seeded().await;
                let mut by_priority: Vec<(i32, InstanceId)> = Vec::new();
                for priority in &priorities {
                    let id = store
                        .enqueue(EnqueueRequest::new("app").with_priority(*priority))
                        .await
                        .unwrap();
                    by_priority.push((*priority, id));
                }
                // Expected order: priority descending, then id ascending.
                by_priority.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

                let reserved = store.reserve_next(node, queue, priorities.len()).await.unwrap();
                let actual: Vec<InstanceId> = reserved.iter().map(|i| i.id).collect();
                let expected: Vec<InstanceId> = by_priority.iter().map(|(_, id)| *id).collect();
                prop_assert_eq!(actual, expected);
                Ok(())
            })?;
        }
    }
}
