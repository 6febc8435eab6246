//! Deployment registry: the bindings a node is currently granted.
//!
//! Deliberately uncached — pollers re-read their binding every tick, so
//! administrative changes propagate within one poll interval.

use std::sync::Arc;

use crate::error::Result;
use crate::model::{BindingId, DeploymentBinding, NodeId};
use crate::store::Store;

#[derive(Clone)]
pub struct DeploymentRegistry {
    store: Arc<dyn Store>,
    node: NodeId,
}

impl DeploymentRegistry {
    pub fn new(store: Arc<dyn Store>, node: NodeId) -> Self {
        Self { store, node }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Current bindings for this node.
    pub async fn current(&self) -> Result<Vec<DeploymentBinding>> {
        self.store.bindings_for_node(self.node).await
    }

    /// One binding by id; `NotFound` once an administrator deletes it.
    pub async fn binding(&self, id: BindingId) -> Result<DeploymentBinding> {
        self.store.get_binding(id).await
    }
}

impl std::fmt::Debug for DeploymentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentRegistry")
            .field("node", &self.node)
            .finish()
    }
}
