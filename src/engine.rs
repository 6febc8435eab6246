//! Engine supervisor: boot recovery, deployment lifecycle, graceful drain.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::artifact::ArtifactCache;
use crate::config::Config;
use crate::deliverable::DeliverableStore;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::model::{BindingId, DeploymentBinding, Node, NodeId};
use crate::payload::PayloadRegistry;
use crate::poller::Poller;
use crate::registry::DeploymentRegistry;
use crate::reporting::spawn_reporter;
use crate::runner::RunnerEnv;
use crate::store::Store;

struct Deployment {
    binding: DeploymentBinding,
    dispatcher: Arc<Dispatcher>,
    poller: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// One engine process. Owns the pollers and dispatchers for every binding of
/// its node; constructed once from configuration and passed around
/// explicitly.
pub struct Engine {
    node: Node,
    store: Arc<dyn Store>,
    env: Arc<RunnerEnv>,
    registry: DeploymentRegistry,
    poll_interval: Duration,
    drain_timeout: Duration,
    deployments: Mutex<HashMap<BindingId, Deployment>>,
    reporter_task: JoinHandle<()>,
}

impl Engine {
    /// Boot the engine on `node`: recover instances stranded by a previous
    /// crash of this node, then start one poller and dispatcher per current
    /// binding.
    pub async fn start(
        store: Arc<dyn Store>,
        node: NodeId,
        payloads: Arc<PayloadRegistry>,
        config: &Config,
    ) -> Result<Engine> {
        let node = store.get_node(node).await?;
        tokio::fs::create_dir_all(&node.repo_path).await?;
        tokio::fs::create_dir_all(&node.tmp_path).await?;
        tokio::fs::create_dir_all(&node.dl_repo).await?;

        // Crash recovery must complete before the first reservation happens.
        let recovered = store.recover_crashed(node.id).await?;
        if recovered > 0 {
            warn!(count = recovered, node = %node.name, "recovered crashed instances");
        }

        let (reporter, reporter_task) = spawn_reporter(store.clone());
        let env = Arc::new(RunnerEnv {
            node: node.clone(),
            store: store.clone(),
            payloads,
            artifacts: Arc::new(ArtifactCache::new(&node.repo_path)),
            deliverables: Arc::new(DeliverableStore::new(&node.dl_repo, store.clone())),
            reporter,
            restart_on_crash: config.restart_on_crash,
            max_restart_chain: config.max_restart_chain,
            max_message_chars: config.max_message_chars,
        });
        let registry = DeploymentRegistry::new(store.clone(), node.id);

        let engine = Engine {
            node,
            store,
            env,
            registry,
            poll_interval: config.poll_interval(),
            drain_timeout: config.drain_timeout(),
            deployments: Mutex::new(HashMap::new()),
            reporter_task,
        };
        for binding in engine.registry.current().await? {
            engine.spawn_deployment(binding);
        }
        info!(node = %engine.node.name, "engine started");
        Ok(engine)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Client surface bound to this engine's store.
    pub fn client(&self) -> crate::client::Client {
        crate::client::Client::new(self.store.clone())
    }

    fn spawn_deployment(&self, binding: DeploymentBinding) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(binding.max_concurrent.max(0) as usize, self.env.clone());
        let poller = Poller::new(
            self.node.id,
            binding.id,
            binding.queue,
            self.registry.clone(),
            self.store.clone(),
            dispatcher.clone(),
            self.poll_interval,
            shutdown_rx,
        );
        let handle = tokio::spawn(poller.run());
        info!(
            binding_id = %binding.id,
            queue_id = %binding.queue,
            max_concurrent = binding.max_concurrent,
            "deployment started"
        );
        self.deployments
            .lock()
            .expect("deployments poisoned")
            .insert(
                binding.id,
                Deployment {
                    binding,
                    dispatcher,
                    poller: handle,
                    shutdown_tx,
                },
            );
    }

    /// Signal the poller and wait for its current tick, so every instance it
    /// has already reserved is either admitted or re-queued before the task
    /// goes away. A hard abort here could strand ATTRIBUTED rows until the
    /// next boot.
    async fn stop_deployment(&self, deployment: Deployment) {
        let _ = deployment.shutdown_tx.send(true);
        if let Err(e) = deployment.poller.await {
            warn!(error = %e, "poller exited abnormally");
        }
        deployment.dispatcher.drain(self.drain_timeout).await;
        info!(binding_id = %deployment.binding.id, "deployment stopped");
    }

    /// Diff current bindings against running deployments; start the new
    /// ones, stop the removed ones, restart the ones whose concurrency
    /// changed. Enable/poll-interval changes need no restart — pollers pick
    /// them up on their next tick.
    pub async fn reconfigure(&self) -> Result<()> {
        let current = self.registry.current().await?;
        let current_ids: HashSet<BindingId> = current.iter().map(|b| b.id).collect();

        let mut to_stop = Vec::new();
        {
            let mut deployments = self.deployments.lock().expect("deployments poisoned");
            let running_ids: Vec<BindingId> = deployments.keys().copied().collect();
            for id in running_ids {
                let keep = current_ids.contains(&id)
                    && current.iter().any(|b| {
                        b.id == id
                            && deployments
                                .get(&id)
                                .is_some_and(|d| d.binding.max_concurrent == b.max_concurrent)
                    });
                if !keep {
                    if let Some(deployment) = deployments.remove(&id) {
                        to_stop.push(deployment);
                    }
                }
            }
        }
        for deployment in to_stop {
            self.stop_deployment(deployment).await;
        }

        let running: HashSet<BindingId> = self
            .deployments
            .lock()
            .expect("deployments poisoned")
            .keys()
            .copied()
            .collect();
        for binding in current {
            if !running.contains(&binding.id) {
                self.spawn_deployment(binding);
            }
        }
        Ok(())
    }

    /// Stop pollers, drain dispatchers up to the configured deadline, flush
    /// the reporter.
    pub async fn shutdown(self) {
        info!(node = %self.node.name, "engine shutting down");

        let deployments: Vec<Deployment> = {
            let mut guard = self.deployments.lock().expect("deployments poisoned");
            guard.drain().map(|(_, d)| d).collect()
        };
        // Signal every poller first so they wind down in parallel, then wait
        // for each and drain its dispatcher.
        for deployment in &deployments {
            let _ = deployment.shutdown_tx.send(true);
        }
        for deployment in deployments {
            if let Err(e) = deployment.poller.await {
                warn!(error = %e, "poller exited abnormally");
            }
            deployment.dispatcher.drain(self.drain_timeout).await;
        }

        // Dropping the env releases the last Reporter clone so the writer
        // task drains and exits.
        drop(self.env);
        if let Err(e) = self.reporter_task.await {
            warn!(error = %e, "reporter task exited abnormally");
        }
        info!(node = %self.node.name, "engine stopped");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("node", &self.node.name)
            .finish()
    }
}
