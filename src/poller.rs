//! Per-deployment polling loop: reserve runnable instances, hand them to the
//! dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::model::{BindingId, InstanceId, NodeId, QueueId};
use crate::registry::DeploymentRegistry;
use crate::state::InstanceState;
use crate::store::Store;

/// One polling task per deployment binding. Pollers are independent; the only
/// thing they share is the store.
pub struct Poller {
    node: NodeId,
    binding: BindingId,
    queue: QueueId,
    registry: DeploymentRegistry,
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    default_poll: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: NodeId,
        binding: BindingId,
        queue: QueueId,
        registry: DeploymentRegistry,
        store: Arc<dyn Store>,
        dispatcher: Arc<Dispatcher>,
        default_poll: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            node,
            binding,
            queue,
            registry,
            store,
            dispatcher,
            default_poll,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            binding_id = %self.binding,
            queue_id = %self.queue,
            "poller started"
        );
        let mut backoff = Backoff::new(self.default_poll);

        loop {
            // Re-read the binding every tick so admin changes land within
            // one poll interval.
            let binding = match self.registry.binding(self.binding).await {
                Ok(binding) => binding,
                Err(Error::NotFound { .. }) => {
                    info!(binding_id = %self.binding, "binding removed, poller exiting");
                    return;
                }
                Err(e) => {
                    warn!(binding_id = %self.binding, error = %e, "binding reload failed");
                    if self.sleep_or_shutdown(self.default_poll).await {
                        return;
                    }
                    continue;
                }
            };
            let poll = binding
                .poll_interval_ms
                .map(|ms| Duration::from_millis(ms.max(0) as u64))
                .unwrap_or(self.default_poll);

            if binding.enabled && binding.max_concurrent > 0 {
                let free = self
                    .dispatcher
                    .free_slots()
                    .min(binding.max_concurrent as usize);
                if free > 0 {
                    match self.store.reserve_next(self.node, self.queue, free).await {
                        Ok(batch) => {
                            backoff.reset();
                            if !batch.is_empty() {
                                debug!(count = batch.len(), queue_id = %self.queue, "reserved instances");
                            }
                            for instance in batch {
                                if !self.dispatcher.try_admit(instance.clone()) {
                                    // Lost the capacity race; hand the
                                    // instance back to its queue.
                                    metrics::counter!("jobmill_admission_refused_total")
                                        .increment(1);
                                    self.requeue(instance.id).await;
                                }
                            }
                        }
                        Err(e) if e.is_transient() => {
                            metrics::counter!("jobmill_poll_backend_errors_total").increment(1);
                            let delay = backoff.next_delay();
                            warn!(
                                binding_id = %self.binding,
                                error = %e,
                                backoff_ms = delay.as_millis() as u64,
                                "backend unavailable, backing off"
                            );
                            if self.sleep_or_shutdown(delay).await {
                                return;
                            }
                            continue;
                        }
                        Err(e) => {
                            error!(binding_id = %self.binding, error = %e, "reservation failed");
                        }
                    }
                }
            }

            if self.sleep_or_shutdown(poll).await {
                return;
            }
        }
    }

    async fn requeue(&self, id: InstanceId) {
        match self
            .store
            .transition(id, InstanceState::Attributed, InstanceState::Submitted, None)
            .await
        {
            Ok(()) => debug!(instance_id = %id, "re-queued refused instance"),
            Err(Error::StateConflict { .. }) => {
                debug!(instance_id = %id, "refused instance already moved on")
            }
            Err(e) => warn!(instance_id = %id, error = %e, "re-queue failed"),
        }
    }

    /// Returns true when shutdown was signalled.
    async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => false,
            changed = self.shutdown_rx.changed() => {
                changed.is_err() || *self.shutdown_rx.borrow()
            }
        }
    }
}
