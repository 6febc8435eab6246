//! Runner: drives one instance from reservation to its terminal state.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactCache;
use crate::backoff::Backoff;
use crate::context::{ContextParts, JobContext};
use crate::deliverable::DeliverableStore;
use crate::error::{Error, Result};
use crate::model::{
    merge_parameters, EnqueueRequest, InstanceId, JobDefinition, JobInstance, Node,
};
use crate::payload::{JobError, Payload, PayloadRegistry};
use crate::reporting::{Reporter, RunLog};
use crate::state::InstanceState;
use crate::store::Store;

const STORE_RETRY_BASE: Duration = Duration::from_millis(250);
const STORE_RETRY_ATTEMPTS: u32 = 6;

/// Shared environment every runner on a node executes against.
pub struct RunnerEnv {
    pub node: Node,
    pub store: Arc<dyn Store>,
    pub payloads: Arc<PayloadRegistry>,
    pub artifacts: Arc<ArtifactCache>,
    pub deliverables: Arc<DeliverableStore>,
    pub reporter: Reporter,
    /// Global default for definitions without an explicit restart policy.
    pub restart_on_crash: bool,
    pub max_restart_chain: i32,
    pub max_message_chars: usize,
}

/// Executes one instance end to end. Consumed by [`Runner::execute`].
pub struct Runner {
    env: Arc<RunnerEnv>,
    instance: JobInstance,
}

impl Runner {
    pub fn new(env: Arc<RunnerEnv>, instance: JobInstance) -> Self {
        Self { env, instance }
    }

    pub async fn execute(self) {
        let id = self.instance.id;
        if let Err(e) = self.drive().await {
            metrics::counter!("jobmill_runner_errors_total").increment(1);
            error!(instance_id = %id, error = %e, "runner gave up");
        }
    }

    async fn drive(self) -> Result<()> {
        let env = self.env;
        let instance = self.instance;
        let id = instance.id;

        // Prepare: definition, deployable, entry point. Failures here are
        // configuration errors and never restart.
        let def = match with_store_retry(|| env.store.get_job_definition(instance.job_def)).await {
            Ok(def) => def,
            Err(Error::NotFound { .. }) => {
                return finish_before_start(
                    &env,
                    id,
                    InstanceState::Crashed,
                    format!("definition {} no longer exists", instance.job_def),
                )
                .await;
            }
            Err(e) => return Err(e),
        };
        let payload = match prepare_payload(&env, &def).await {
            Ok(payload) => payload,
            Err(reason) => {
                return finish_before_start(&env, id, InstanceState::Crashed, reason).await;
            }
        };

        let parameters = merge_parameters(&def.default_parameters, &instance.parameters);

        // A kill issued between reservation and start wins without invoking
        // the payload.
        if with_store_retry(|| env.store.kill_requested(id))
            .await
            .unwrap_or(false)
        {
            return finish_before_start(
                &env,
                id,
                InstanceState::Killed,
                "killed before start".to_string(),
            )
            .await;
        }

        match with_store_retry(|| {
            env.store
                .transition(id, InstanceState::Attributed, InstanceState::Running, None)
        })
        .await
        {
            Ok(()) => {}
            Err(Error::StateConflict { actual, .. }) => {
                // Lost the start CAS; whoever won owns the side effects.
                debug!(instance_id = %id, %actual, "start superseded");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let work_dir = env.node.tmp_path.join(format!("instance-{id}"));
        tokio::fs::create_dir_all(&work_dir).await?;
        let run_log = RunLog::new(work_dir.join("run.log"));
        run_log
            .append(&format!(
                "instance {id} of {} starting on node {}",
                def.application_name, env.node.name
            ))
            .await;

        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = def
            .max_time_running_ms
            .map(|ms| spawn_watchdog(env.store.clone(), id, ms, timed_out.clone()));

        let ctx = JobContext::new(ContextParts {
            instance: id,
            definition: def.clone(),
            parent: instance.parent,
            tags: instance.tags.clone(),
            parameters,
            work_dir: work_dir.clone(),
            store: env.store.clone(),
            reporter: env.reporter.clone(),
            deliverables: env.deliverables.clone(),
            run_log: run_log.clone(),
            max_message_chars: env.max_message_chars,
        });

        info!(instance_id = %id, application = %def.application_name, "instance running");
        // The payload runs in its own task: a panic is contained there and
        // surfaces as a join error instead of tearing the runner down. The
        // guard takes the payload down with the runner if the runner itself
        // is force-cancelled during drain.
        let invocation: JoinHandle<std::result::Result<(), JobError>> = tokio::spawn({
            let payload = payload.clone();
            let ctx = ctx.clone();
            async move { payload.run(ctx).await }
        });
        let _payload_guard = AbortOnDrop(invocation.abort_handle());
        let outcome = match invocation.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                Err(JobError::failed("payload panicked"))
            }
            Err(_) => Err(JobError::failed("payload task aborted")),
        };
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let (terminal, reason, crashed) = match &outcome {
            Ok(()) => (InstanceState::Ended, "ok".to_string(), false),
            Err(JobError::Cancelled) => {
                let reason = if timed_out.load(Ordering::SeqCst) {
                    "timeout"
                } else {
                    "killed by request"
                };
                (InstanceState::Killed, reason.to_string(), false)
            }
            Err(e) => (InstanceState::Crashed, e.to_string(), true),
        };
        run_log
            .append(&format!("instance {id} ending {terminal} ({reason})"))
            .await;

        // Capture the run log before the work dir is purged.
        if let Err(e) = env
            .deliverables
            .add(id, run_log.path(), Some("run log".to_string()))
            .await
        {
            warn!(instance_id = %id, error = %e, "run log capture failed");
        }

        match with_store_retry(|| {
            env.store
                .transition(id, InstanceState::Running, terminal, Some(reason.clone()))
        })
        .await
        {
            Ok(()) => {}
            Err(Error::StateConflict { actual, .. }) => {
                warn!(instance_id = %id, %actual, "terminal transition superseded");
            }
            Err(e) => return Err(e),
        }
        with_store_retry(|| env.store.archive_terminal(id)).await?;
        info!(instance_id = %id, state = %terminal, reason = %reason, "instance finished");

        if crashed {
            maybe_restart(&env, &def, &instance).await;
        }

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!(instance_id = %id, error = %e, "work dir purge failed");
        }
        Ok(())
    }
}

async fn prepare_payload(
    env: &RunnerEnv,
    def: &JobDefinition,
) -> std::result::Result<Arc<dyn Payload>, String> {
    if let Err(e) = env.artifacts.ensure(&def.artifact_path).await {
        return Err(format!("artifact load failed: {e}"));
    }
    env.payloads
        .resolve(&def.entry_point)
        .ok_or_else(|| format!("entry point {} is not registered", def.entry_point))
}

/// Terminal transition for an instance that never reached RUNNING.
async fn finish_before_start(
    env: &RunnerEnv,
    id: InstanceId,
    terminal: InstanceState,
    reason: String,
) -> Result<()> {
    match with_store_retry(|| {
        env.store
            .transition(id, InstanceState::Attributed, terminal, Some(reason.clone()))
    })
    .await
    {
        Ok(()) => {
            with_store_retry(|| env.store.archive_terminal(id)).await?;
            info!(instance_id = %id, state = %terminal, reason = %reason, "instance finished before start");
            Ok(())
        }
        Err(Error::StateConflict { actual, .. }) => {
            debug!(instance_id = %id, %actual, "pre-start finish superseded");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn maybe_restart(env: &RunnerEnv, def: &JobDefinition, instance: &JobInstance) {
    let restartable = def.can_restart || env.restart_on_crash;
    if !restartable || instance.restart_count >= env.max_restart_chain {
        return;
    }
    let request = EnqueueRequest {
        application_name: def.application_name.clone(),
        queue: Some(instance.queue),
        priority: Some(instance.priority),
        tags: instance.tags.clone(),
        parameters: instance.parameters.clone(),
        parent: Some(instance.id),
        restart_count: instance.restart_count + 1,
    };
    match env.store.enqueue(request).await {
        Ok(new_id) => {
            metrics::counter!("jobmill_instances_restarted_total").increment(1);
            info!(
                instance_id = %instance.id,
                restarted_as = %new_id,
                chain = instance.restart_count + 1,
                "crashed instance re-enqueued"
            );
        }
        Err(e) => warn!(instance_id = %instance.id, error = %e, "restart enqueue failed"),
    }
}

fn spawn_watchdog(
    store: Arc<dyn Store>,
    id: InstanceId,
    deadline_ms: i64,
    timed_out: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(deadline_ms.max(0) as u64)).await;
        timed_out.store(true, Ordering::SeqCst);
        match with_store_retry(|| store.request_kill(id)).await {
            Ok(()) => debug!(instance_id = %id, "run deadline reached, kill requested"),
            Err(e) => warn!(instance_id = %id, error = %e, "deadline kill request failed"),
        }
    })
}

/// Aborts the wrapped task when dropped; a no-op once the task has finished.
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Retry transient store failures with backoff; everything else propagates.
async fn with_store_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(STORE_RETRY_BASE);
    loop {
        match op().await {
            Err(e) if e.is_transient() && backoff.attempt() < STORE_RETRY_ATTEMPTS => {
                tokio::time::sleep(backoff.next_delay()).await;
            }
            other => return other,
        }
    }
}
