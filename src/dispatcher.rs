//! Per-deployment worker pool: bounded admission, runner spawn, drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::model::JobInstance;
use crate::runner::{Runner, RunnerEnv};

const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Bounded concurrency primitive guarding runner spawns for one deployment.
///
/// Admission is non-blocking; the permit travels with the spawned runner task
/// and returns to the pool when the runner exits, on any path.
pub struct Dispatcher {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    draining: AtomicBool,
    env: Arc<RunnerEnv>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(capacity: usize, env: Arc<RunnerEnv>) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            draining: AtomicBool::new(false),
            env,
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Slots a poller may fill right now.
    pub fn free_slots(&self) -> usize {
        if self.draining.load(Ordering::SeqCst) {
            return 0;
        }
        self.semaphore.available_permits()
    }

    /// Admit one reserved instance. Refuses when draining or at capacity; the
    /// caller re-queues refused instances.
    pub fn try_admit(self: &Arc<Self>, instance: JobInstance) -> bool {
        if self.draining.load(Ordering::SeqCst) {
            return false;
        }
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            return false;
        };
        metrics::counter!("jobmill_instances_admitted_total").increment(1);
        let env = Arc::clone(&self.env);
        let handle = tokio::spawn(async move {
            Runner::new(env, instance).execute().await;
            drop(permit);
        });
        let mut handles = self.handles.lock().expect("dispatcher poisoned");
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        true
    }

    /// Refuse new work and wait for in-flight runners, force-cancelling
    /// whatever is still running at the deadline.
    pub async fn drain(&self, deadline: Duration) {
        self.draining.store(true, Ordering::SeqCst);
        let give_up = Instant::now() + deadline;
        while self.semaphore.available_permits() < self.capacity {
            if Instant::now() >= give_up {
                let handles: Vec<JoinHandle<()>> = {
                    let mut guard = self.handles.lock().expect("dispatcher poisoned");
                    guard.drain(..).collect()
                };
                let aborted = handles.iter().filter(|h| !h.is_finished()).count();
                for handle in &handles {
                    handle.abort();
                }
                warn!(aborted, "drain deadline reached, force-cancelled runners");
                return;
            }
            sleep(DRAIN_POLL).await;
        }
        debug!("dispatcher drained");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
