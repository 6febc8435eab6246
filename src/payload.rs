//! Payload surface: the trait user code implements and the registry the
//! engine resolves entry points against.
//!
//! A payload only ever sees its [`JobContext`]; engine internals stay out of
//! reach, and each payload runs in its own task so instances cannot disturb
//! each other's execution state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::JobContext;

/// Failure raised by a payload, or the cancellation signal propagated out of
/// a yield point.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The engine asked the instance to stop; raise this through to the
    /// runner untouched.
    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }
}

/// One runnable application. Implementations must call
/// [`JobContext::yield_now`] regularly; an instance that never yields cannot
/// be interrupted.
#[async_trait]
pub trait Payload: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError>;
}

type PayloadFn =
    Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

struct FnPayload {
    run: PayloadFn,
}

#[async_trait]
impl Payload for FnPayload {
    async fn run(&self, ctx: JobContext) -> Result<(), JobError> {
        (self.run)(ctx).await
    }
}

/// Entry-point name to executable code. The in-process rendition of the
/// deployable's declared entry point; resolution failure is an artifact
/// error, never a payload error.
#[derive(Default)]
pub struct PayloadRegistry {
    entries: RwLock<HashMap<String, Arc<dyn Payload>>>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry_point: impl Into<String>, payload: Arc<dyn Payload>) {
        self.entries
            .write()
            .expect("registry poisoned")
            .insert(entry_point.into(), payload);
    }

    /// Register an async closure as a payload.
    pub fn register_fn<F, Fut>(&self, entry_point: impl Into<String>, run: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let run: PayloadFn = Arc::new(move |ctx| Box::pin(run(ctx)));
        self.register(entry_point, Arc::new(FnPayload { run }));
    }

    pub fn resolve(&self, entry_point: &str) -> Option<Arc<dyn Payload>> {
        self.entries
            .read()
            .expect("registry poisoned")
            .get(entry_point)
            .cloned()
    }
}

impl std::fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .entries
            .read()
            .expect("registry poisoned")
            .keys()
            .cloned()
            .collect();
        f.debug_struct("PayloadRegistry")
            .field("entries", &names)
            .finish()
    }
}
