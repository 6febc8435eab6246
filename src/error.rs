//! Engine error taxonomy surfaced to callers and payloads.

use crate::model::InstanceId;
use crate::state::InstanceState;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Enqueue rejected because the target queue is at its size bound.
    #[error("queue {0} is full")]
    QueueFull(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// CAS failure on a state transition. Internal: the engine resolves these
    /// itself and never returns them through the client surface.
    #[error("instance {id} is {actual}, expected {expected}")]
    StateConflict {
        id: InstanceId,
        expected: InstanceState,
        actual: InstanceState,
    },

    /// Transient persistence failure. Engine loops retry with backoff.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Deployable missing or entry point unknown. Never restarted.
    #[error("artifact unavailable: {0}")]
    ArtifactUnavailable(String),

    /// Failure raised by the payload itself.
    #[error("payload failed: {0}")]
    Payload(String),

    /// The instance went to KILLED or CANCELLED before completing.
    #[error("instance {0} was cancelled")]
    Cancelled(InstanceId),

    /// The instance exceeded its run deadline.
    #[error("instance {0} exceeded its run deadline")]
    Timeout(InstanceId),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// True for failures that a retry loop may resolve.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
