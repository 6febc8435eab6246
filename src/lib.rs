//! Jobmill - a persistent, distributed batch-execution engine.
//!
//! Producers submit execution requests referencing a job definition; engine
//! nodes pull runnable requests from queues according to deployment bindings,
//! run the payload under a capability sandbox, and record outcomes. The key
//! components are:
//!
//! ## Scheduling
//!
//! - [`Engine`]: supervisor owning one [`Poller`] and [`Dispatcher`] per
//!   deployment binding, with crash recovery on boot and graceful drain
//! - [`store::Store`]: persistence gateway with pessimistic reservation
//!   locking ([`MemoryStore`] for tests and embedded runs, [`PgStore`] for
//!   PostgreSQL)
//!
//! ## Execution
//!
//! - [`Payload`]: the trait user code implements, resolved through a
//!   [`PayloadRegistry`]
//! - [`JobContext`]: the capability object payloads run against (messages,
//!   progress, deliverables, child requests, cooperative cancellation)
//!
//! ## Clients
//!
//! - [`Client`]: enqueue, monitor, kill, pause and retrieve results

pub mod artifact;
pub mod backoff;
pub mod client;
pub mod config;
pub mod context;
pub mod deliverable;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod model;
pub mod payload;
pub mod poller;
pub mod registry;
pub mod reporting;
pub mod runner;
pub mod state;
pub mod store;
pub mod telemetry;

// Configuration
pub use config::Config;

// Errors
pub use error::{Error, Result};

// Model
pub use model::{
    BindingId, Deliverable, DeliverableId, DeploymentBinding, EnqueueRequest, HistoryRecord,
    InstanceFilter, InstanceId, JobDefId, JobDefinition, JobInstance, Message, Node, NodeId, Queue,
    QueueId, UserTags,
};
pub use state::InstanceState;

// Store
pub use store::{
    MemoryStore, NewBinding, NewDeliverable, NewJobDefinition, NewNode, NewQueue, PgStore, Store,
};

// Engine
pub use dispatcher::Dispatcher;
pub use engine::Engine;
pub use poller::Poller;
pub use registry::DeploymentRegistry;
pub use runner::{Runner, RunnerEnv};

// Payload surface
pub use context::JobContext;
pub use payload::{JobError, Payload, PayloadRegistry};

// Clients
pub use client::Client;
