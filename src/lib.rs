//! # Docflow
//!
//! A durable orchestration engine for multi-step document processing
//! pipelines.
//!
//! Every uploaded document moves through a fixed five-step pipeline (text
//! extraction, chunking, classification, vectorization, summarization),
//! tracked by an explicit state machine and persisted after every
//! transition. Workers may crash, collaborating services may flake, and the
//! pipeline still converges: each step is retried with exponential backoff,
//! each invocation carries an idempotency key, and a failed workflow can be
//! resumed at its failing step without redoing completed work.
//!
//! ## Features
//!
//! - **Type-safe**: [`DocumentId`], [`TenantId`] and [`PipelineStep`]
//!   newtypes prevent mixups at compile time
//! - **Explicit state machine**: every transition is validated against a
//!   fixed table and appended to an auditable history
//! - **Async first**: built on `tokio` and `async-trait`
//! - **Retry support**: exponential backoff with jitter, permanent failures
//!   bypass retries entirely
//! - **Crash tolerant**: leases fence concurrent workers, versioned
//!   compare-and-swap persistence discards stale in-flight results
//! - **Resumable**: `Failed` workflows restart at the failing step with a
//!   fresh retry budget
//!
//! ## Quick Start
//!
//! ```rust
//! use docflow::prelude::*;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct EchoService;
//!
//! #[async_trait]
//! impl StepService for EchoService {
//!     async fn invoke(&self, request: StepRequest) -> Result<StepOutput, InvokeError> {
//!         Ok(StepOutput {
//!             result_ref: Some(format!("artifacts/{}", request.idempotency_key)),
//!         })
//!     }
//! }
//!
//! struct EchoProvider;
//!
//! #[async_trait]
//! impl ServiceProvider for EchoProvider {
//!     async fn create(&self, _tenant_id: &TenantId) -> Result<ServiceHandle, OrchestrationError> {
//!         Ok(Arc::new(EchoService))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), OrchestrationError> {
//! let provider: Arc<dyn ServiceProvider> = Arc::new(EchoProvider);
//! let mut builder = ServiceRegistry::builder();
//! for step in PipelineStep::ALL {
//!     builder = builder.register_shared(step, provider.clone());
//! }
//! let registry = Arc::new(builder.build()?);
//!
//! let config = Arc::new(OrchestratorConfig::default());
//! let store: Arc<dyn WorkflowStore> = Arc::new(InMemoryStore::new());
//! let queue: Arc<dyn WorkQueue> = Arc::new(InMemoryQueue::new(config.queue_capacity));
//! let executor = Arc::new(ActivityExecutor::new(registry, config.clone()));
//! let driver = WorkflowDriver::new(store, queue, executor, config, "worker-1");
//!
//! let handle = driver
//!     .start(
//!         DocumentId::new("doc-1"),
//!         TenantId::new("tenant-1"),
//!         DocumentPayload {
//!             file_path: "uploads/doc-1.pdf".to_string(),
//!             file_name: "doc-1.pdf".to_string(),
//!             mime_type: "application/pdf".to_string(),
//!             file_size: 1024,
//!             created_by: "user-1".to_string(),
//!         },
//!     )
//!     .await?;
//!
//! // Drive the workflow by hand; a `WorkerPool` does this in production.
//! while !driver.status(&handle.document_id).await?.current_state.is_terminal() {
//!     driver.advance(&handle.document_id).await?;
//! }
//!
//! let status = driver.status(&handle.document_id).await?;
//! assert_eq!(status.current_state, DocumentState::Completed);
//! assert!(status.last_error.is_none());
//! # Ok(())
//! # }
//! ```
//!
//! ## Handling Failures
//!
//! Collaborators classify their failures through [`InvokeError`]:
//! `Retryable` errors are retried with exponential backoff and jitter until
//! the per-step attempt budget runs out, `Permanent` errors fail the
//! workflow immediately. Either way the workflow lands in
//! `DocumentState::Failed` with structured [`ErrorDetails`] and can be
//! inspected via [`WorkflowDriver::status`] and restarted at the failing
//! step via [`WorkflowDriver::resume`].
//!
//! ## Architecture
//!
//! - [`DocumentStateMachine`] — document states and the transition table
//! - [`PipelineStep`] / [`StepService`] — the five steps and the
//!   collaborator contract, keyed by [`IdempotencyKey`]
//! - [`DocumentWorkflow`] — the persisted record with history and audit trail
//! - [`RetryPolicy`] — exponential backoff with deterministic jitter
//! - [`ServiceRegistry`] — cached, single-flight collaborator resolution
//! - [`WorkflowStore`] / [`WorkQueue`] — persistence and scheduling seams
//!   with in-memory implementations
//! - [`ActivityExecutor`] — one timed, bounded step invocation
//! - [`WorkflowDriver`] — lease-guarded orchestration, one step per advance
//! - [`WorkerPool`] — bounded polling loop dispatching advances

mod config;
mod driver;
mod error;
mod executor;
mod pool;
mod queue;
mod record;
mod registry;
mod retry;
mod state;
mod step;
mod store;

pub mod prelude;

pub use config::OrchestratorConfig;
pub use driver::{Progress, WorkflowDriver, WorkflowHandle, WorkflowStatus};
pub use error::OrchestrationError;
pub use executor::ActivityExecutor;
pub use pool::WorkerPool;
pub use queue::{InMemoryQueue, WorkQueue};
pub use record::{
    DocumentId, DocumentPayload, DocumentWorkflow, ErrorDetails, ErrorKind, TenantId,
    TransitionRecord,
};
pub use registry::{
    ServiceHandle, ServiceProvider, ServiceRegistry, ServiceRegistryBuilder, ServiceScope,
};
pub use retry::{FailureKind, RetryDecision, RetryPolicy};
pub use state::{DocumentState, DocumentStateMachine};
pub use step::{
    IdempotencyKey, InvokeError, PipelineStep, StepAttempt, StepOutcome, StepOutput, StepRequest,
    StepService,
};
pub use store::{InMemoryStore, Lease, WorkflowStore};
