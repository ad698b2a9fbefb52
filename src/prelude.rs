//! Commonly used types and traits

pub use crate::config::OrchestratorConfig;
pub use crate::driver::{Progress, WorkflowDriver, WorkflowHandle, WorkflowStatus};
pub use crate::error::OrchestrationError;
pub use crate::executor::ActivityExecutor;
pub use crate::pool::WorkerPool;
pub use crate::queue::{InMemoryQueue, WorkQueue};
pub use crate::record::{DocumentId, DocumentPayload, DocumentWorkflow, TenantId};
pub use crate::registry::{
    ServiceHandle, ServiceProvider, ServiceRegistry, ServiceScope,
};
pub use crate::retry::{FailureKind, RetryDecision, RetryPolicy};
pub use crate::state::{DocumentState, DocumentStateMachine};
pub use crate::step::{
    InvokeError, PipelineStep, StepOutput, StepRequest, StepService,
};
pub use crate::store::{InMemoryStore, WorkflowStore};
