use crate::config::OrchestratorConfig;
use crate::record::DocumentWorkflow;
use crate::registry::ServiceRegistry;
use crate::step::{
    IdempotencyKey, InvokeError, PipelineStep, StepAttempt, StepOutcome, StepRequest,
};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{info, warn};

/// Executes a single pipeline step against its external collaborator.
///
/// The executor resolves the collaborator through the [`ServiceRegistry`],
/// presents the attempt's idempotency key so retried calls have at most one
/// externally visible effect, and enforces the configured per-step
/// wall-clock timeout. Process-wide activity concurrency is bounded by an
/// internal semaphore sized from `max_concurrent_activities`.
///
/// Every invocation yields exactly one [`StepAttempt`], whatever the
/// outcome; the driver persists it.
pub struct ActivityExecutor {
    registry: Arc<ServiceRegistry>,
    config: Arc<OrchestratorConfig>,
    activity_permits: Arc<Semaphore>,
}

impl ActivityExecutor {
    /// Creates an executor bounded by `config.max_concurrent_activities`.
    pub fn new(registry: Arc<ServiceRegistry>, config: Arc<OrchestratorConfig>) -> Self {
        let activity_permits = Arc::new(Semaphore::new(config.max_concurrent_activities.max(1)));
        Self {
            registry,
            config,
            activity_permits,
        }
    }

    /// Runs attempt `attempt_number` of `step` for the given workflow.
    pub async fn execute(
        &self,
        step: PipelineStep,
        record: &DocumentWorkflow,
        attempt_number: u32,
    ) -> StepAttempt {
        let idempotency_key = IdempotencyKey::derive(&record.document_id, step, attempt_number);
        let started_at = SystemTime::now();

        let outcome = match self.activity_permits.acquire().await {
            Ok(_permit) => {
                self.invoke_collaborator(step, record, &idempotency_key)
                    .await
            }
            // Semaphore closed only during teardown; treat as transient.
            Err(_) => StepOutcome::Retryable {
                message: "executor is shutting down".to_string(),
            },
        };

        StepAttempt {
            step,
            idempotency_key,
            attempt_number,
            started_at,
            outcome,
        }
    }

    async fn invoke_collaborator(
        &self,
        step: PipelineStep,
        record: &DocumentWorkflow,
        idempotency_key: &IdempotencyKey,
    ) -> StepOutcome {
        let handle = match self.registry.resolve(&record.tenant_id, step).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(%step, document_id = %record.document_id, "collaborator resolution failed: {err}");
                return StepOutcome::Retryable {
                    message: err.to_string(),
                };
            }
        };

        let request = StepRequest {
            tenant_id: record.tenant_id.clone(),
            document_id: record.document_id.clone(),
            idempotency_key: idempotency_key.clone(),
            payload: record.payload.clone(),
            prior_result_ref: record.last_result_ref(),
        };

        match timeout(self.config.step_timeout(step), handle.invoke(request)).await {
            Ok(Ok(output)) => {
                info!(%step, document_id = %record.document_id, "step completed successfully");
                StepOutcome::Succeeded {
                    result_ref: output.result_ref,
                }
            }
            Ok(Err(InvokeError::Retryable(message))) => {
                warn!(%step, document_id = %record.document_id, "step failed (retryable): {message}");
                StepOutcome::Retryable { message }
            }
            Ok(Err(InvokeError::Permanent(message))) => {
                warn!(%step, document_id = %record.document_id, "step failed (permanent): {message}");
                StepOutcome::Permanent { message }
            }
            Err(_) => {
                warn!(%step, document_id = %record.document_id, "step timed out");
                StepOutcome::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;
    use crate::record::{DocumentId, DocumentPayload, TenantId};
    use crate::registry::{ServiceHandle, ServiceProvider, ServiceScope};
    use crate::step::{StepOutput, StepService};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FixedService {
        behavior: Behavior,
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        FailPermanent,
        Hang,
    }

    #[async_trait]
    impl StepService for FixedService {
        async fn invoke(&self, request: StepRequest) -> Result<StepOutput, InvokeError> {
            match self.behavior {
                Behavior::Succeed => Ok(StepOutput {
                    result_ref: Some(format!("out:{}", request.idempotency_key)),
                }),
                Behavior::FailPermanent => {
                    Err(InvokeError::Permanent("malformed document".to_string()))
                }
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(StepOutput { result_ref: None })
                }
            }
        }
    }

    struct FixedProvider(Behavior);

    #[async_trait]
    impl ServiceProvider for FixedProvider {
        async fn create(
            &self,
            _tenant_id: &TenantId,
        ) -> Result<ServiceHandle, OrchestrationError> {
            Ok(Arc::new(FixedService { behavior: self.0 }))
        }
    }

    fn executor_with(behavior: Behavior, config: OrchestratorConfig) -> ActivityExecutor {
        let mut builder = ServiceRegistry::builder();
        for step in PipelineStep::ALL {
            builder = builder.register(step, ServiceScope::Shared, Arc::new(FixedProvider(behavior)));
        }
        ActivityExecutor::new(Arc::new(builder.build().unwrap()), Arc::new(config))
    }

    fn record() -> DocumentWorkflow {
        DocumentWorkflow::new(
            DocumentId::new("doc-1"),
            TenantId::new("t1"),
            DocumentPayload {
                file_path: "tenants/t1/doc-1.pdf".to_string(),
                file_name: "doc-1.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
                file_size: 512,
                created_by: "user-1".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_success_carries_result_ref_and_key() {
        let executor = executor_with(Behavior::Succeed, OrchestratorConfig::default());
        let attempt = executor
            .execute(PipelineStep::TextExtraction, &record(), 1)
            .await;

        assert_eq!(attempt.attempt_number, 1);
        assert_eq!(attempt.idempotency_key.as_str(), "doc-1:text_extraction:1");
        assert_eq!(
            attempt.outcome,
            StepOutcome::Succeeded {
                result_ref: Some("out:doc-1:text_extraction:1".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_maps_to_permanent_outcome() {
        let executor = executor_with(Behavior::FailPermanent, OrchestratorConfig::default());
        let attempt = executor
            .execute(PipelineStep::Classification, &record(), 2)
            .await;
        assert_eq!(
            attempt.outcome,
            StepOutcome::Permanent {
                message: "malformed document".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_hung_collaborator_yields_timeout_outcome() {
        let mut config = OrchestratorConfig::default();
        config.step_timeouts.clear();
        config.default_step_timeout = Duration::from_millis(20);

        let executor = executor_with(Behavior::Hang, config);
        let attempt = executor.execute(PipelineStep::Chunking, &record(), 1).await;
        assert_eq!(attempt.outcome, StepOutcome::TimedOut);
    }
}
