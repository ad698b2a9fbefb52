use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::executor::ActivityExecutor;
use crate::queue::WorkQueue;
use crate::record::{
    DocumentId, DocumentPayload, DocumentWorkflow, ErrorDetails, TenantId, TransitionRecord,
};
use crate::retry::{FailureKind, RetryDecision, RetryPolicy};
use crate::state::DocumentState;
use crate::step::{PipelineStep, StepAttempt, StepOutcome};
use crate::store::WorkflowStore;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Reference to a started workflow.
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    /// The document the workflow processes.
    pub document_id: DocumentId,
}

/// Snapshot of a workflow's progress, served by [`WorkflowDriver::status`].
#[derive(Debug, Clone)]
pub struct WorkflowStatus {
    /// State the document is currently in.
    pub current_state: DocumentState,
    /// Full transition history.
    pub history: Vec<TransitionRecord>,
    /// Full step attempt audit trail.
    pub attempts: Vec<StepAttempt>,
    /// The error that stopped the workflow, if it stopped.
    pub last_error: Option<ErrorDetails>,
}

/// What one [`WorkflowDriver::advance`] call accomplished.
#[derive(Debug, Clone)]
pub enum Progress {
    /// The workflow was already terminal; nothing happened.
    AlreadyTerminal(DocumentState),
    /// A transition was persisted and, unless terminal, the next advance
    /// was enqueued.
    Advanced {
        /// State before this call.
        from: DocumentState,
        /// State after this call.
        to: DocumentState,
    },
    /// The step failed transiently; a retry was scheduled.
    RetryScheduled {
        /// The failing step.
        step: PipelineStep,
        /// The attempt that just failed.
        attempt: u32,
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// The workflow reached `Failed`.
    Failed {
        /// The recorded failure.
        error: ErrorDetails,
    },
    /// The record changed underneath us mid-step (for example a concurrent
    /// cancel); the in-flight step result was discarded.
    Superseded,
}

/// The durable orchestrator.
///
/// The driver keeps no state of its own beyond what it reads from and writes
/// to the store, so any worker can resume any document's workflow. One
/// `advance` call performs at most one pipeline step, guarded by the
/// document's lease; correctness against concurrent writers (cancel, a
/// worker that reclaimed an expired lease) comes from compare-and-swap
/// saves, with lost races discarding the in-flight result.
pub struct WorkflowDriver {
    store: Arc<dyn WorkflowStore>,
    queue: Arc<dyn WorkQueue>,
    executor: Arc<ActivityExecutor>,
    retry_policy: RetryPolicy,
    config: Arc<OrchestratorConfig>,
    worker_id: String,
}

impl WorkflowDriver {
    /// Creates a driver identified as `worker_id` for lease ownership.
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        queue: Arc<dyn WorkQueue>,
        executor: Arc<ActivityExecutor>,
        config: Arc<OrchestratorConfig>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            executor,
            retry_policy: config.retry_policy(),
            config,
            worker_id: worker_id.into(),
        }
    }

    /// Creates the workflow record in `Uploaded` and enqueues the first
    /// advance.
    ///
    /// # Errors
    ///
    /// [`OrchestrationError::WorkflowAlreadyExists`] if the document already
    /// has a workflow; [`OrchestrationError::QueueFull`] if the work queue
    /// rejected the initial enqueue (the record remains and can be enqueued
    /// again).
    pub async fn start(
        &self,
        document_id: DocumentId,
        tenant_id: TenantId,
        payload: DocumentPayload,
    ) -> Result<WorkflowHandle, OrchestrationError> {
        let record = DocumentWorkflow::new(document_id.clone(), tenant_id, payload);
        self.store.create(record).await?;
        info!(%document_id, "workflow started");
        self.queue
            .enqueue(document_id.clone(), SystemTime::now())
            .await?;
        Ok(WorkflowHandle { document_id })
    }

    /// Resumes a `Failed` workflow at its recorded failing step.
    ///
    /// Resume targets only the failing step: re-entering any other step
    /// could leave the record inconsistent with the collaborators' state.
    /// The step gets a fresh retry budget.
    pub async fn resume(
        &self,
        document_id: &DocumentId,
        target_step: PipelineStep,
    ) -> Result<(), OrchestrationError> {
        let lease = self
            .store
            .acquire_lease(document_id, &self.worker_id, self.config.lease_ttl)
            .await?;
        let result = self.resume_locked(document_id, target_step).await;
        if let Err(err) = self.store.release_lease(document_id, lease.token).await {
            debug!(%document_id, "lease release failed: {err}");
        }
        result
    }

    async fn resume_locked(
        &self,
        document_id: &DocumentId,
        target_step: PipelineStep,
    ) -> Result<(), OrchestrationError> {
        let mut record = self.store.load(document_id).await?;
        if record.current_state != DocumentState::Failed {
            return Err(OrchestrationError::InvalidTransition {
                from: record.current_state,
                to: target_step.entering_state(),
            });
        }
        let failing = record
            .failing_step()
            .ok_or_else(|| OrchestrationError::Storage(format!(
                "failed workflow '{document_id}' has no failing step recorded"
            )))?;
        if failing != target_step {
            return Err(OrchestrationError::ResumeTargetMismatch {
                document_id: document_id.clone(),
                requested: target_step,
                failing,
            });
        }

        record.apply_transition(target_step.entering_state(), 0)?;
        record.last_error = None;
        record.reset_retry(target_step);
        let expected = record.version;
        self.store.compare_and_swap_save(record, expected).await?;
        info!(%document_id, step = %target_step, "workflow resumed at failing step");
        self.queue
            .enqueue(document_id.clone(), SystemTime::now())
            .await
    }

    /// Cancels a workflow: any non-terminal state moves to `Failed` with a
    /// `Cancelled` error. Terminal workflows are left untouched.
    ///
    /// Cancellation does not wait for an in-flight step; the version bump
    /// makes the executing worker's subsequent save fail, discarding its
    /// result.
    pub async fn cancel(&self, document_id: &DocumentId) -> Result<(), OrchestrationError> {
        loop {
            let mut record = self.store.load(document_id).await?;
            if record.is_terminal() {
                debug!(%document_id, "cancel ignored: workflow already terminal");
                return Ok(());
            }
            record.force_fail(ErrorDetails::cancelled());
            let expected = record.version;
            match self.store.compare_and_swap_save(record, expected).await {
                Ok(_) => {
                    warn!(%document_id, "workflow cancelled");
                    return Ok(());
                }
                // Lost a race with a worker's save; reload and try again.
                Err(OrchestrationError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Reports the workflow's current state, history, and last error.
    pub async fn status(
        &self,
        document_id: &DocumentId,
    ) -> Result<WorkflowStatus, OrchestrationError> {
        let record = self.store.load(document_id).await?;
        Ok(WorkflowStatus {
            current_state: record.current_state,
            history: record.history,
            attempts: record.attempts,
            last_error: record.last_error,
        })
    }

    /// Performs at most one pipeline step for the document.
    ///
    /// Re-entrant: concurrent calls contend on the lease and the loser sees
    /// [`OrchestrationError::LeaseConflict`] without executing anything.
    /// Calling on a terminal workflow is an idempotent no-op.
    pub async fn advance(
        &self,
        document_id: &DocumentId,
    ) -> Result<Progress, OrchestrationError> {
        let lease = self
            .store
            .acquire_lease(document_id, &self.worker_id, self.config.lease_ttl)
            .await?;
        let result = self.advance_locked(document_id).await;
        if let Err(err) = self.store.release_lease(document_id, lease.token).await {
            debug!(%document_id, "lease release failed: {err}");
        }
        result
    }

    async fn advance_locked(
        &self,
        document_id: &DocumentId,
    ) -> Result<Progress, OrchestrationError> {
        let mut record = self.store.load(document_id).await?;

        if record.is_terminal() {
            debug!(%document_id, state = %record.current_state, "advance on terminal workflow is a no-op");
            return Ok(Progress::AlreadyTerminal(record.current_state));
        }

        // Workflow-level ceiling applies regardless of step state.
        let elapsed = record.elapsed_since_upload(SystemTime::now());
        if elapsed > self.config.workflow_execution_timeout {
            let details = ErrorDetails::workflow_timeout(elapsed);
            record.force_fail(details.clone());
            let expected = record.version;
            self.store.compare_and_swap_save(record, expected).await?;
            error!(%document_id, ?elapsed, "workflow exceeded execution timeout");
            return Ok(Progress::Failed { error: details });
        }

        let from = record.current_state;
        let step = match record.current_state.step_in_progress() {
            // Crash recovery or a scheduled retry: the step is already
            // entered, execute it again with the next attempt number.
            Some(step) => step,
            None => {
                if record.current_state == DocumentState::Summarized {
                    return self.complete(record).await;
                }
                let step = PipelineStep::after_resting(record.current_state).ok_or(
                    OrchestrationError::InvalidTransition {
                        from: record.current_state,
                        to: record.current_state,
                    },
                )?;
                record.apply_transition(step.entering_state(), record.attempt_count(step) + 1)?;
                let expected = record.version;
                record.version = self.store.compare_and_swap_save(record.clone(), expected).await?;
                step
            }
        };

        let attempt_number = record.attempt_count(step) + 1;
        let attempt = self.executor.execute(step, &record, attempt_number).await;
        let seed = attempt.idempotency_key.jitter_seed();
        let outcome = attempt.outcome.clone();
        record.record_attempt(attempt);

        match outcome {
            StepOutcome::Succeeded { .. } => {
                record.apply_transition(step.done_state(), attempt_number)?;
                record.last_error = None;
                record.reset_retry(step);
                self.persist_and_continue(record, from, step.done_state()).await
            }
            StepOutcome::Retryable { message } => {
                self.handle_step_failure(
                    record,
                    step,
                    FailureKind::Retryable,
                    ErrorDetails::step_failure(step, message, true),
                    seed,
                )
                .await
            }
            StepOutcome::TimedOut => {
                self.handle_step_failure(
                    record,
                    step,
                    FailureKind::Timeout,
                    ErrorDetails::step_timeout(step),
                    seed,
                )
                .await
            }
            StepOutcome::Permanent { message } => {
                let details = ErrorDetails::step_failure(step, message, false);
                self.fail(record, details).await
            }
        }
    }

    /// Finishes the pipeline: `Summarized -> Completed`.
    async fn complete(
        &self,
        mut record: DocumentWorkflow,
    ) -> Result<Progress, OrchestrationError> {
        let from = record.current_state;
        record.apply_transition(DocumentState::Completed, 0)?;
        record.last_error = None;
        let document_id = record.document_id.clone();
        let expected = record.version;
        match self.store.compare_and_swap_save(record, expected).await {
            Ok(_) => {
                info!(%document_id, "workflow completed");
                Ok(Progress::Advanced {
                    from,
                    to: DocumentState::Completed,
                })
            }
            Err(OrchestrationError::VersionConflict { .. }) => {
                warn!(%document_id, "completion discarded: record changed mid-step");
                Ok(Progress::Superseded)
            }
            Err(err) => Err(err),
        }
    }

    /// Persists a successful step and enqueues the next advance.
    async fn persist_and_continue(
        &self,
        record: DocumentWorkflow,
        from: DocumentState,
        to: DocumentState,
    ) -> Result<Progress, OrchestrationError> {
        let document_id = record.document_id.clone();
        let expected = record.version;
        match self.store.compare_and_swap_save(record, expected).await {
            Ok(_) => {}
            Err(OrchestrationError::VersionConflict { .. }) => {
                warn!(%document_id, "step result discarded: record changed mid-step");
                return Ok(Progress::Superseded);
            }
            Err(err) => return Err(err),
        }
        // At-least-once: the next step's dispatch must survive this call.
        self.queue
            .enqueue(document_id.clone(), SystemTime::now())
            .await?;
        debug!(%document_id, %from, %to, "step persisted, next advance enqueued");
        Ok(Progress::Advanced { from, to })
    }

    /// Applies the retry policy after a retryable failure or timeout.
    async fn handle_step_failure(
        &self,
        mut record: DocumentWorkflow,
        step: PipelineStep,
        kind: FailureKind,
        details: ErrorDetails,
        jitter_seed: u64,
    ) -> Result<Progress, OrchestrationError> {
        let failures = record.bump_retry(step);
        match self.retry_policy.decide(failures, kind, jitter_seed) {
            RetryDecision::Retry(delay) => {
                record.last_error = Some(details);
                let document_id = record.document_id.clone();
                let expected = record.version;
                match self.store.compare_and_swap_save(record, expected).await {
                    Ok(_) => {}
                    Err(OrchestrationError::VersionConflict { .. }) => {
                        warn!(%document_id, "retry bookkeeping discarded: record changed mid-step");
                        return Ok(Progress::Superseded);
                    }
                    Err(err) => return Err(err),
                }
                self.queue
                    .enqueue(document_id.clone(), SystemTime::now() + delay)
                    .await?;
                warn!(
                    %document_id, %step, attempt = failures, ?delay,
                    "step failed, retry scheduled"
                );
                Ok(Progress::RetryScheduled {
                    step,
                    attempt: failures,
                    delay,
                })
            }
            RetryDecision::GiveUp => self.fail(record, details).await,
        }
    }

    /// Drives the workflow to `Failed`, recording the error.
    async fn fail(
        &self,
        mut record: DocumentWorkflow,
        details: ErrorDetails,
    ) -> Result<Progress, OrchestrationError> {
        record.force_fail(details.clone());
        let document_id = record.document_id.clone();
        let expected = record.version;
        match self.store.compare_and_swap_save(record, expected).await {
            Ok(_) => {
                error!(
                    %document_id,
                    step = details.step.map(|s| s.as_str()).unwrap_or("workflow"),
                    "workflow failed: {}", details.message
                );
                Ok(Progress::Failed { error: details })
            }
            Err(OrchestrationError::VersionConflict { .. }) => {
                warn!(%document_id, "failure bookkeeping discarded: record changed mid-step");
                Ok(Progress::Superseded)
            }
            Err(err) => Err(err),
        }
    }
}
