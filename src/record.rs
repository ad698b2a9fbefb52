use crate::error::OrchestrationError;
use crate::state::{DocumentState, DocumentStateMachine};
use crate::step::{PipelineStep, StepAttempt, StepOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Type-safe document identifier.
///
/// # Examples
///
/// ```
/// use docflow::DocumentId;
///
/// let id = DocumentId::new("doc-123");
/// assert_eq!(id.as_str(), "doc-123");
///
/// // From trait for ergonomic conversion
/// let id: DocumentId = "doc-456".into();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    /// Creates a new DocumentId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Type-safe tenant identifier. Tenants are isolated customers with their
/// own data stores and service instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a new TenantId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// File reference and upload metadata carried through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentPayload {
    /// Location of the uploaded file in blob storage.
    pub file_path: String,
    /// Original file name.
    pub file_name: String,
    /// MIME type of the uploaded file.
    pub mime_type: String,
    /// Size of the uploaded file in bytes.
    pub file_size: u64,
    /// Identity of the uploader.
    pub created_by: String,
}

/// One entry in a workflow's append-only transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// State before the transition.
    pub from: DocumentState,
    /// State after the transition.
    pub to: DocumentState,
    /// When the transition was recorded.
    pub at: SystemTime,
    /// Attempt number the transition belongs to, 0 when not tied to a
    /// specific step attempt.
    pub attempt: u32,
}

/// How a recorded failure was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A collaborator failure, retryable or permanent.
    StepFailure,
    /// The step exceeded its wall-clock timeout.
    StepTimeout,
    /// Total elapsed time exceeded the workflow ceiling.
    WorkflowTimeout,
    /// An explicit cancel request.
    Cancelled,
}

/// Structured description of the error that stopped a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// The step that failed, if the failure is tied to a step.
    pub step: Option<PipelineStep>,
    /// Failure classification.
    pub kind: ErrorKind,
    /// Human-readable reason.
    pub message: String,
    /// Whether the failing step can be resumed.
    pub retryable: bool,
}

impl ErrorDetails {
    /// Failure of a specific step.
    pub fn step_failure(step: PipelineStep, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            step: Some(step),
            kind: ErrorKind::StepFailure,
            message: message.into(),
            retryable,
        }
    }

    /// Timeout of a specific step.
    pub fn step_timeout(step: PipelineStep) -> Self {
        Self {
            step: Some(step),
            kind: ErrorKind::StepTimeout,
            message: format!("step '{step}' timed out"),
            retryable: true,
        }
    }

    /// Workflow-level execution timeout.
    pub fn workflow_timeout(elapsed: Duration) -> Self {
        Self {
            step: None,
            kind: ErrorKind::WorkflowTimeout,
            message: format!("workflow exceeded execution timeout after {elapsed:?}"),
            retryable: false,
        }
    }

    /// User-initiated cancellation.
    pub fn cancelled() -> Self {
        Self {
            step: None,
            kind: ErrorKind::Cancelled,
            message: "workflow cancelled by user request".to_string(),
            retryable: false,
        }
    }
}

/// Durable record of one document's journey through the pipeline.
///
/// One record exists per (tenant, document). The record is owned exclusively
/// by the worker holding the document's lease and is persisted after every
/// transition, so a crash mid-step never loses more than the in-flight step.
/// Saves go through compare-and-swap on `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentWorkflow {
    /// Document this record tracks.
    pub document_id: DocumentId,
    /// Tenant the document belongs to.
    pub tenant_id: TenantId,
    /// Current state; always reachable from `Uploaded` via the table.
    pub current_state: DocumentState,
    /// Append-only sequence of state transitions.
    pub history: Vec<TransitionRecord>,
    /// Append-only sequence of step execution attempts.
    pub attempts: Vec<StepAttempt>,
    /// File reference and upload metadata.
    pub payload: DocumentPayload,
    /// The error that stopped the workflow, if it stopped.
    pub last_error: Option<ErrorDetails>,
    /// Consecutive failures per step in the current run segment; reset by
    /// resume so a resumed step gets a fresh retry budget.
    pub retry_counts: BTreeMap<PipelineStep, u32>,
    /// When the workflow record was created (the upload time).
    pub started_at: SystemTime,
    /// Optimistic-concurrency token, bumped by the store on every save.
    pub version: u64,
}

impl DocumentWorkflow {
    /// Creates a fresh record in the `Uploaded` state.
    pub fn new(document_id: DocumentId, tenant_id: TenantId, payload: DocumentPayload) -> Self {
        Self {
            document_id,
            tenant_id,
            current_state: DocumentState::Uploaded,
            history: Vec::new(),
            attempts: Vec::new(),
            payload,
            last_error: None,
            retry_counts: BTreeMap::new(),
            started_at: SystemTime::now(),
            version: 0,
        }
    }

    /// Applies a validated transition, appending to history.
    ///
    /// A transition already satisfied (`current == to`) is a no-op success
    /// and appends nothing, so replay after a crash is harmless.
    pub fn apply_transition(
        &mut self,
        to: DocumentState,
        attempt: u32,
    ) -> Result<(), OrchestrationError> {
        DocumentStateMachine::validate(self.current_state, to)?;
        if self.current_state == to {
            return Ok(());
        }
        self.history.push(TransitionRecord {
            from: self.current_state,
            to,
            at: SystemTime::now(),
            attempt,
        });
        self.current_state = to;
        Ok(())
    }

    /// Forces the record into `Failed`, bypassing the transition table.
    ///
    /// Reserved for cancellation and workflow-timeout enforcement, which
    /// apply from any non-terminal state.
    pub(crate) fn force_fail(&mut self, details: ErrorDetails) {
        if self.current_state != DocumentState::Failed {
            self.history.push(TransitionRecord {
                from: self.current_state,
                to: DocumentState::Failed,
                at: SystemTime::now(),
                attempt: 0,
            });
            self.current_state = DocumentState::Failed;
        }
        self.last_error = Some(details);
    }

    /// Appends an attempt record. Attempts are never rewritten.
    pub fn record_attempt(&mut self, attempt: StepAttempt) {
        self.attempts.push(attempt);
    }

    /// Total attempts ever made for a step, across resumes.
    pub fn attempt_count(&self, step: PipelineStep) -> u32 {
        self.attempts.iter().filter(|a| a.step == step).count() as u32
    }

    /// Consecutive failures of a step in the current run segment.
    pub fn retry_count(&self, step: PipelineStep) -> u32 {
        self.retry_counts.get(&step).copied().unwrap_or(0)
    }

    /// Records one more failure of a step, returning the new count.
    pub(crate) fn bump_retry(&mut self, step: PipelineStep) -> u32 {
        let count = self.retry_counts.entry(step).or_insert(0);
        *count += 1;
        *count
    }

    /// Grants a step a fresh retry budget (used by resume).
    pub(crate) fn reset_retry(&mut self, step: PipelineStep) {
        self.retry_counts.remove(&step);
    }

    /// `result_ref` of the most recent successful attempt, if any.
    pub fn last_result_ref(&self) -> Option<String> {
        self.attempts.iter().rev().find_map(|a| match &a.outcome {
            StepOutcome::Succeeded { result_ref } => result_ref.clone(),
            _ => None,
        })
    }

    /// The step recorded as failing in `last_error`, if any.
    pub fn failing_step(&self) -> Option<PipelineStep> {
        self.last_error.as_ref().and_then(|e| e.step)
    }

    /// Whether the workflow reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    /// Wall-clock time since the record was created.
    pub fn elapsed_since_upload(&self, now: SystemTime) -> Duration {
        now.duration_since(self.started_at).unwrap_or(Duration::ZERO)
    }
}
