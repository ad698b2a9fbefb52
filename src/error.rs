use crate::record::DocumentId;
use crate::state::DocumentState;
use crate::step::PipelineStep;
use thiserror::Error;

/// Errors produced by the orchestration engine.
///
/// Each variant carries the identifiers needed to act on the error. Variants
/// fall into three groups:
///
/// - **Fatal** (`InvalidTransition`, `Configuration`): programming or
///   data-integrity bugs, never auto-retried.
/// - **Transient** (`LeaseConflict`, `VersionConflict`, `QueueFull`,
///   `Storage`, `ServiceUnavailable`): safe to retry after a delay.
/// - **Terminal for a document** (`WorkflowTimeout`, `Cancelled`,
///   `StepPermanentFailure`): recorded as the workflow's last error, visible
///   through status queries.
///
/// # Non-Exhaustive
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code. When matching
/// on this error, always include a wildcard pattern.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OrchestrationError {
    /// A state transition outside the allowed table was attempted.
    ///
    /// This indicates a bug or a corrupted record, never a runtime condition
    /// worth retrying.
    #[error("invalid transition from '{from}' to '{to}'")]
    InvalidTransition {
        /// State the document was in
        from: DocumentState,
        /// State that was requested
        to: DocumentState,
    },

    /// A pipeline step exceeded its configured wall-clock timeout.
    #[error("step '{step}' timed out for document '{document_id}'")]
    StepTimeout {
        /// The step that timed out
        step: PipelineStep,
        /// The document being processed
        document_id: DocumentId,
    },

    /// A collaborator reported an unrecoverable input problem.
    ///
    /// Terminal for the document, not for the system.
    #[error("step '{step}' failed permanently: {details}")]
    StepPermanentFailure {
        /// The step that failed
        step: PipelineStep,
        /// Collaborator-reported reason
        details: String,
    },

    /// Total processing time exceeded the workflow execution ceiling.
    #[error("workflow for document '{document_id}' exceeded its execution timeout")]
    WorkflowTimeout {
        /// The document whose workflow timed out
        document_id: DocumentId,
    },

    /// Another worker currently holds the lease for this document.
    ///
    /// Transient: retry acquisition after a short delay.
    #[error("lease for document '{document_id}' is held by '{holder}'")]
    LeaseConflict {
        /// The contested document
        document_id: DocumentId,
        /// Identity of the current lease holder
        holder: String,
    },

    /// The workflow was cancelled by an explicit user request.
    #[error("workflow for document '{document_id}' was cancelled")]
    Cancelled {
        /// The cancelled document
        document_id: DocumentId,
    },

    /// An optimistic-concurrency save observed a newer record version.
    ///
    /// The caller's in-flight result must be discarded and the record
    /// reloaded before any further write.
    #[error("version conflict saving document '{document_id}': expected {expected}, found {found}")]
    VersionConflict {
        /// The contested document
        document_id: DocumentId,
        /// Version the caller based its write on
        expected: u64,
        /// Version found in the store
        found: u64,
    },

    /// No workflow record exists for the document.
    #[error("no workflow found for document '{0}'")]
    WorkflowNotFound(DocumentId),

    /// A workflow record already exists for the document.
    #[error("workflow already exists for document '{0}'")]
    WorkflowAlreadyExists(DocumentId),

    /// A resume request named a step other than the recorded failing step.
    #[error("cannot resume document '{document_id}' at '{requested}': it failed at '{failing}'")]
    ResumeTargetMismatch {
        /// The document being resumed
        document_id: DocumentId,
        /// Step the caller asked to resume at
        requested: PipelineStep,
        /// Step recorded in the workflow's last error
        failing: PipelineStep,
    },

    /// The work queue is at capacity.
    ///
    /// A retryable busy signal: back off and enqueue again.
    #[error("work queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity
        capacity: usize,
    },

    /// The durable store failed in a way unrelated to any single record.
    #[error("storage error: {0}")]
    Storage(String),

    /// No collaborator is registered for a step, or handle creation failed.
    #[error("service unavailable for step '{step}': {details}")]
    ServiceUnavailable {
        /// The step missing a collaborator
        step: PipelineStep,
        /// Why resolution failed
        details: String,
    },

    /// Invalid configuration detected at process start.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl OrchestrationError {
    /// Whether the error is transient and safe to retry after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestrationError::LeaseConflict { .. }
                | OrchestrationError::VersionConflict { .. }
                | OrchestrationError::QueueFull { .. }
                | OrchestrationError::Storage(_)
                | OrchestrationError::ServiceUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = OrchestrationError::InvalidTransition {
            from: DocumentState::Uploaded,
            to: DocumentState::Completed,
        };
        assert_eq!(
            error.to_string(),
            "invalid transition from 'uploaded' to 'completed'"
        );

        let error = OrchestrationError::LeaseConflict {
            document_id: DocumentId::new("doc-1"),
            holder: "worker-7".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "lease for document 'doc-1' is held by 'worker-7'"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(OrchestrationError::QueueFull { capacity: 8 }.is_transient());
        assert!(OrchestrationError::Storage("connection reset".into()).is_transient());
        assert!(!OrchestrationError::InvalidTransition {
            from: DocumentState::Completed,
            to: DocumentState::Uploaded,
        }
        .is_transient());
        assert!(!OrchestrationError::Cancelled {
            document_id: DocumentId::new("doc-1"),
        }
        .is_transient());
    }
}
