use crate::record::{DocumentId, DocumentPayload, TenantId};
use crate::state::DocumentState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;

/// One stage of the document-processing pipeline.
///
/// The pipeline is a closed, ordered set: steps always run in declaration
/// order and there is exactly one collaborator contract per variant. New
/// stages are added here, not through string-keyed dispatch.
///
/// # Examples
///
/// ```
/// use docflow::PipelineStep;
///
/// assert_eq!(
///     PipelineStep::TextExtraction.next(),
///     Some(PipelineStep::Chunking),
/// );
/// assert_eq!(PipelineStep::Summarization.next(), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    /// Extract raw text from the uploaded file.
    TextExtraction,
    /// Split extracted text into chunks.
    Chunking,
    /// Classify the document from its chunks.
    Classification,
    /// Embed chunks into the vector index.
    Vectorization,
    /// Produce a document summary.
    Summarization,
}

impl PipelineStep {
    /// All steps in pipeline order.
    pub const ALL: [PipelineStep; 5] = [
        PipelineStep::TextExtraction,
        PipelineStep::Chunking,
        PipelineStep::Classification,
        PipelineStep::Vectorization,
        PipelineStep::Summarization,
    ];

    /// Returns the snake_case name used in persistence and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::TextExtraction => "text_extraction",
            PipelineStep::Chunking => "chunking",
            PipelineStep::Classification => "classification",
            PipelineStep::Vectorization => "vectorization",
            PipelineStep::Summarization => "summarization",
        }
    }

    /// The state a document enters while this step is running.
    pub fn entering_state(&self) -> DocumentState {
        match self {
            PipelineStep::TextExtraction => DocumentState::TextExtracting,
            PipelineStep::Chunking => DocumentState::Chunking,
            PipelineStep::Classification => DocumentState::Classifying,
            PipelineStep::Vectorization => DocumentState::Vectorizing,
            PipelineStep::Summarization => DocumentState::Summarizing,
        }
    }

    /// The state a document reaches when this step succeeds.
    pub fn done_state(&self) -> DocumentState {
        match self {
            PipelineStep::TextExtraction => DocumentState::TextExtracted,
            PipelineStep::Chunking => DocumentState::Chunked,
            PipelineStep::Classification => DocumentState::Classified,
            PipelineStep::Vectorization => DocumentState::Vectorized,
            PipelineStep::Summarization => DocumentState::Summarized,
        }
    }

    /// The step to start from a resting (non-processing, non-terminal)
    /// state, if that state has a successor step.
    pub fn after_resting(state: DocumentState) -> Option<PipelineStep> {
        match state {
            DocumentState::Uploaded => Some(PipelineStep::TextExtraction),
            DocumentState::TextExtracted => Some(PipelineStep::Chunking),
            DocumentState::Chunked => Some(PipelineStep::Classification),
            DocumentState::Classified => Some(PipelineStep::Vectorization),
            DocumentState::Vectorized => Some(PipelineStep::Summarization),
            _ => None,
        }
    }

    /// The step that follows this one, or `None` for the last step.
    pub fn next(&self) -> Option<PipelineStep> {
        Self::after_resting(self.done_state())
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deterministic identifier for one step execution.
///
/// Derived from document id, step, and attempt number, so a crashed worker
/// that re-runs the same attempt presents the same key and the collaborator
/// can return its prior result instead of recomputing side effects.
///
/// # Examples
///
/// ```
/// use docflow::{DocumentId, IdempotencyKey, PipelineStep};
///
/// let doc = DocumentId::new("doc-123");
/// let key = IdempotencyKey::derive(&doc, PipelineStep::Chunking, 2);
/// assert_eq!(key.as_str(), "doc-123:chunking:2");
/// // The same inputs always produce the same key.
/// assert_eq!(key, IdempotencyKey::derive(&doc, PipelineStep::Chunking, 2));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derives the key for an attempt of a step on a document.
    pub fn derive(document_id: &DocumentId, step: PipelineStep, attempt_number: u32) -> Self {
        Self(format!("{document_id}:{step}:{attempt_number}"))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A stable seed for jitter derivation, folded from the key bytes.
    pub fn jitter_seed(&self) -> u64 {
        self.0
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
                (acc ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
            })
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of one step execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// The collaborator finished; `result_ref` points at its output
    /// (for example a chunk-set id or embedding-batch id).
    Succeeded {
        /// Opaque pointer to the collaborator's output.
        result_ref: Option<String>,
    },
    /// The collaborator failed in a way worth retrying.
    Retryable {
        /// Collaborator-reported reason.
        message: String,
    },
    /// The collaborator reported an unrecoverable input problem.
    Permanent {
        /// Collaborator-reported reason.
        message: String,
    },
    /// The call did not return within the configured step timeout.
    TimedOut,
}

impl StepOutcome {
    /// Whether the attempt ended in success.
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded { .. })
    }
}

/// Immutable record of one execution of a pipeline step.
///
/// Attempts are never mutated after creation; a retry produces a new record,
/// preserving the full audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    /// The step that was executed.
    pub step: PipelineStep,
    /// Idempotency key presented to the collaborator.
    pub idempotency_key: IdempotencyKey,
    /// 1-based attempt number, monotonic per (document, step).
    pub attempt_number: u32,
    /// When the attempt started.
    pub started_at: SystemTime,
    /// How the attempt ended.
    pub outcome: StepOutcome,
}

/// Input handed to a collaborator for one step invocation.
#[derive(Debug, Clone)]
pub struct StepRequest {
    /// Tenant the document belongs to.
    pub tenant_id: TenantId,
    /// Document being processed.
    pub document_id: DocumentId,
    /// Key the collaborator must deduplicate on.
    pub idempotency_key: IdempotencyKey,
    /// File reference and upload metadata.
    pub payload: DocumentPayload,
    /// `result_ref` of the most recent successful attempt, if any.
    pub prior_result_ref: Option<String>,
}

/// Successful collaborator output.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Opaque pointer to the produced artifact.
    pub result_ref: Option<String>,
}

/// Failure reported by a collaborator.
#[derive(Error, Debug, Clone)]
pub enum InvokeError {
    /// Transient failure; the step may be retried.
    #[error("retryable collaborator error: {0}")]
    Retryable(String),
    /// Unrecoverable input problem; retrying cannot help.
    #[error("permanent collaborator error: {0}")]
    Permanent(String),
}

/// Contract implemented by external pipeline collaborators.
///
/// One implementation per [`PipelineStep`], registered with the
/// [`ServiceRegistry`](crate::ServiceRegistry). Implementations must tolerate
/// duplicate calls with the same idempotency key by returning the prior
/// result rather than recomputing side effects, and must be safe for
/// concurrent use (handles are shared across workers of a tenant).
#[async_trait]
pub trait StepService: Send + Sync {
    /// Performs the step for one document.
    async fn invoke(&self, request: StepRequest) -> Result<StepOutput, InvokeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_order() {
        let mut walked = vec![PipelineStep::TextExtraction];
        while let Some(next) = walked[walked.len() - 1].next() {
            walked.push(next);
        }
        assert_eq!(walked, PipelineStep::ALL);
    }

    #[test]
    fn test_entering_and_done_states_round_trip() {
        for step in PipelineStep::ALL {
            assert_eq!(step.entering_state().step_in_progress(), Some(step));
            assert_eq!(PipelineStep::after_resting(step.done_state()), step.next());
        }
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let doc = DocumentId::new("doc-123");
        let a = IdempotencyKey::derive(&doc, PipelineStep::Vectorization, 1);
        let b = IdempotencyKey::derive(&doc, PipelineStep::Vectorization, 1);
        assert_eq!(a, b);
        assert_eq!(a.jitter_seed(), b.jitter_seed());

        let c = IdempotencyKey::derive(&doc, PipelineStep::Vectorization, 2);
        assert_ne!(a, c);
    }

    #[test]
    fn test_outcome_success_check() {
        assert!(StepOutcome::Succeeded { result_ref: None }.is_success());
        assert!(!StepOutcome::TimedOut.is_success());
        assert!(!StepOutcome::Retryable {
            message: "busy".into()
        }
        .is_success());
    }
}
