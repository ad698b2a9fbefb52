use crate::error::OrchestrationError;
use crate::step::PipelineStep;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Processing state of a single document.
///
/// Every pipeline step has an "in progress" state and a "done" state;
/// `Uploaded` is the initial state and `Completed`/`Failed` are terminal.
/// The allowed movements between states are defined by
/// [`DocumentStateMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    /// Document was uploaded and is waiting for processing to start.
    Uploaded,
    /// Text extraction is running.
    TextExtracting,
    /// Text extraction finished.
    TextExtracted,
    /// Chunking is running.
    Chunking,
    /// Chunking finished.
    Chunked,
    /// Classification is running.
    Classifying,
    /// Classification finished.
    Classified,
    /// Vectorization is running.
    Vectorizing,
    /// Vectorization finished.
    Vectorized,
    /// Summarization is running.
    Summarizing,
    /// Summarization finished.
    Summarized,
    /// All steps finished successfully. Terminal.
    Completed,
    /// Processing stopped with an error. Resumable via an explicit resume
    /// request targeting the failing step.
    Failed,
}

impl DocumentState {
    /// Returns the snake_case name used in persistence and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentState::Uploaded => "uploaded",
            DocumentState::TextExtracting => "text_extracting",
            DocumentState::TextExtracted => "text_extracted",
            DocumentState::Chunking => "chunking",
            DocumentState::Chunked => "chunked",
            DocumentState::Classifying => "classifying",
            DocumentState::Classified => "classified",
            DocumentState::Vectorizing => "vectorizing",
            DocumentState::Vectorized => "vectorized",
            DocumentState::Summarizing => "summarizing",
            DocumentState::Summarized => "summarized",
            DocumentState::Completed => "completed",
            DocumentState::Failed => "failed",
        }
    }

    /// The pipeline step running while the document is in this state, if any.
    pub fn step_in_progress(&self) -> Option<PipelineStep> {
        match self {
            DocumentState::TextExtracting => Some(PipelineStep::TextExtraction),
            DocumentState::Chunking => Some(PipelineStep::Chunking),
            DocumentState::Classifying => Some(PipelineStep::Classification),
            DocumentState::Vectorizing => Some(PipelineStep::Vectorization),
            DocumentState::Summarizing => Some(PipelineStep::Summarization),
            _ => None,
        }
    }

    /// Whether a pipeline step is actively running in this state.
    pub fn is_processing(&self) -> bool {
        self.step_in_progress().is_some()
    }

    /// Whether the state admits no further automatic transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentState::Completed | DocumentState::Failed)
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pure validator for document state transitions.
///
/// Holds no state and performs no I/O; both checks are plain table lookups.
/// The `Failed -> <in progress>` edges exist in the table but are only ever
/// driven by an explicit resume request, never automatically.
///
/// # Examples
///
/// ```
/// use docflow::{DocumentState, DocumentStateMachine};
///
/// assert!(DocumentStateMachine::can_transition(
///     DocumentState::Uploaded,
///     DocumentState::TextExtracting,
/// ));
/// assert!(!DocumentStateMachine::can_transition(
///     DocumentState::Uploaded,
///     DocumentState::Completed,
/// ));
/// ```
pub struct DocumentStateMachine;

impl DocumentStateMachine {
    /// Allowed target states from `from`.
    pub fn allowed_targets(from: DocumentState) -> &'static [DocumentState] {
        use DocumentState::*;
        match from {
            Uploaded => &[TextExtracting, Failed],
            TextExtracting => &[TextExtracted, Failed],
            TextExtracted => &[Chunking, Failed],
            Chunking => &[Chunked, Failed],
            Chunked => &[Classifying, Failed],
            Classifying => &[Classified, Failed],
            Classified => &[Vectorizing, Failed],
            Vectorizing => &[Vectorized, Failed],
            Vectorized => &[Summarizing, Failed],
            Summarizing => &[Summarized, Failed],
            Summarized => &[Completed],
            // Resume re-enters the in-progress state of the failing step.
            Failed => &[TextExtracting, Chunking, Classifying, Vectorizing, Summarizing],
            Completed => &[],
        }
    }

    /// Whether the transition `from -> to` appears in the table.
    pub fn can_transition(from: DocumentState, to: DocumentState) -> bool {
        Self::allowed_targets(from).contains(&to)
    }

    /// Validates a proposed transition.
    ///
    /// A transition already satisfied (`from == to`) is accepted as a no-op
    /// so that replay after a crash does not fail spuriously. Anything else
    /// outside the table is an [`OrchestrationError::InvalidTransition`].
    pub fn validate(from: DocumentState, to: DocumentState) -> Result<(), OrchestrationError> {
        if from == to || Self::can_transition(from, to) {
            Ok(())
        } else {
            Err(OrchestrationError::InvalidTransition { from, to })
        }
    }
}
