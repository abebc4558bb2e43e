//! Errors surfaced by the context engine.
//!
//! Only store, classification and configuration errors ever reach the caller
//! of [`prepare`](crate::context::manager::ContextManager::prepare).
//! `SummarizationFailure` is absorbed by the manager and reported as an
//! event; `PlanningInconsistency` disables caching for the turn.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// A message was submitted without a role.
    #[error("invalid role: {0}")]
    InvalidRole(String),

    /// A message is malformed (empty content, empty image reference).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Classification or allocation was asked to work on positions outside
    /// the compactable region.
    #[error("classification error: {0}")]
    ClassificationError(String),

    /// The summarization collaborator failed or returned nothing usable.
    #[error("summarization failed: {0}")]
    SummarizationFailure(String),

    /// Breakpoint planning detected a prefix that changed underneath a
    /// breakpoint that must never move.
    #[error("planning inconsistency: {0}")]
    PlanningInconsistency(String),

    /// Session configuration is out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl ContextError {
    /// Whether the turn can proceed past this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ContextError::SummarizationFailure(_) | ContextError::PlanningInconsistency(_)
        )
    }
}
