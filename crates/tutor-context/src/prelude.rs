//! Convenience re-exports for common `tutor-context` types.
//!
//! ```ignore
//! use tutor_context::prelude::*;
//! ```
//!
//! Covers what a chat service needs to run a session: the manager and its
//! config, message constructors, summary backends and event handlers.
//! Allocator, classifier and planner internals are imported from their
//! modules directly.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    CacheTier, ChatRequest, Message, MessageRole, NewMessage, OpenRouterClient, Segment,
    WireMessage,
};

// ── Session ─────────────────────────────────────────────────────────
pub use crate::config::{ContextConfig, Toggle};
pub use crate::context::manager::{
    CompactionReport, ContextManager, PreparedTurn, SummaryOutcome, TurnPhase, TurnReport,
};
pub use crate::error::ContextError;

// ── Summarization ───────────────────────────────────────────────────
pub use crate::api::OpenRouterSummaryBackend;
pub use crate::context::summarizer::{
    LightweightDigest, SummarizerConfig, SummaryBackend, SummaryFuture, SummaryMessage,
    SummaryRequest,
};

// ── Events ──────────────────────────────────────────────────────────
pub use crate::events::{
    CompositeEventHandler, ContextEvent, EventHandler, EventObserver, LoggingHandler, NoopHandler,
};

// ── Cost ────────────────────────────────────────────────────────────
pub use crate::api::{CostTracker, pricing_for_model};
