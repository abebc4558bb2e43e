//! Per-turn events and handlers for the [`ContextManager`](crate::context::manager::ContextManager).
//!
//! The manager reports every decision it makes through [`ContextEvent`]
//! variants: classification counts, what was dropped, whether the summary
//! was refreshed, reused or lost, and which breakpoints were placed.
//! Soft failures (a summary call that failed, caching disabled for a turn)
//! only surface here and in the turn report; they never fail `prepare`.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests, or callers that only read the turn report |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`EventObserver`] | Quick closures (metrics counters, test probes) |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use crate::context::manager::{TurnPhase, TurnReport};
use crate::context::planner::CacheBreakpoint;
use crate::context::summarizer::Coverage;
use crate::error::ContextError;
use tracing::{debug, info, trace, warn};

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ContextEvent<'a> {
    /// A turn began; the new message is already in the store.
    TurnStarted { turn: u64, store_len: usize },
    /// The turn moved to a new phase.
    PhaseChanged { turn: u64, phase: TurnPhase },
    /// The compactable region was classified.
    Classified {
        turn: u64,
        high: usize,
        medium: usize,
        low: usize,
    },
    /// The allocator chose what survives.
    Compacted {
        turn: u64,
        kept: usize,
        dropped: usize,
        summary_slot: bool,
    },
    /// A new summary superseded the previous one.
    SummaryUpdated { covers: &'a Coverage, words: usize },
    /// Nothing new was dropped; the live summary was emitted unchanged.
    SummaryReused { covers: &'a Coverage },
    /// The summary call failed. `lost` messages will not be summarized.
    SummaryFailed { error: &'a ContextError, lost: usize },
    /// Breakpoints for this turn. `reused` of them carry over unchanged.
    BreakpointsPlanned {
        breakpoints: &'a [CacheBreakpoint],
        reused: usize,
    },
    /// Caching was turned off for this turn.
    CachingDisabled { reason: &'a str },
    /// The wire sequence is ready.
    Ready { report: &'a TurnReport },
    /// All session state was cleared.
    SessionReset,
}

// ── Handlers ───────────────────────────────────────────────────────

/// Observer for [`ContextEvent`]s. The default implementation ignores
/// everything.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &ContextEvent<'_>) {
        let _ = event;
    }
}

pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// Logs every event through `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &ContextEvent<'_>) {
        match event {
            ContextEvent::TurnStarted { turn, store_len } => {
                debug!("[turn {turn}] {store_len} message(s) in store");
            }
            ContextEvent::PhaseChanged { turn, phase } => {
                trace!("[turn {turn}] phase: {phase:?}");
            }
            ContextEvent::Classified {
                turn,
                high,
                medium,
                low,
            } => {
                debug!("[turn {turn}] classified: high={high}, medium={medium}, low={low}");
            }
            ContextEvent::Compacted {
                turn,
                kept,
                dropped,
                summary_slot,
            } => {
                info!(
                    "[turn {turn}] compacted: kept {kept}, dropped {dropped}{}",
                    if *summary_slot { " (+ summary slot)" } else { "" }
                );
            }
            ContextEvent::SummaryUpdated { covers, words } => {
                info!("Summary updated: {words} words covering {covers}");
            }
            ContextEvent::SummaryReused { covers } => {
                debug!("Summary reused, covering {covers}");
            }
            ContextEvent::SummaryFailed { error, lost } => {
                warn!("{error}. Continuing without a summary; {lost} message(s) not summarized.");
            }
            ContextEvent::BreakpointsPlanned {
                breakpoints,
                reused,
            } => {
                let placed: Vec<String> = breakpoints
                    .iter()
                    .map(|b| format!("{} at {}", b.tier, b.position))
                    .collect();
                debug!(
                    "Breakpoints: {} ({reused} reused from previous turn)",
                    placed.join(", ")
                );
            }
            ContextEvent::CachingDisabled { reason } => {
                warn!("Caching disabled for this turn: {reason}");
            }
            ContextEvent::Ready { report } => {
                info!("{}", report.to_log_string());
            }
            ContextEvent::SessionReset => {
                info!("Session reset");
            }
        }
    }
}

/// An event handler backed by a closure.
///
/// ```ignore
/// let failures = Arc::new(AtomicUsize::new(0));
/// let f = failures.clone();
/// let handler = EventObserver::new(move |event| {
///     if let ContextEvent::SummaryFailed { .. } = event {
///         f.fetch_add(1, Ordering::Relaxed);
///     }
/// });
/// ```
pub struct EventObserver<F>(F)
where
    F: Fn(&ContextEvent<'_>) + Send + Sync;

impl<F> EventObserver<F>
where
    F: Fn(&ContextEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for EventObserver<F>
where
    F: Fn(&ContextEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &ContextEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches each event to every inner handler, in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(collect_metrics, MetricsHandler::default());
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler to the chain.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler to the chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    /// Add a handler from an `Option`. `None` is a no-op.
    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &ContextEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}
