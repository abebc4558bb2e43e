//! Per-session façade: one [`prepare`](ContextManager::prepare) call per turn.
//!
//! A turn walks a fixed sequence of phases:
//!
//! ```text
//! Idle ─append─▶ (len <= max) ─────────────────────────────────▶ Planning ─▶ Ready ─▶ Idle
//!               (len >  max) ─▶ Classifying ─▶ Allocating ─┬──────▲
//!                                                          └▶ Summarizing (something dropped)
//! ```
//!
//! The emitted sequence is always `anchor, [summary], kept middle..., recent
//! window...`, preceded by the instructions block when one is set. The store
//! keeps the full history; compaction only decides what is emitted.
//!
//! Failure handling:
//!
//! - invalid input, classification or allocation errors abort the turn and
//!   leave the store as it was before the call;
//! - a failed summary call omits the summary for the turn and marks the
//!   newly dropped messages as lost (they are not retried);
//! - a planning inconsistency emits the full, uncompacted history with no
//!   breakpoints and clears the breakpoint memory. The turn still succeeds.

use crate::config::ContextConfig;
use crate::context::allocator::{self, Allocation};
use crate::context::classifier::{self, PositionContext};
use crate::context::planner::{self, CacheBreakpoint, PlannerConfig, PrefixHashes};
use crate::context::store::MessageStore;
use crate::context::summarizer::{Coverage, SummaryBackend, SummaryMessage, Summarizer};
use crate::context::usage::ContextUsage;
use crate::error::ContextError;
use crate::events::{ContextEvent, EventHandler, NoopHandler};
use crate::{ChatRequest, Message, NewMessage, UsageRequest, WireMessage};
use serde::Serialize;
use tracing::{debug, trace, warn};

/// Where the manager is within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Idle,
    Classifying,
    Allocating,
    Summarizing,
    Planning,
    Ready,
}

/// What happened to the summary on a compacting turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SummaryOutcome {
    /// Nothing was dropped.
    NotNeeded,
    /// No summary backend, or summarization is switched off.
    Disabled,
    /// HIGH messages fill the budget; no room for a summary.
    Withheld,
    /// A new summary replaced the previous one.
    Updated,
    /// Nothing new was dropped; the live summary was emitted as is.
    Reused,
    /// Every dropped message was lost to an earlier failed call.
    Unavailable,
    /// The summary call failed this turn.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub kept: usize,
    pub dropped: usize,
    pub summary: SummaryOutcome,
}

/// Summary of one `prepare` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReport {
    pub turn: u64,
    /// Messages in the store after the append.
    pub store_len: usize,
    /// Conversation messages emitted (instructions block excluded).
    pub emitted: usize,
    /// Present when compaction shaped the emitted sequence.
    pub compaction: Option<CompactionReport>,
    pub breakpoints: usize,
    /// Breakpoints identical to the previous turn's.
    pub reused_breakpoints: usize,
    /// Leading conversation messages byte-identical to the previous turn.
    pub shared_prefix: usize,
    /// Set when caching was turned off for this turn, with the reason.
    pub caching_disabled: Option<String>,
    pub usage: ContextUsage,
}

impl TurnReport {
    pub fn to_log_string(&self) -> String {
        let mut line = format!(
            "[turn {}] {} of {} messages emitted, {} breakpoint(s) ({} reused), shared prefix {}; {}",
            self.turn,
            self.emitted,
            self.store_len,
            self.breakpoints,
            self.reused_breakpoints,
            self.shared_prefix,
            self.usage.to_log_string(),
        );
        if let Some(ref reason) = self.caching_disabled {
            line.push_str(&format!("; caching disabled: {reason}"));
        }
        line
    }
}

/// The wire-ready output of a turn.
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    /// System-instructions block, marked as Tier 1 when caching is on.
    pub instructions: Option<WireMessage>,
    /// Conversation messages; index 0 is always the anchor.
    pub messages: Vec<WireMessage>,
    pub breakpoints: Vec<CacheBreakpoint>,
    /// Index into `messages` of the summary, if one was emitted.
    pub summary_position: Option<usize>,
    pub report: TurnReport,
}

impl PreparedTurn {
    pub fn has_summary(&self) -> bool {
        self.summary_position.is_some()
    }

    /// Full submission order: instructions block, then the conversation.
    pub fn wire(&self) -> Vec<WireMessage> {
        self.instructions
            .iter()
            .chain(self.messages.iter())
            .cloned()
            .collect()
    }

    /// Build a chat request that asks for usage accounting.
    pub fn to_request(&self, model: impl Into<String>, max_tokens: u32, temperature: f32) -> ChatRequest {
        ChatRequest {
            model: model.into(),
            messages: self.wire(),
            max_tokens,
            temperature,
            usage: Some(UsageRequest { include: true }),
        }
    }
}

/// Owns one conversation's state and shapes each turn for submission.
pub struct ContextManager {
    config: ContextConfig,
    instructions: Option<WireMessage>,
    store: MessageStore,
    /// The single live summary, emitted at position 1 when present.
    summary: Option<SummaryMessage>,
    /// Sequence indices whose summary call failed.
    lost: Coverage,
    breakpoints: Vec<CacheBreakpoint>,
    last_hashes: Option<PrefixHashes>,
    summarizer: Option<Summarizer>,
    handler: Box<dyn EventHandler>,
    phase: TurnPhase,
    turn: u64,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Result<Self, ContextError> {
        config.validate()?;
        Ok(Self {
            config,
            instructions: None,
            store: MessageStore::new(),
            summary: None,
            lost: Coverage::new(),
            breakpoints: Vec::new(),
            last_hashes: None,
            summarizer: None,
            handler: Box::new(NoopHandler),
            phase: TurnPhase::Idle,
            turn: 0,
        })
    }

    /// Static system instructions, submitted ahead of the anchor. Blank
    /// text means no instructions block.
    pub fn with_instructions(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.instructions = (!text.trim().is_empty()).then(|| WireMessage::system(text));
        self
    }

    pub fn with_summary_backend(mut self, backend: impl SummaryBackend + 'static) -> Self {
        self.summarizer = Some(Summarizer::new(backend, self.config.summary_word_cap));
        self
    }

    pub fn with_event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn summary(&self) -> Option<&SummaryMessage> {
        self.summary.as_ref()
    }

    /// Sequence indices that were dropped but never summarized.
    pub fn lost(&self) -> &Coverage {
        &self.lost
    }

    /// Breakpoints emitted on the last planned turn.
    pub fn breakpoints(&self) -> &[CacheBreakpoint] {
        &self.breakpoints
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    fn summarization_active(&self) -> bool {
        self.config.summarizer.enabled && self.summarizer.is_some()
    }

    fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            freshness_window: self.config.cache_freshness_window,
            mid_conversation_interval: self.config.mid_conversation_cache_interval,
        }
    }

    fn set_phase(&mut self, phase: TurnPhase) {
        trace!("[turn {}] phase {:?} -> {:?}", self.turn, self.phase, phase);
        self.phase = phase;
        self.handler.on_event(&ContextEvent::PhaseChanged {
            turn: self.turn,
            phase,
        });
    }

    /// Record a message without preparing a submission (typically the
    /// assistant's reply to the previous turn).
    pub fn record(&mut self, message: NewMessage) -> Result<u64, ContextError> {
        let index = self.store.append(message)?;
        debug!("Recorded message #{index} ({} in store)", self.store.len());
        Ok(index)
    }

    /// Append `message` and shape the conversation for submission.
    pub async fn prepare(&mut self, message: NewMessage) -> Result<PreparedTurn, ContextError> {
        self.store.append(message)?;
        self.turn += 1;
        self.handler.on_event(&ContextEvent::TurnStarted {
            turn: self.turn,
            store_len: self.store.len(),
        });

        let result = self.run_turn().await;
        if let Err(ref e) = result {
            warn!("[turn {}] aborted: {e}", self.turn);
            self.store.rollback_last();
            self.turn -= 1;
        }
        self.set_phase(TurnPhase::Idle);
        result
    }

    /// Clear all session state. Configuration, instructions, backend and
    /// handler are kept.
    pub fn reset(&mut self) {
        self.store.clear();
        self.summary = None;
        self.lost.clear();
        self.breakpoints.clear();
        self.last_hashes = None;
        self.turn = 0;
        self.phase = TurnPhase::Idle;
        self.handler.on_event(&ContextEvent::SessionReset);
    }

    fn full_history(&self) -> Vec<WireMessage> {
        self.store.all().iter().map(Message::to_wire).collect()
    }

    async fn run_turn(&mut self) -> Result<PreparedTurn, ContextError> {
        let len = self.store.len();
        let (mut messages, mut summary_position, mut compaction) =
            if len <= self.config.max_retained_messages {
                (self.full_history(), None, None)
            } else {
                self.compact(len).await?
            };

        self.set_phase(TurnPhase::Planning);
        let mut instructions = self.instructions.clone();
        let mut breakpoints = Vec::new();
        let mut reused_breakpoints = 0;
        let mut shared_prefix = 0;
        let mut caching_disabled = None;

        if self.config.caching_enabled {
            let planned = planner::plan(
                instructions.as_ref(),
                &messages,
                &self.breakpoints,
                &self.planner_config(),
            );
            match planned {
                Ok((bps, hashes)) => {
                    reused_breakpoints = planner::still_valid(&self.breakpoints, &bps).len();
                    shared_prefix = self
                        .last_hashes
                        .as_ref()
                        .map_or(0, |prev| hashes.shared_prefix_len(prev));
                    planner::annotate(instructions.as_mut(), &mut messages, &bps);
                    self.handler.on_event(&ContextEvent::BreakpointsPlanned {
                        breakpoints: &bps,
                        reused: reused_breakpoints,
                    });
                    self.breakpoints = bps.clone();
                    self.last_hashes = Some(hashes);
                    breakpoints = bps;
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.handler
                        .on_event(&ContextEvent::CachingDisabled { reason: &reason });
                    messages = self.full_history();
                    summary_position = None;
                    compaction = None;
                    self.breakpoints.clear();
                    self.last_hashes = None;
                    caching_disabled = Some(reason);
                }
            }
        } else {
            self.breakpoints.clear();
            self.last_hashes = None;
        }

        self.set_phase(TurnPhase::Ready);
        let mut wire: Vec<WireMessage> = instructions.iter().cloned().collect();
        wire.extend(messages.iter().cloned());
        let report = TurnReport {
            turn: self.turn,
            store_len: len,
            emitted: messages.len(),
            compaction,
            breakpoints: breakpoints.len(),
            reused_breakpoints,
            shared_prefix,
            caching_disabled,
            usage: ContextUsage::estimate(&wire),
        };
        self.handler.on_event(&ContextEvent::Ready { report: &report });

        Ok(PreparedTurn {
            instructions,
            messages,
            breakpoints,
            summary_position,
            report,
        })
    }

    /// Classify, allocate and (maybe) summarize. Returns the compacted
    /// sequence, the summary's position in it, and the report.
    async fn compact(
        &mut self,
        len: usize,
    ) -> Result<(Vec<WireMessage>, Option<usize>, Option<CompactionReport>), ContextError> {
        let region_start = 1;
        let region_end = len - self.config.recent_window_size;

        self.set_phase(TurnPhase::Classifying);
        let mut classes = Vec::with_capacity(region_end - region_start);
        for position in region_start..region_end {
            let message = self.store.get(position).ok_or_else(|| {
                ContextError::ClassificationError(format!("no message at position {position}"))
            })?;
            let c = classifier::classify(
                message,
                &PositionContext::new(position, region_start, region_end),
            )?;
            trace!(
                "#{} {} ({:?})",
                message.sequence_index, c.class, c.signal
            );
            classes.push(c.class);
        }

        self.set_phase(TurnPhase::Allocating);
        let runs = allocator::build_runs(region_start, &classes);
        let allocation = allocator::allocate_with_summary(
            &runs,
            self.config.middle_budget(),
            self.summarization_active(),
        )?;
        self.handler.on_event(&ContextEvent::Classified {
            turn: self.turn,
            high: allocation.high,
            medium: allocation.medium,
            low: allocation.low,
        });
        self.handler.on_event(&ContextEvent::Compacted {
            turn: self.turn,
            kept: allocation.kept.len(),
            dropped: allocation.dropped.len(),
            summary_slot: allocation.summary_slot,
        });

        let outcome = if allocation.dropped.is_empty() {
            SummaryOutcome::NotNeeded
        } else if !self.summarization_active() {
            SummaryOutcome::Disabled
        } else if !allocation.summary_slot {
            SummaryOutcome::Withheld
        } else {
            self.set_phase(TurnPhase::Summarizing);
            self.refresh_summary(&allocation).await
        };

        let include_summary = matches!(outcome, SummaryOutcome::Updated | SummaryOutcome::Reused);
        let mut messages = Vec::with_capacity(allocation.emitted() + 1 + len - region_end);
        let anchor = self
            .store
            .anchor()
            .ok_or_else(|| ContextError::ClassificationError("store has no anchor".into()))?;
        messages.push(anchor.to_wire());
        let summary_position = match (&self.summary, include_summary) {
            (Some(summary), true) => {
                messages.push(summary.to_wire());
                Some(1)
            }
            _ => None,
        };
        let all = self.store.all();
        messages.extend(allocation.kept.iter().map(|&p| all[p].to_wire()));
        messages.extend(all[region_end..].iter().map(Message::to_wire));

        let report = CompactionReport {
            high: allocation.high,
            medium: allocation.medium,
            low: allocation.low,
            kept: allocation.kept.len(),
            dropped: allocation.dropped.len(),
            summary: outcome,
        };
        Ok((messages, summary_position, Some(report)))
    }

    /// Summarize dropped messages not yet covered by the live summary.
    async fn refresh_summary(&mut self, allocation: &Allocation) -> SummaryOutcome {
        let newly: Vec<Message> = allocation
            .dropped
            .iter()
            .filter_map(|&p| self.store.get(p))
            .filter(|m| {
                let covered = self
                    .summary
                    .as_ref()
                    .is_some_and(|s| s.covers.contains(m.sequence_index));
                !covered && !self.lost.contains(m.sequence_index)
            })
            .cloned()
            .collect();

        if newly.is_empty() {
            return match &self.summary {
                Some(summary) => {
                    self.handler.on_event(&ContextEvent::SummaryReused {
                        covers: &summary.covers,
                    });
                    SummaryOutcome::Reused
                }
                None => SummaryOutcome::Unavailable,
            };
        }

        let Some(summarizer) = self.summarizer.as_ref() else {
            return SummaryOutcome::Disabled;
        };
        match summarizer.summarize(&newly, self.summary.as_ref()).await {
            Ok(summary) => {
                self.handler.on_event(&ContextEvent::SummaryUpdated {
                    covers: &summary.covers,
                    words: summary.word_count(),
                });
                self.summary = Some(summary);
                SummaryOutcome::Updated
            }
            Err(e) => {
                for m in &newly {
                    self.lost.insert(m.sequence_index);
                }
                self.handler.on_event(&ContextEvent::SummaryFailed {
                    error: &e,
                    lost: newly.len(),
                });
                SummaryOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}
