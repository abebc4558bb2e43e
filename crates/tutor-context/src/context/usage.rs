//! Rough token accounting for an emitted wire sequence.

use crate::WireMessage;
use serde::Serialize;

/// Characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Flat per-image estimate (low-detail image input).
pub const IMAGE_TOKEN_ESTIMATE: usize = 85;

/// Snapshot of how much context a turn will consume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ContextUsage {
    /// Estimated tokens for the whole submission.
    pub estimated_tokens: usize,
    /// Estimated tokens inside the cached prefix (up to the last breakpoint).
    pub cacheable_tokens: usize,
    /// Messages submitted, instructions block included.
    pub message_count: usize,
}

impl ContextUsage {
    /// Estimate usage over `messages`, instructions block first if present.
    pub fn estimate(messages: &[WireMessage]) -> Self {
        let per_message: Vec<usize> = messages.iter().map(estimate_tokens).collect();
        let estimated_tokens: usize = per_message.iter().sum();
        let cacheable_tokens = messages
            .iter()
            .rposition(|m| m.breakpoint.is_some())
            .map_or(0, |last| per_message.iter().take(last + 1).sum::<usize>());
        Self {
            estimated_tokens,
            cacheable_tokens,
            message_count: messages.len(),
        }
    }

    /// Fraction of the estimate that sits inside the cached prefix.
    pub fn cacheable_fraction(&self) -> f64 {
        if self.estimated_tokens == 0 {
            0.0
        } else {
            self.cacheable_tokens as f64 / self.estimated_tokens as f64
        }
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} tokens in {} messages ({:.0}% cacheable)",
            self.estimated_tokens,
            self.message_count,
            self.cacheable_fraction() * 100.0,
        )
    }
}

fn estimate_tokens(message: &WireMessage) -> usize {
    let images = message.content.len()
        - message
            .content
            .iter()
            .filter(|s| s.as_text().is_some())
            .count();
    (message.text_chars() as f64 / DEFAULT_CHARS_PER_TOKEN).ceil() as usize
        + images * IMAGE_TOKEN_ESTIMATE
}
