//! Cache breakpoint placement.
//!
//! A breakpoint tells the transport that everything up to and including the
//! marked message is a stable prefix worth caching. Placement is tiered:
//!
//! 1. **Instructions**: end of the static system-instructions block.
//! 2. **Anchor**: end of the first conversation message.
//! 3. **History**: the last assistant message before the freshness window,
//!    or the message just before the window when no assistant qualifies.
//!    Once placed, it stays put while its prefix is unchanged and it lags
//!    the window by fewer than `mid_conversation_cache_interval` messages.
//!
//! The last `cache_freshness_window` messages never get a breakpoint. The
//! anchor is never part of the freshness window.
//!
//! Every breakpoint carries a chained SHA-256 of the canonical bytes of the
//! prefix it closes, so the next turn can tell whether that prefix survived
//! byte for byte. [`plan`] is a pure function of its inputs.

use crate::context::summarizer::hex;
use crate::error::ContextError;
use crate::{CacheTier, MessageRole, WireMessage};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub type PrefixHash = [u8; 32];

/// Where a breakpoint sits in the emitted sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointPosition {
    /// The system-instructions block.
    Instructions,
    /// Index into the conversation messages (0 is the anchor).
    Message(usize),
}

impl std::fmt::Display for BreakpointPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakpointPosition::Instructions => write!(f, "instructions"),
            BreakpointPosition::Message(i) => write!(f, "message {i}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheBreakpoint {
    pub position: BreakpointPosition,
    pub tier: CacheTier,
    /// Chained hash of the prefix ending at `position`.
    #[serde(serialize_with = "serialize_hash")]
    pub prefix_hash: PrefixHash,
}

fn serialize_hash<S: serde::Serializer>(hash: &PrefixHash, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex(hash))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerConfig {
    pub freshness_window: usize,
    /// How far (in messages) a sticky history breakpoint may lag the
    /// freshness window before it advances. Not a minimum history length:
    /// short conversations still get a history breakpoint.
    pub mid_conversation_interval: usize,
}

/// Prefix hashes of a wire sequence, one per element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixHashes {
    pub instructions: Option<PrefixHash>,
    pub messages: Vec<PrefixHash>,
}

impl PrefixHashes {
    pub fn compute(
        instructions: Option<&WireMessage>,
        messages: &[WireMessage],
    ) -> Result<Self, ContextError> {
        let mut chain = [0u8; 32];
        let instructions = match instructions {
            Some(block) => {
                chain = link(&chain, block)?;
                Some(chain)
            }
            None => None,
        };
        let mut hashes = Vec::with_capacity(messages.len());
        for message in messages {
            chain = link(&chain, message)?;
            hashes.push(chain);
        }
        Ok(Self {
            instructions,
            messages: hashes,
        })
    }

    pub fn at(&self, position: BreakpointPosition) -> Option<&PrefixHash> {
        match position {
            BreakpointPosition::Instructions => self.instructions.as_ref(),
            BreakpointPosition::Message(i) => self.messages.get(i),
        }
    }

    /// Leading conversation messages whose prefix hash matches `previous`.
    pub fn shared_prefix_len(&self, previous: &PrefixHashes) -> usize {
        if self.instructions != previous.instructions {
            return 0;
        }
        self.messages
            .iter()
            .zip(previous.messages.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }
}

fn link(previous: &PrefixHash, message: &WireMessage) -> Result<PrefixHash, ContextError> {
    let bytes = message
        .canonical_bytes()
        .map_err(ContextError::PlanningInconsistency)?;
    let mut hasher = Sha256::new();
    hasher.update(previous);
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(&bytes);
    Ok(hasher.finalize().into())
}

/// First message index inside the freshness window. Never 0.
pub fn freshness_start(len: usize, window: usize) -> usize {
    len.saturating_sub(window).max(1)
}

fn check_previous(
    previous: &[CacheBreakpoint],
    hashes: &PrefixHashes,
) -> Result<(), ContextError> {
    for bp in previous {
        match (bp.tier, bp.position) {
            (CacheTier::Instructions, BreakpointPosition::Instructions) => {
                if hashes.instructions != Some(bp.prefix_hash) {
                    return Err(ContextError::PlanningInconsistency(
                        "instructions block changed under its breakpoint".into(),
                    ));
                }
            }
            (CacheTier::Anchor, BreakpointPosition::Message(0)) => {
                if hashes.messages.first() != Some(&bp.prefix_hash) {
                    return Err(ContextError::PlanningInconsistency(
                        "anchor message changed under its breakpoint".into(),
                    ));
                }
            }
            (CacheTier::History, BreakpointPosition::Message(p)) if p > 0 => {}
            (tier, position) => {
                return Err(ContextError::PlanningInconsistency(format!(
                    "{tier} breakpoint recorded at {position}"
                )));
            }
        }
    }
    Ok(())
}

/// Choose the history breakpoint, preferring the previous one while its
/// prefix is intact and it is no more than the interval behind.
fn history_position(
    messages: &[WireMessage],
    hashes: &PrefixHashes,
    previous: &[CacheBreakpoint],
    config: &PlannerConfig,
) -> Option<usize> {
    let start = freshness_start(messages.len(), config.freshness_window);
    if start <= 1 {
        return None;
    }

    let sticky = previous
        .iter()
        .filter(|bp| bp.tier == CacheTier::History)
        .find_map(|bp| match bp.position {
            BreakpointPosition::Message(p)
                if p >= 1
                    && p < start
                    && hashes.messages.get(p) == Some(&bp.prefix_hash)
                    && start - 1 - p < config.mid_conversation_interval =>
            {
                Some(p)
            }
            _ => None,
        });
    if sticky.is_some() {
        return sticky;
    }

    (1..start)
        .rev()
        .find(|&i| messages[i].role == MessageRole::Assistant)
        .or(Some(start - 1))
}

/// Place breakpoints on a wire sequence.
///
/// Fails with `PlanningInconsistency` when the sequence is empty or when a
/// previous Tier-1/Tier-2 breakpoint no longer matches its prefix.
pub fn plan(
    instructions: Option<&WireMessage>,
    messages: &[WireMessage],
    previous: &[CacheBreakpoint],
    config: &PlannerConfig,
) -> Result<(Vec<CacheBreakpoint>, PrefixHashes), ContextError> {
    if messages.is_empty() {
        return Err(ContextError::PlanningInconsistency(
            "wire sequence has no anchor message".into(),
        ));
    }
    let hashes = PrefixHashes::compute(instructions, messages)?;
    check_previous(previous, &hashes)?;

    let mut breakpoints = Vec::with_capacity(3);
    if let Some(hash) = hashes.instructions {
        breakpoints.push(CacheBreakpoint {
            position: BreakpointPosition::Instructions,
            tier: CacheTier::Instructions,
            prefix_hash: hash,
        });
    }
    breakpoints.push(CacheBreakpoint {
        position: BreakpointPosition::Message(0),
        tier: CacheTier::Anchor,
        prefix_hash: hashes.messages[0],
    });
    if let Some(p) = history_position(messages, &hashes, previous, config) {
        breakpoints.push(CacheBreakpoint {
            position: BreakpointPosition::Message(p),
            tier: CacheTier::History,
            prefix_hash: hashes.messages[p],
        });
    }
    Ok((breakpoints, hashes))
}

/// Previous breakpoints that reappear unchanged (same tier, position, hash).
pub fn still_valid<'a>(
    previous: &'a [CacheBreakpoint],
    current: &[CacheBreakpoint],
) -> Vec<&'a CacheBreakpoint> {
    previous.iter().filter(|bp| current.contains(bp)).collect()
}

/// Set the marker on each breakpoint's message.
pub fn annotate(
    instructions: Option<&mut WireMessage>,
    messages: &mut [WireMessage],
    breakpoints: &[CacheBreakpoint],
) {
    let mut instructions = instructions;
    for bp in breakpoints {
        match bp.position {
            BreakpointPosition::Instructions => {
                if let Some(block) = instructions.as_deref_mut() {
                    block.breakpoint = Some(bp.tier);
                }
            }
            BreakpointPosition::Message(i) => {
                if let Some(message) = messages.get_mut(i) {
                    message.breakpoint = Some(bp.tier);
                }
            }
        }
    }
}
