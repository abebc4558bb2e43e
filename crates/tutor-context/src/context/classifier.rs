//! Heuristic importance scoring for tutoring messages.
//!
//! [`classify`] maps one message to an [`ImportanceClass`] using fixed text
//! patterns and length thresholds. It makes no network calls and has no
//! side effects, so the allocator can re-run it every turn.
//!
//! Order of checks:
//!
//! 1. **HIGH patterns**: misconceptions ("I thought", "confused about"),
//!    breakthroughs ("oh I see", "now I understand"), error acknowledgment
//!    ("I was wrong"), conceptual questions ("what is the difference between",
//!    "why does"). A HIGH match is final.
//! 2. **LOW patterns**: acknowledgment or encouragement filler ("ok", "thanks",
//!    "great!"), only when the text is shorter than 20 characters.
//! 3. **Length**: more than 200 characters is HIGH (substantive work shown),
//!    anything else is MEDIUM.

use crate::Message;
use crate::error::ContextError;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// LOW patterns only apply below this many characters.
pub const LOW_MAX_CHARS: usize = 20;

/// Messages longer than this are HIGH even without a pattern match.
pub const SUBSTANTIVE_MIN_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportanceClass {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ImportanceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportanceClass::Low => write!(f, "LOW"),
            ImportanceClass::Medium => write!(f, "MEDIUM"),
            ImportanceClass::High => write!(f, "HIGH"),
        }
    }
}

/// Which pattern family a text matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Misconception,
    Breakthrough,
    ErrorAcknowledgment,
    ConceptualQuestion,
    Acknowledgment,
    Encouragement,
}

impl Signal {
    pub fn class(self) -> ImportanceClass {
        match self {
            Signal::Misconception
            | Signal::Breakthrough
            | Signal::ErrorAcknowledgment
            | Signal::ConceptualQuestion => ImportanceClass::High,
            Signal::Acknowledgment | Signal::Encouragement => ImportanceClass::Low,
        }
    }
}

const HIGH_PATTERNS: &[(&str, Signal)] = &[
    (r"\bi thought\b", Signal::Misconception),
    (r"\bisn't .+ the same as\b", Signal::Misconception),
    (r"\bwhy isn't\b", Signal::Misconception),
    (r"\bwhy doesn't\b", Signal::Misconception),
    (r"\bdon't understand why\b", Signal::Misconception),
    (r"\bconfused about\b", Signal::Misconception),
    (r"\boh i see\b", Signal::Breakthrough),
    (r"\bthat makes sense\b", Signal::Breakthrough),
    (r"\bnow i understand\b", Signal::Breakthrough),
    (r"\bso .+ is because\b", Signal::Breakthrough),
    (r"\bi made a mistake\b", Signal::ErrorAcknowledgment),
    (r"\bi was wrong\b", Signal::ErrorAcknowledgment),
    (r"\bthat's incorrect\b", Signal::ErrorAcknowledgment),
    (r"\bwhat is the difference between\b", Signal::ConceptualQuestion),
    (r"\bhow does .+ work\b", Signal::ConceptualQuestion),
    (r"\bwhy is .+ important\b", Signal::ConceptualQuestion),
    (r"\bwhy does\b", Signal::ConceptualQuestion),
    (r"\bwhen do we use\b", Signal::ConceptualQuestion),
];

const LOW_PATTERNS: &[(&str, Signal)] = &[
    (r"^(ok|okay|sure|thanks|thank you|got it)\.?$", Signal::Acknowledgment),
    (r"^(yes|no|yeah|yep|nope)\.?$", Signal::Acknowledgment),
    (r"^(great|good|excellent|perfect|nice)!?$", Signal::Encouragement),
    (r"^(keep going|continue|you're doing well)!?$", Signal::Encouragement),
    (r"^(that's right|correct)!?$", Signal::Encouragement),
];

fn compile(patterns: &[(&str, Signal)]) -> Vec<(Regex, Signal)> {
    patterns
        .iter()
        .map(|(p, s)| (Regex::new(p).expect("importance pattern is valid"), *s))
        .collect()
}

static HIGH: LazyLock<Vec<(Regex, Signal)>> = LazyLock::new(|| compile(HIGH_PATTERNS));
static LOW: LazyLock<Vec<(Regex, Signal)>> = LazyLock::new(|| compile(LOW_PATTERNS));

/// Lowercase, trim and fold typographic apostrophes so "isn’t" matches.
fn normalize(text: &str) -> String {
    text.trim().to_lowercase().replace(['\u{2019}', '\u{2018}'], "'")
}

/// First matching pattern family, HIGH families before LOW ones.
pub fn detect_signal(text: &str) -> Option<Signal> {
    let normalized = normalize(text);
    HIGH.iter()
        .chain(LOW.iter())
        .find(|(re, _)| re.is_match(&normalized))
        .map(|(_, signal)| *signal)
}

/// Where a message sits relative to the compactable region.
///
/// The anchor (position 0) and the recent window are fixed by position, not
/// content, and are never classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionContext {
    /// Store position of the message being classified.
    pub position: usize,
    /// First store position of the compactable region (inclusive).
    pub region_start: usize,
    /// End of the compactable region (exclusive); the recent window starts here.
    pub region_end: usize,
}

impl PositionContext {
    pub fn new(position: usize, region_start: usize, region_end: usize) -> Self {
        Self {
            position,
            region_start,
            region_end,
        }
    }

    fn validate(&self) -> Result<(), ContextError> {
        if self.region_start == 0 {
            return Err(ContextError::ClassificationError(
                "region includes the anchor".into(),
            ));
        }
        if self.position < self.region_start || self.position >= self.region_end {
            return Err(ContextError::ClassificationError(format!(
                "position {} outside compactable region {}..{}",
                self.position, self.region_start, self.region_end
            )));
        }
        Ok(())
    }
}

/// Classification result with the reason it was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub class: ImportanceClass,
    pub signal: Option<Signal>,
}

/// Score one message of the compactable region.
pub fn classify(
    message: &Message,
    position: &PositionContext,
) -> Result<Classification, ContextError> {
    position.validate()?;

    let text = message.text();
    let chars = text.trim().chars().count();

    match detect_signal(&text) {
        Some(signal) if signal.class() == ImportanceClass::High => {
            return Ok(Classification {
                class: ImportanceClass::High,
                signal: Some(signal),
            });
        }
        Some(signal) if chars < LOW_MAX_CHARS => {
            return Ok(Classification {
                class: ImportanceClass::Low,
                signal: Some(signal),
            });
        }
        _ => {}
    }

    let class = if chars > SUBSTANTIVE_MIN_CHARS {
        ImportanceClass::High
    } else {
        ImportanceClass::Medium
    };
    Ok(Classification {
        class,
        signal: None,
    })
}
