//! Incremental summarization of dropped messages.
//!
//! Keeps one running summary per session. Each compaction cycle sends the
//! previous summary plus only the newly dropped messages to a
//! [`SummaryBackend`] and gets back a complete replacement; the old summary is
//! superseded, never appended to.
//!
//! Two backends ship with the crate:
//!
//! - [`OpenRouterSummaryBackend`](crate::api::summary::OpenRouterSummaryBackend):
//!   a cheap chat model over the network, with retry.
//! - [`LightweightDigest`]: offline bullet points grouped by the classifier's
//!   signals. No network, deterministic.

use crate::context::classifier::{Signal, detect_signal};
use crate::error::ContextError;
use crate::{DEFAULT_SUMMARY_MODEL, Message, MessageRole, WireMessage};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::ops::RangeInclusive;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Prefix of the synthetic summary message on the wire.
pub const SUMMARY_HEADER: &str = "[CONVERSATION SUMMARY]";

/// The four fixed section headings, in order.
pub const SUMMARY_SECTIONS: [&str; 4] = [
    "MISCONCEPTIONS AND RESOLUTIONS",
    "TEACHING STRATEGIES OBSERVED",
    "PROGRESS ASSESSMENT",
    "OTHER CONTEXT",
];

fn summary_instructions(word_cap: usize) -> String {
    format!(
        "You are condensing part of a tutoring conversation between a STUDENT and a TUTOR so \
the session can continue with less context. Write a summary with exactly these four \
sections, each heading on its own line followed by short bullet points:

{}:
Misconceptions the student showed and whether each was resolved.
{}:
Explanations, hints and questioning techniques the tutor used, and how the student responded.
{}:
What the student can now do, and what remains unclear.
{}:
Anything else needed to continue: the problem being worked on, notation, preferences.

Rules:
- Use at most {word_cap} words.
- Only include facts stated in the messages. Do not infer.
- If an existing summary is given, merge the new messages into it and return a single \
complete summary that replaces it. Do not append.
- Provide ONLY the summary, no preamble.",
        SUMMARY_SECTIONS[0], SUMMARY_SECTIONS[1], SUMMARY_SECTIONS[2], SUMMARY_SECTIONS[3],
    )
}

/// Settings for the network summarization backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// Model used for summary calls.
    pub model: String,
    /// Maximum tokens for the summary response.
    pub max_summary_tokens: u32,
    pub temperature: f32,
    /// Retries for transient transport errors.
    pub max_retries: u32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_SUMMARY_MODEL.to_string(),
            max_summary_tokens: 1024,
            temperature: 0.3,
            max_retries: 2,
        }
    }
}

// ── Coverage ───────────────────────────────────────────────────────

/// A set of sequence indices stored as sorted, disjoint, non-adjacent
/// inclusive ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Coverage {
    ranges: Vec<RangeInclusive<u64>>,
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_indices(indices: impl IntoIterator<Item = u64>) -> Self {
        let mut coverage = Self::new();
        for index in indices {
            coverage.insert(index);
        }
        coverage
    }

    pub fn insert(&mut self, index: u64) {
        self.insert_range(index..=index);
    }

    pub fn insert_range(&mut self, range: RangeInclusive<u64>) {
        let (mut lo, mut hi) = range.into_inner();
        if lo > hi {
            return;
        }
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            let (a, b) = (*r.start(), *r.end());
            // Overlapping or adjacent ranges fold into the new one.
            if b.saturating_add(1) >= lo && a <= hi.saturating_add(1) {
                lo = lo.min(a);
                hi = hi.max(b);
            } else {
                merged.push(r);
            }
        }
        let at = merged.partition_point(|r| *r.start() < lo);
        merged.insert(at, lo..=hi);
        self.ranges = merged;
    }

    pub fn union(&self, other: &Coverage) -> Coverage {
        let mut out = self.clone();
        for r in &other.ranges {
            out.insert_range(r.clone());
        }
        out
    }

    pub fn contains(&self, index: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(&index))
    }

    pub fn ranges(&self) -> &[RangeInclusive<u64>] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of indices covered.
    pub fn count(&self) -> u64 {
        self.ranges.iter().map(|r| r.end() - r.start() + 1).sum()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

impl std::fmt::Display for Coverage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|r| {
                if r.start() == r.end() {
                    r.start().to_string()
                } else {
                    format!("{}-{}", r.start(), r.end())
                }
            })
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

// ── Summary message ────────────────────────────────────────────────

/// The single live summary of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryMessage {
    /// Summary body, without the header.
    pub text: String,
    /// Sequence indices of every message this summary stands in for.
    pub covers: Coverage,
    /// SHA-256 over the inputs that produced this text.
    pub source_text_hash: [u8; 32],
}

impl SummaryMessage {
    /// Always `true`; lets wire consumers tell synthetic messages apart.
    pub fn is_summary(&self) -> bool {
        true
    }

    /// Wire form: a system message starting with [`SUMMARY_HEADER`].
    pub fn to_wire(&self) -> WireMessage {
        WireMessage::system(format!("{SUMMARY_HEADER}\n{}", self.text))
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    pub fn source_hash_hex(&self) -> String {
        hex(&self.source_text_hash)
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ── Backend seam ───────────────────────────────────────────────────

/// Boxed future returned by [`SummaryBackend::summarize`].
pub type SummaryFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

/// Input for one summary call.
#[derive(Debug, Clone, Copy)]
pub struct SummaryRequest<'a> {
    pub prior_summary: Option<&'a str>,
    pub messages: &'a [Message],
    pub word_cap: usize,
}

impl SummaryRequest<'_> {
    /// Fixed instruction template.
    pub fn system_prompt(&self) -> String {
        summary_instructions(self.word_cap)
    }

    /// Prior summary (if any) followed by the new messages as a transcript.
    pub fn user_prompt(&self) -> String {
        let mut content = String::new();
        if let Some(existing) = self.prior_summary {
            content.push_str("=== EXISTING SUMMARY ===\n");
            content.push_str(existing);
            content.push_str("\n\n=== NEW MESSAGES TO SUMMARIZE ===\n");
        }
        let transcript: Vec<String> = self
            .messages
            .iter()
            .map(|m| format!("{}: {}", speaker(m.role), render_text(m)))
            .collect();
        content.push_str(&transcript.join("\n\n"));
        content
    }
}

fn speaker(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "STUDENT",
        MessageRole::Assistant => "TUTOR",
        MessageRole::System => "SYSTEM",
    }
}

fn render_text(message: &Message) -> String {
    let text = message.text();
    match (text.trim().is_empty(), message.image_count()) {
        (_, 0) => text,
        (true, n) => format!("[{n} image(s)]"),
        (false, n) => format!("{text} [{n} image(s)]"),
    }
}

/// The summarization collaborator: turns a request into plain summary text.
///
/// Implementations own their transport and any retry policy. They must not
/// touch session state.
pub trait SummaryBackend: Send + Sync {
    fn summarize<'a>(&'a self, request: SummaryRequest<'a>) -> SummaryFuture<'a>;
}

impl<T: SummaryBackend + ?Sized> SummaryBackend for Arc<T> {
    fn summarize<'a>(&'a self, request: SummaryRequest<'a>) -> SummaryFuture<'a> {
        (**self).summarize(request)
    }
}

// ── Summarizer ─────────────────────────────────────────────────────

/// Drives one backend call per compaction cycle and validates the reply.
pub struct Summarizer {
    backend: Box<dyn SummaryBackend>,
    word_cap: usize,
}

impl Summarizer {
    pub fn new(backend: impl SummaryBackend + 'static, word_cap: usize) -> Self {
        Self {
            backend: Box::new(backend),
            word_cap,
        }
    }

    pub fn word_cap(&self) -> usize {
        self.word_cap
    }

    /// Summarize `dropped` on top of `previous`, returning the replacement.
    pub async fn summarize(
        &self,
        dropped: &[Message],
        previous: Option<&SummaryMessage>,
    ) -> Result<SummaryMessage, ContextError> {
        if dropped.is_empty() {
            return Err(ContextError::SummarizationFailure(
                "nothing to summarize".into(),
            ));
        }
        let request = SummaryRequest {
            prior_summary: previous.map(|s| s.text.as_str()),
            messages: dropped,
            word_cap: self.word_cap,
        };
        let user_prompt = request.user_prompt();

        let reply = self
            .backend
            .summarize(request)
            .await
            .map_err(ContextError::SummarizationFailure)?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(ContextError::SummarizationFailure(
                "backend returned an empty summary".into(),
            ));
        }
        let text = truncate_words(reply, self.word_cap);

        let mut covers = Coverage::from_indices(dropped.iter().map(|m| m.sequence_index));
        if let Some(prev) = previous {
            covers = covers.union(&prev.covers);
        }

        let source_text_hash: [u8; 32] = Sha256::digest(user_prompt.as_bytes()).into();
        debug!(
            "Summary produced: {} words covering {} message(s) {}",
            text.split_whitespace().count(),
            covers.count(),
            covers
        );
        Ok(SummaryMessage {
            text,
            covers,
            source_text_hash,
        })
    }
}

/// Keep at most `cap` words, preserving the original spacing and line breaks
/// up to the cut.
pub fn truncate_words(text: &str, cap: usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut words = 0;
    let mut in_word = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            in_word = false;
        } else if !in_word {
            in_word = true;
            words += 1;
            if words > cap {
                break;
            }
        }
        out.push(ch);
    }
    out.truncate(out.trim_end().len());
    out
}

// ── Lightweight digest ─────────────────────────────────────────────

/// Longest bullet text before it is cut with "...".
const DIGEST_POINT_CHARS: usize = 100;

/// Maximum bullets per section.
const DIGEST_MAX_POINTS: usize = 10;

const DIGEST_OMITTED: &str = "- [... additional exchanges omitted ...]";
const DIGEST_NONE: &str = "- none recorded";

const MISCONCEPTIONS: usize = 0;
const STRATEGIES: usize = 1;
const PROGRESS: usize = 2;
const OTHER: usize = 3;

/// Tutor phrasings that push back on the previous student turn.
const CORRECTION_PATTERNS: &[&str] = &[
    r"^not quite\b",
    r"^almost\b",
    r"^close,? but\b",
    r"^careful\b",
    r"^actually\b",
    r"\bcheck (that|this|the|your) ",
    r"\btry again\b",
    r"\bnot correct\b",
];

static CORRECTION: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    CORRECTION_PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("correction pattern is valid"))
        .collect()
});

fn is_correction(message: &Message) -> bool {
    if message.role != MessageRole::Assistant {
        return false;
    }
    let text = message.text().trim().to_lowercase();
    CORRECTION.iter().any(|re| re.is_match(&text))
}

/// One bullet and the sequence index of the message it came from.
#[derive(Debug, Clone)]
struct DigestPoint {
    index: u64,
    line: String,
}

#[derive(Debug, Default)]
struct DigestSections {
    points: [Vec<DigestPoint>; 4],
    omitted: [bool; 4],
}

impl DigestSections {
    /// Bullets of a previously rendered digest, by section. Bullets without
    /// a readable index sort as oldest.
    fn parse(prior: &str) -> Self {
        let mut sections = Self::default();
        let mut current = None;
        for line in prior.lines() {
            let line = line.trim();
            if let Some(idx) = SUMMARY_SECTIONS
                .iter()
                .position(|h| line.strip_suffix(':') == Some(*h))
            {
                current = Some(idx);
            } else if let Some(idx) = current {
                if line == DIGEST_OMITTED {
                    sections.omitted[idx] = true;
                } else if line.starts_with("- ") && line != DIGEST_NONE {
                    let index = line
                        .split_once("(#")
                        .and_then(|(_, rest)| rest.split_once(')'))
                        .and_then(|(n, _)| n.parse().ok())
                        .unwrap_or(0);
                    sections.points[idx].push(DigestPoint {
                        index,
                        line: line.to_string(),
                    });
                }
            }
        }
        sections
    }

    fn cap_sections(&mut self, max: usize) {
        for (points, omitted) in self.points.iter_mut().zip(self.omitted.iter_mut()) {
            points.sort_by_key(|p| p.index);
            if points.len() > max {
                let excess = points.len() - max;
                points.drain(..excess);
                *omitted = true;
            }
        }
    }

    /// Drop the oldest bullet across all sections. The newest bullet is
    /// never dropped. Returns `false` when nothing can go.
    fn evict_oldest(&mut self) -> bool {
        if self.points.iter().map(Vec::len).sum::<usize>() <= 1 {
            return false;
        }
        let oldest = self
            .points
            .iter()
            .enumerate()
            .flat_map(|(s, points)| points.iter().enumerate().map(move |(i, p)| (p.index, s, i)))
            .min();
        match oldest {
            Some((_, section, i)) => {
                self.points[section].remove(i);
                self.omitted[section] = true;
                true
            }
            None => false,
        }
    }

    fn lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (s, heading) in SUMMARY_SECTIONS.iter().enumerate() {
            out.push(format!("{heading}:"));
            if self.omitted[s] {
                out.push(DIGEST_OMITTED.to_string());
            } else if self.points[s].is_empty() {
                out.push(DIGEST_NONE.to_string());
            }
            out.extend(self.points[s].iter().map(|p| p.line.clone()));
        }
        out
    }

    fn word_count(&self) -> usize {
        self.lines().iter().map(|l| l.split_whitespace().count()).sum()
    }
}

/// Offline summary backend.
///
/// Each dropped message becomes one bullet tagged with its sequence index:
///
/// - tutor corrections ("not quite", "check your sign") and the student turn
///   right after one go to misconceptions and resolutions;
/// - acknowledgments and encouragement go to progress;
/// - remaining tutor turns go to teaching strategies, the rest to other
///   context.
///
/// Bullets of the prior digest are carried over. Each section keeps its
/// newest [`DIGEST_MAX_POINTS`] bullets, then the oldest bullets overall are
/// evicted until the word cap is met, so the newest material always
/// survives.
#[derive(Debug, Clone, Copy, Default)]
pub struct LightweightDigest;

impl LightweightDigest {
    fn section_for(message: &Message, previous: Option<&Message>) -> usize {
        let follows_correction = previous.is_some_and(|p| {
            p.sequence_index + 1 == message.sequence_index && is_correction(p)
        });
        match (message.role, detect_signal(&message.text())) {
            (_, Some(Signal::Misconception | Signal::ErrorAcknowledgment)) => MISCONCEPTIONS,
            (
                _,
                Some(Signal::Breakthrough | Signal::Acknowledgment | Signal::Encouragement),
            ) => PROGRESS,
            _ if is_correction(message) => MISCONCEPTIONS,
            (MessageRole::User, _) if follows_correction => MISCONCEPTIONS,
            (MessageRole::Assistant, _) => STRATEGIES,
            _ => OTHER,
        }
    }

    fn point(message: &Message) -> DigestPoint {
        let label = match message.role {
            MessageRole::User => "Student",
            MessageRole::Assistant => "Tutor",
            MessageRole::System => "System",
        };
        let flat = render_text(message).split_whitespace().collect::<Vec<_>>().join(" ");
        let text = if flat.chars().count() > DIGEST_POINT_CHARS {
            let cut: String = flat.chars().take(DIGEST_POINT_CHARS - 3).collect();
            format!("{cut}...")
        } else {
            flat
        };
        DigestPoint {
            index: message.sequence_index,
            line: format!("- {label} (#{}): {text}", message.sequence_index),
        }
    }

    /// Merge `messages` into `prior` and render within `word_cap` words.
    pub fn render(prior: Option<&str>, messages: &[Message], word_cap: usize) -> String {
        let mut sections = prior.map(DigestSections::parse).unwrap_or_default();
        let mut previous = None;
        for message in messages {
            let section = Self::section_for(message, previous);
            sections.points[section].push(Self::point(message));
            previous = Some(message);
        }
        sections.cap_sections(DIGEST_MAX_POINTS);
        while sections.word_count() > word_cap && sections.evict_oldest() {}
        sections.lines().join("\n")
    }
}

impl SummaryBackend for LightweightDigest {
    fn summarize<'a>(&'a self, request: SummaryRequest<'a>) -> SummaryFuture<'a> {
        Box::pin(async move {
            Ok(Self::render(
                request.prior_summary,
                request.messages,
                request.word_cap,
            ))
        })
    }
}
