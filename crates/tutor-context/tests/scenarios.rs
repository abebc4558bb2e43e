//! End-to-end session tests for the context manager.
//!
//! Each test replays a short tutoring conversation through a
//! [`ContextManager`] with an in-process summary backend and checks the
//! emitted wire sequence, the breakpoints and the turn report.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tutor_context::context::allocator::{allocate, build_runs};
use tutor_context::context::manager::SummaryOutcome;
use tutor_context::context::summarizer::{SUMMARY_HEADER, SUMMARY_SECTIONS};
use tutor_context::prelude::*;

// ── Helpers ──────────────────────────────────────────────────────────

/// Backend that numbers its replies and records the prior summary it saw.
#[derive(Default)]
struct RecordingBackend {
    calls: AtomicUsize,
    priors: Mutex<Vec<Option<String>>>,
    /// Call number (1-based) that fails, if any.
    fail_on: Option<usize>,
}

impl RecordingBackend {
    fn failing_on(call: usize) -> Self {
        Self {
            fail_on: Some(call),
            ..Default::default()
        }
    }
}

impl SummaryBackend for RecordingBackend {
    fn summarize<'a>(&'a self, request: SummaryRequest<'a>) -> SummaryFuture<'a> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.priors
                .lock()
                .unwrap()
                .push(request.prior_summary.map(str::to_string));
            if self.fail_on == Some(n) {
                return Err("OpenRouter API HTTP 503: overloaded".to_string());
            }
            Ok(format!("summary {n}"))
        })
    }
}

struct AlwaysFails;

impl SummaryBackend for AlwaysFails {
    fn summarize<'a>(&'a self, _request: SummaryRequest<'a>) -> SummaryFuture<'a> {
        Box::pin(async { Err("connection refused".to_string()) })
    }
}

fn small_config() -> ContextConfig {
    ContextConfig::default()
        .with_max_retained_messages(8)
        .with_recent_window_size(4)
        .with_freshness_window(3)
}

const ANCHOR: &str = "Can you help me factor x^2 + 5x + 6 for homework?";

/// A mid-length working message with no importance signal.
fn medium(i: usize) -> String {
    format!("Step {i}: multiply both sides by three and simplify the terms.")
}

fn texts(turn: &PreparedTurn) -> Vec<String> {
    turn.messages
        .iter()
        .map(|m| {
            m.content
                .iter()
                .filter_map(Segment::as_text)
                .collect::<Vec<_>>()
                .join("")
        })
        .collect()
}

fn summary_in_wire(turn: &PreparedTurn) -> bool {
    texts(turn).iter().any(|t| t.starts_with(SUMMARY_HEADER))
}

/// Bullet lines under `heading` in a rendered summary.
fn section_lines<'t>(summary: &'t str, heading: &str) -> Vec<&'t str> {
    summary
        .lines()
        .skip_while(|l| l.strip_suffix(':') != Some(heading))
        .skip(1)
        .take_while(|l| l.starts_with("- "))
        .collect()
}

/// Record `anchor` then `middle.len()` more messages, then prepare `last`.
async fn replay(manager: &mut ContextManager, middle: &[String], last: &str) -> PreparedTurn {
    manager.record(NewMessage::user(ANCHOR)).unwrap();
    for (i, text) in middle.iter().enumerate() {
        let message = if i % 2 == 0 {
            NewMessage::assistant(text.clone())
        } else {
            NewMessage::user(text.clone())
        };
        manager.record(message).unwrap();
    }
    manager.prepare(NewMessage::user(last)).await.unwrap()
}

// ── Compaction ───────────────────────────────────────────────────────

#[tokio::test]
async fn long_medium_conversation_is_bounded() {
    let mut manager = ContextManager::new(ContextConfig::default()).unwrap();
    let middle: Vec<String> = (1..30).map(medium).collect();
    let turn = replay(&mut manager, &middle, "What do I do next?").await;

    assert_eq!(manager.store().len(), 31);
    assert_eq!(turn.messages.len(), 21);
    assert_eq!(texts(&turn)[0], ANCHOR);

    let report = turn.report.compaction.as_ref().unwrap();
    assert_eq!(report.medium, 20);
    assert_eq!(report.kept, 10);
    assert_eq!(report.dropped, 10);
    assert_eq!(report.summary, SummaryOutcome::Disabled);

    // Earliest MEDIUM messages fill the budget, then the recent window.
    let emitted = texts(&turn);
    assert_eq!(emitted[1], medium(1));
    assert_eq!(emitted[10], medium(10));
    assert_eq!(emitted[11], medium(21));
    assert_eq!(emitted[20], "What do I do next?");
}

#[tokio::test]
async fn long_conversation_with_summary_keeps_same_bound() {
    let mut manager = ContextManager::new(ContextConfig::default())
        .unwrap()
        .with_summary_backend(LightweightDigest);
    let middle: Vec<String> = (1..30).map(medium).collect();
    let turn = replay(&mut manager, &middle, "What do I do next?").await;

    assert_eq!(turn.messages.len(), 21);
    assert_eq!(turn.summary_position, Some(1));
    assert!(texts(&turn)[1].starts_with(SUMMARY_HEADER));

    let report = turn.report.compaction.as_ref().unwrap();
    assert_eq!(report.kept, 9);
    assert_eq!(report.summary, SummaryOutcome::Updated);
    assert_eq!(manager.summary().unwrap().covers.count(), 11);
}

#[tokio::test]
async fn misconception_survives_compaction() {
    let mut manager = ContextManager::new(ContextConfig::default()).unwrap();
    let mut middle: Vec<String> = (1..30).map(medium).collect();
    // Position 20: the last message of the compactable region.
    middle[19] = "I thought x^0 was 0".to_string();
    let turn = replay(&mut manager, &middle, "Is that right?").await;

    let emitted = texts(&turn);
    assert!(emitted.iter().any(|t| t == "I thought x^0 was 0"));
    assert_eq!(turn.messages.len(), 21);

    let report = turn.report.compaction.as_ref().unwrap();
    assert_eq!(report.high, 1);
    assert_eq!(report.kept, 10);
    // One HIGH leaves nine MEDIUM slots.
    assert!(emitted.contains(&medium(9)));
    assert!(!emitted.contains(&medium(10)));
}

#[tokio::test]
async fn acknowledgments_are_dropped_even_with_room() {
    let mut manager = ContextManager::new(small_config()).unwrap();
    let middle = vec![
        "ok".to_string(),
        "thanks".to_string(),
        medium(3),
        medium(4),
        medium(5),
        medium(6),
        medium(7),
    ];
    let turn = replay(&mut manager, &middle, "Now what?").await;

    assert_eq!(manager.store().len(), 9);
    let emitted = texts(&turn);
    assert!(!emitted.iter().any(|t| t == "ok" || t == "thanks"));
    assert_eq!(turn.messages.len(), 7);

    let report = turn.report.compaction.as_ref().unwrap();
    assert_eq!(report.low, 2);
    assert_eq!(report.dropped, 2);
}

#[test]
fn kept_set_grows_with_budget() {
    use tutor_context::context::ImportanceClass::{High, Low, Medium};
    let classes = [
        Medium, Low, High, Medium, Medium, Low, High, Medium, Medium, Medium, Low, Medium,
    ];
    let runs = build_runs(1, &classes);

    let mut previous = allocate(&runs, 0).unwrap().kept;
    for budget in 1..=classes.len() {
        let kept = allocate(&runs, budget).unwrap().kept;
        assert!(
            previous.iter().all(|p| kept.contains(p)),
            "budget {budget} lost a message kept at budget {}",
            budget - 1
        );
        previous = kept;
    }
}

#[tokio::test]
async fn summary_is_withheld_when_high_fills_the_budget() {
    let backend = Arc::new(RecordingBackend::default());
    let mut manager = ContextManager::new(ContextConfig::default())
        .unwrap()
        .with_summary_backend(backend.clone());
    let high: Vec<String> = (1..=11)
        .map(|i| format!("I thought step {i} needed the quadratic formula"))
        .collect();
    let mut middle = high.clone();
    middle.extend((12..30).map(medium));
    let turn = replay(&mut manager, &middle, "Which step was wrong?").await;

    let report = turn.report.compaction.as_ref().unwrap();
    assert_eq!(report.high, 11);
    assert_eq!(report.kept, 11);
    assert_eq!(report.dropped, 9);
    assert_eq!(report.summary, SummaryOutcome::Withheld);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

    assert_eq!(turn.summary_position, None);
    assert!(!summary_in_wire(&turn));
    let emitted = texts(&turn);
    assert!(high.iter().all(|h| emitted.contains(h)));
    // HIGH overflow: anchor + 11 HIGH + recent window.
    assert_eq!(turn.messages.len(), 22);
    assert!(turn.messages.len() > ContextConfig::default().max_retained_messages + 1);
}

// ── Summaries ────────────────────────────────────────────────────────

#[tokio::test]
async fn later_summary_supersedes_earlier_one() {
    let backend = Arc::new(RecordingBackend::default());
    let mut manager = ContextManager::new(small_config())
        .unwrap()
        .with_summary_backend(backend.clone());

    manager.prepare(NewMessage::user(ANCHOR)).await.unwrap();
    let mut last = None;
    for i in 1..11 {
        last = Some(manager.prepare(NewMessage::user(medium(i))).await.unwrap());
    }
    let turn = last.unwrap();

    // Summaries were produced at store lengths 10 and 11.
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        backend.priors.lock().unwrap().as_slice(),
        &[None, Some("summary 1".to_string())]
    );

    let summary = manager.summary().unwrap();
    assert_eq!(summary.text, "summary 2");
    assert_eq!(summary.covers.to_string(), "[4-6]");

    let emitted = texts(&turn);
    assert_eq!(emitted.iter().filter(|t| t.starts_with(SUMMARY_HEADER)).count(), 1);
    assert!(emitted[1].ends_with("summary 2"));
    assert_eq!(turn.messages.len(), 9);
}

#[tokio::test]
async fn summary_failure_omits_summary_and_continues() {
    let mut manager = ContextManager::new(small_config())
        .unwrap()
        .with_summary_backend(AlwaysFails);

    manager.prepare(NewMessage::user(ANCHOR)).await.unwrap();
    let mut last = None;
    for i in 1..10 {
        last = Some(manager.prepare(NewMessage::user(medium(i))).await.unwrap());
    }
    let turn = last.unwrap();

    assert_eq!(manager.store().len(), 10);
    assert!(!summary_in_wire(&turn));
    assert!(manager.summary().is_none());
    assert!(matches!(
        turn.report.compaction.as_ref().unwrap().summary,
        SummaryOutcome::Failed { .. }
    ));
    assert_eq!(manager.lost().to_string(), "[4-5]");
}

#[tokio::test]
async fn failed_cycle_keeps_previous_summary_for_later_turns() {
    let backend = Arc::new(RecordingBackend::failing_on(2));
    let mut manager = ContextManager::new(small_config())
        .unwrap()
        .with_summary_backend(backend.clone());

    manager.prepare(NewMessage::user(ANCHOR)).await.unwrap();
    for i in 1..10 {
        manager.prepare(NewMessage::user(medium(i))).await.unwrap();
    }
    assert_eq!(manager.summary().unwrap().covers.to_string(), "[4-5]");

    // Second call fails: no summary this turn, message 6 is lost.
    let failed = manager.prepare(NewMessage::user(medium(10))).await.unwrap();
    assert!(!summary_in_wire(&failed));
    assert_eq!(manager.summary().unwrap().text, "summary 1");
    assert!(manager.lost().contains(6));

    // Third call succeeds and skips the lost message.
    let recovered = manager.prepare(NewMessage::user(medium(11))).await.unwrap();
    assert!(summary_in_wire(&recovered));
    assert_eq!(manager.summary().unwrap().covers.to_string(), "[4-5, 7]");
}

#[tokio::test]
async fn digest_keeps_newest_dropped_message_within_word_cap() {
    let config = ContextConfig::default();
    let word_cap = config.summary_word_cap;
    let mut manager = ContextManager::new(config)
        .unwrap()
        .with_summary_backend(LightweightDigest);

    let mut last = None;
    for i in 0..40 {
        let attempt = format!("Attempt {i}: I tried splitting the middle term into two factors of six.");
        last = Some(manager.prepare(NewMessage::user(attempt)).await.unwrap());
        manager
            .record(NewMessage::assistant(format!(
                "Hint {i}: look for two numbers whose product is six and whose sum is five."
            )))
            .unwrap();
    }
    let turn = last.unwrap();

    // Store length 79 at the last prepare: positions 10..=68 are dropped.
    let summary = manager.summary().unwrap();
    assert_eq!(summary.covers.to_string(), "[10-68]");
    assert!(summary.text.contains("(#68): Attempt 34:"));
    assert!(summary.text.contains("(#67): Hint 33:"));
    assert!(summary.word_count() <= word_cap);
    for heading in SUMMARY_SECTIONS {
        assert!(summary.text.contains(&format!("{heading}:")));
    }
    assert!(texts(&turn)[1].contains("Attempt 34:"));
}

#[tokio::test]
async fn digest_sections_fill_from_dropped_messages() {
    let mut manager = ContextManager::new(small_config())
        .unwrap()
        .with_summary_backend(LightweightDigest);
    // Odd positions are tutor turns.
    let middle = vec![
        medium(1),
        medium(2),
        medium(3),
        medium(4),
        "Not quite, check the sign on the middle term.".to_string(),
        "Then the middle coefficient must be negative five.".to_string(),
        "correct!".to_string(),
        "got it".to_string(),
        medium(9),
        medium(10),
        medium(11),
    ];
    let turn = replay(&mut manager, &middle, "What is the last step?").await;

    let report = turn.report.compaction.as_ref().unwrap();
    assert_eq!(report.dropped, 5);
    assert_eq!(report.summary, SummaryOutcome::Updated);

    let summary = &manager.summary().unwrap().text;
    assert_eq!(
        section_lines(summary, SUMMARY_SECTIONS[0]),
        vec![
            "- Tutor (#5): Not quite, check the sign on the middle term.",
            "- Student (#6): Then the middle coefficient must be negative five.",
        ]
    );
    assert_eq!(
        section_lines(summary, SUMMARY_SECTIONS[2]),
        vec!["- Tutor (#7): correct!", "- Student (#8): got it"]
    );
}

// ── Cache breakpoints ────────────────────────────────────────────────

#[tokio::test]
async fn new_message_keeps_every_breakpoint() {
    let mut manager = ContextManager::new(ContextConfig::default())
        .unwrap()
        .with_instructions("You are a patient algebra tutor.");
    let middle: Vec<String> = (1..11).map(medium).collect();
    let first = replay(&mut manager, &middle, "I'm stuck on the next step.").await;
    assert_eq!(first.messages.len(), 12);
    assert_eq!(first.breakpoints.len(), 3);

    let second = manager
        .prepare(NewMessage::user("Could you give me a hint?"))
        .await
        .unwrap();
    assert_eq!(second.messages.len(), 13);
    assert_eq!(second.breakpoints, first.breakpoints);
    assert_eq!(second.report.reused_breakpoints, 3);
    assert_eq!(second.report.shared_prefix, 12);

    let tiers: Vec<CacheTier> = second.breakpoints.iter().map(|b| b.tier).collect();
    assert_eq!(
        tiers,
        vec![CacheTier::Instructions, CacheTier::Anchor, CacheTier::History]
    );
}

#[tokio::test]
async fn anchor_is_stable_across_compacting_turns() {
    let mut manager = ContextManager::new(small_config())
        .unwrap()
        .with_instructions("You are a patient algebra tutor.")
        .with_summary_backend(LightweightDigest);

    let mut turns = vec![manager.prepare(NewMessage::user(ANCHOR)).await.unwrap()];
    for i in 1..15 {
        turns.push(manager.prepare(NewMessage::user(medium(i))).await.unwrap());
    }
    assert!(turns.iter().any(|t| t.report.compaction.is_some()));

    let anchor_hash = |turn: &PreparedTurn| {
        turn.breakpoints
            .iter()
            .find(|b| b.tier == CacheTier::Anchor)
            .map(|b| b.prefix_hash)
    };
    let first = anchor_hash(&turns[0]);
    assert!(first.is_some());
    for turn in &turns {
        assert_eq!(texts(turn)[0], ANCHOR);
        assert_eq!(turn.messages[0].breakpoint, Some(CacheTier::Anchor));
        assert!(turn.messages.len() <= small_config().max_retained_messages + 1);
        assert_eq!(anchor_hash(turn), first);
    }
}

#[tokio::test]
async fn uncompacted_turns_extend_the_previous_prefix() {
    let mut manager = ContextManager::new(ContextConfig::default()).unwrap();
    let mut previous_len = 0;
    for i in 0..8 {
        let turn = manager.prepare(NewMessage::user(medium(i))).await.unwrap();
        assert_eq!(turn.report.shared_prefix, previous_len);
        previous_len = turn.messages.len();
    }
}

#[tokio::test]
async fn same_history_produces_same_submission() {
    async fn run() -> (String, Vec<u8>) {
        let mut manager = ContextManager::new(small_config())
            .unwrap()
            .with_instructions("You are a patient algebra tutor.")
            .with_summary_backend(LightweightDigest);
        let mut last = None;
        manager.prepare(NewMessage::user(ANCHOR)).await.unwrap();
        for i in 1..12 {
            last = Some(manager.prepare(NewMessage::user(medium(i))).await.unwrap());
        }
        let turn = last.unwrap();
        let json = serde_json::to_string(&turn.wire()).unwrap();
        let hashes = turn
            .breakpoints
            .iter()
            .flat_map(|b| b.prefix_hash.to_vec())
            .collect();
        (json, hashes)
    }

    assert_eq!(run().await, run().await);
}

#[tokio::test]
async fn breakpoints_are_marked_on_the_wire() {
    let mut manager = ContextManager::new(ContextConfig::default())
        .unwrap()
        .with_instructions("You are a patient algebra tutor.");
    let middle: Vec<String> = (1..11).map(medium).collect();
    let turn = replay(&mut manager, &middle, "I'm stuck.").await;

    let json = serde_json::to_value(turn.wire()).unwrap();
    let marked = json
        .as_array()
        .unwrap()
        .iter()
        .filter(|m| {
            m["content"]
                .as_array()
                .and_then(|c| c.last())
                .is_some_and(|s| s["cache_control"]["type"] == "ephemeral")
        })
        .count();
    assert_eq!(marked, 3);
    assert!(turn.report.usage.cacheable_tokens > 0);
    assert!(turn.report.usage.cacheable_tokens < turn.report.usage.estimated_tokens);
}

// ── Events ───────────────────────────────────────────────────────────

#[tokio::test]
async fn events_report_summary_lifecycle() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = CompositeEventHandler::new()
        .with(LoggingHandler)
        .with(EventObserver::new(move |event| {
            let name = match event {
                ContextEvent::SummaryUpdated { .. } => "updated",
                ContextEvent::SummaryFailed { .. } => "failed",
                ContextEvent::Compacted { .. } => "compacted",
                _ => return,
            };
            sink.lock().unwrap().push(name);
        }));
    let mut manager = ContextManager::new(small_config())
        .unwrap()
        .with_summary_backend(RecordingBackend::failing_on(2))
        .with_event_handler(handler);

    manager.prepare(NewMessage::user(ANCHOR)).await.unwrap();
    for i in 1..11 {
        manager.prepare(NewMessage::user(medium(i))).await.unwrap();
    }

    // Compaction starts at store length 9; summaries at 10 and 11.
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &["compacted", "compacted", "updated", "compacted", "failed"]
    );
}
