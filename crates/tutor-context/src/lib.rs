//! Context bounding and cache-breakpoint planning for tutoring conversations.
//!
//! `tutor-context` sits between a chat front end and a prefix-caching LLM
//! backend reached through [OpenRouter](https://openrouter.ai/). Every turn
//! resubmits the conversation; the backend discounts any leading run of
//! messages that is byte-identical to a prefix it has already processed. The
//! crate keeps that run as long as possible while holding the message count
//! under a fixed budget.
//!
//! The entry point is [`ContextManager`](context::manager::ContextManager):
//! one per session, fed one turn at a time through
//! [`prepare()`](context::manager::ContextManager::prepare).
//!
//! ```ignore
//! use tutor_context::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let api_key = std::env::var("OPENROUTER_KEY").map_err(|e| e.to_string())?;
//!     let client = OpenRouterClient::new(api_key)?;
//!
//!     let config = ContextConfig::default().with_max_retained_messages(20);
//!     let mut manager = ContextManager::new(config)
//!         .map_err(|e| e.to_string())?
//!         .with_instructions("You are a patient algebra tutor.")
//!         .with_summary_backend(OpenRouterSummaryBackend::new(client, SummarizerConfig::default()))
//!         .with_event_handler(LoggingHandler);
//!
//!     manager.prepare(NewMessage::user("Solve x^2 - 5x + 6 = 0")).await.map_err(|e| e.to_string())?;
//!     manager.record(NewMessage::assistant("Which two numbers multiply to 6?")).map_err(|e| e.to_string())?;
//!     let turn = manager.prepare(NewMessage::user("I thought factoring means finding common factors")).await.map_err(|e| e.to_string())?;
//!
//!     println!("{}", turn.report.to_log_string());
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Message store, importance classifier, budget allocator, summarizer, cache planner, the session façade |
//! | [`api`] | OpenRouter summary backend, retry with backoff, pricing with cache-read discount |
//! | [`config`] | Session configuration and module toggles |
//! | [`events`] | Per-turn events and handlers |
//! | [`error`] | The error taxonomy returned by `prepare` |

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod prelude;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// ── Constants ──────────────────────────────────────────────────────

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model for tutoring replies.
pub const DEFAULT_MODEL: &str = "anthropic/claude-haiku-4.5";

/// Default model for summarization calls (cheaper than the main model).
pub const DEFAULT_SUMMARY_MODEL: &str = "openai/gpt-4o-mini";

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Reference to an image hosted elsewhere (URL or `data:` URI).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ImageUrl {
    pub url: String,
}

/// One piece of message content. Serializes to the OpenAI content-part
/// format (`{"type": "text", "text": ...}` / `{"type": "image_url", ...}`).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Segment::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Segment::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }

    /// The text of a text segment, `None` for images.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Segment::Text { text } => Some(text),
            Segment::ImageUrl { .. } => None,
        }
    }
}

/// A message as it lives in the [`MessageStore`](context::store::MessageStore).
///
/// Immutable once appended. `sequence_index` is assigned by the store and
/// increases by one per append.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<Segment>,
    pub sequence_index: u64,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// All text segments joined by newlines. Images are skipped.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(Segment::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn image_count(&self) -> usize {
        self.content
            .iter()
            .filter(|s| matches!(s, Segment::ImageUrl { .. }))
            .count()
    }

    /// Wire form of this message, without a breakpoint marker.
    pub fn to_wire(&self) -> WireMessage {
        WireMessage::new(self.role, self.content.clone())
    }
}

/// Caller-side input to [`MessageStore::append`](context::store::MessageStore::append).
///
/// `role` is optional so that transcripts with a missing role deserialize
/// and are rejected by the store with `InvalidRole` rather than by serde.
/// `content` accepts either a plain string or a list of segments; the choice
/// is resolved once here.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(from = "RawNewMessage")]
pub struct NewMessage {
    pub role: Option<MessageRole>,
    pub content: Vec<Segment>,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: Vec<Segment>) -> Self {
        Self {
            role: Some(role),
            content,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, vec![Segment::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![Segment::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, vec![Segment::text(text)])
    }

    /// Append an image segment.
    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.content.push(Segment::image(url));
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Segments(Vec<Segment>),
}

#[derive(Deserialize)]
struct RawNewMessage {
    #[serde(default)]
    role: Option<MessageRole>,
    #[serde(default)]
    content: Option<RawContent>,
}

impl From<RawNewMessage> for NewMessage {
    fn from(raw: RawNewMessage) -> Self {
        let content = match raw.content {
            Some(RawContent::Text(text)) => vec![Segment::Text { text }],
            Some(RawContent::Segments(segments)) => segments,
            None => Vec::new(),
        };
        Self {
            role: raw.role,
            content,
        }
    }
}

// ── Wire types ─────────────────────────────────────────────────────

/// Prefix-cache tier of a breakpoint. Lower tiers sit earlier in the
/// sequence and move less often.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    /// End of the static system-instructions block.
    Instructions,
    /// End of the anchor (first) message.
    Anchor,
    /// Last stable message before the freshness window.
    History,
}

impl CacheTier {
    /// Numeric priority: 1 for instructions, 2 for the anchor, 3 for history.
    pub fn priority(self) -> u8 {
        match self {
            CacheTier::Instructions => 1,
            CacheTier::Anchor => 2,
            CacheTier::History => 3,
        }
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tier {}", self.priority())
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
struct CacheControl {
    #[serde(rename = "type")]
    kind: &'static str,
}

const EPHEMERAL: CacheControl = CacheControl { kind: "ephemeral" };

/// A message as submitted to the transport.
///
/// `breakpoint` is metadata: on serialization it becomes a
/// `cache_control: {"type": "ephemeral"}` annotation on the last content
/// segment. [`canonical_bytes`](Self::canonical_bytes) leaves it out, so
/// marking a message never changes the identity of the prefix it closes.
#[derive(Clone, Debug, PartialEq)]
pub struct WireMessage {
    pub role: MessageRole,
    pub content: Vec<Segment>,
    pub breakpoint: Option<CacheTier>,
}

#[derive(Serialize)]
struct EncodedSegment<'a> {
    #[serde(flatten)]
    segment: &'a Segment,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Serialize)]
struct EncodedMessage<'a> {
    role: MessageRole,
    content: Vec<EncodedSegment<'a>>,
}

impl WireMessage {
    pub fn new(role: MessageRole, content: Vec<Segment>) -> Self {
        Self {
            role,
            content,
            breakpoint: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, vec![Segment::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![Segment::text(text)])
    }

    fn encode(&self, with_marker: bool) -> EncodedMessage<'_> {
        let last = self.content.len().saturating_sub(1);
        let marked = with_marker && self.breakpoint.is_some();
        EncodedMessage {
            role: self.role,
            content: self
                .content
                .iter()
                .enumerate()
                .map(|(i, segment)| EncodedSegment {
                    segment,
                    cache_control: (marked && i == last).then_some(EPHEMERAL),
                })
                .collect(),
        }
    }

    /// Serialized bytes of role and content, excluding any breakpoint marker.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(&self.encode(false))
            .map_err(|e| format!("failed to encode {} message: {e}", self.role))
    }

    /// Total characters of text content.
    pub fn text_chars(&self) -> usize {
        self.content
            .iter()
            .filter_map(Segment::as_text)
            .map(|t| t.chars().count())
            .sum()
    }
}

impl Serialize for WireMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.encode(true).serialize(serializer)
    }
}

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body. Unused optional fields are omitted from
/// serialization.
#[derive(Serialize, Debug, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "is_zero_f32")]
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageRequest>,
}

/// Asks OpenRouter to include token accounting (with cached-token detail)
/// in the response.
#[derive(Serialize, Debug, Clone, Copy)]
pub struct UsageRequest {
    pub include: bool,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

// ── Response types ─────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

/// Clean return type from `OpenRouterClient::chat()`.
#[derive(Debug)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
}

/// Token usage statistics.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    #[serde(default)]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct PromptTokensDetails {
    /// Prompt tokens served from the provider's prefix cache.
    pub cached_tokens: Option<u32>,
}

impl UsageInfo {
    pub fn cached_tokens(&self) -> u32 {
        self.prompt_tokens_details
            .as_ref()
            .and_then(|d| d.cached_tokens)
            .unwrap_or(0)
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    pub(crate) client: reqwest::Client,
    pub(crate) api_key: String,
    pub(crate) referer: String,
    pub(crate) title: String,
}

impl OpenRouterClient {
    /// Create a new client with the given API key and default headers.
    pub fn new(api_key: impl Into<String>) -> Result<Self, String> {
        Self::with_headers(
            api_key,
            "https://github.com/tacryt-socryp/tutor-context",
            "tutor-context",
        )
    }

    /// Create a new client with custom Referer and X-Title headers.
    pub fn with_headers(
        api_key: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("tutor-context/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            referer: referer.into(),
            title: title.into(),
        })
    }

    /// Send a chat completion request.
    pub async fn chat(&self, body: &ChatRequest) -> Result<ChatCompletion, String> {
        let marked = body
            .messages
            .iter()
            .filter(|m| m.breakpoint.is_some())
            .count();
        debug!(
            "LLM request: model={}, messages={}, breakpoints={}, max_tokens={}, temp={}",
            body.model,
            body.messages.len(),
            marked,
            body.max_tokens,
            body.temperature,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();

        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("OpenRouter API HTTP {status}: {text}"));
        }

        let parsed: RawChatResponse =
            serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))?;

        if let Some(err) = parsed.error {
            return Err(format!("OpenRouter API error: {}", err.message));
        }

        if let Some(ref usage) = parsed.usage {
            debug!(
                "Token usage: prompt={} (cached={}), completion={}, total={}",
                usage.prompt_tokens.unwrap_or(0),
                usage.cached_tokens(),
                usage.completion_tokens.unwrap_or(0),
                usage.total_tokens.unwrap_or(0),
            );
        }

        let choice = parsed.choices.and_then(|c| c.into_iter().next());
        match choice {
            Some(c) => Ok(ChatCompletion {
                content: c.message.content,
                usage: parsed.usage,
                finish_reason: c.finish_reason,
            }),
            None => {
                debug!("LLM output: empty (no choices)");
                Ok(ChatCompletion {
                    content: None,
                    usage: parsed.usage,
                    finish_reason: None,
                })
            }
        }
    }
}
