//! Replay a tutoring transcript through a context session.
//!
//! Reads a JSON transcript, feeds it turn by turn (assistant messages are
//! recorded, every other message is prepared), and prints the wire request
//! the final turn would submit. Logs go to stderr; set `RUST_LOG` to change
//! the level.
//!
//! # Examples
//!
//! ```sh
//! # Offline: digest summaries, print the last request and per-turn reports.
//! tutor-context --transcript session.json --digest
//!
//! # Print every turn, then send the last one and show cache usage and cost.
//! OPENROUTER_KEY=... tutor-context --transcript session.json --every-turn --send
//! ```
//!
//! Transcript format:
//!
//! ```json
//! {
//!   "instructions": "You are a patient algebra tutor.",
//!   "messages": [
//!     {"role": "user", "content": "Solve x^2 - 5x + 6 = 0"},
//!     {"role": "assistant", "content": "What two numbers multiply to 6?"}
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tutor_context::DEFAULT_MODEL;
use tutor_context::prelude::*;

#[derive(Parser)]
#[command(name = "tutor-context")]
struct Cli {
    /// Transcript to replay (JSON).
    #[arg(long)]
    transcript: PathBuf,

    /// Session config file (JSON). Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Message count above which compaction runs.
    #[arg(long)]
    max_retained: Option<usize>,

    /// Trailing messages kept verbatim when compacting.
    #[arg(long)]
    recent_window: Option<usize>,

    /// Trailing messages that never get a cache breakpoint.
    #[arg(long)]
    freshness_window: Option<usize>,

    /// Emit every turn without cache breakpoints.
    #[arg(long)]
    no_cache: bool,

    /// Drop messages without summarizing them.
    #[arg(long)]
    no_summary: bool,

    /// Use the offline digest instead of a model for summaries.
    #[arg(long)]
    digest: bool,

    /// Print the wire request of every prepared turn, not just the last.
    #[arg(long)]
    every_turn: bool,

    /// Send the final request to OpenRouter and print the reply.
    #[arg(long)]
    send: bool,

    /// Model for the final request.
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Maximum tokens for the reply.
    #[arg(long, default_value_t = 1024)]
    max_tokens: u32,

    /// Sampling temperature for the reply.
    #[arg(long, default_value_t = 0.7)]
    temperature: f32,
}

#[derive(Deserialize, Debug)]
struct Transcript {
    #[serde(default)]
    instructions: String,
    messages: Vec<NewMessage>,
}

fn load_transcript(path: &Path) -> Result<Transcript, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read transcript {}: {e}", path.display()))?;
    serde_json::from_str(&text)
        .map_err(|e| format!("failed to parse transcript {}: {e}", path.display()))
}

fn build_config(cli: &Cli) -> Result<ContextConfig, String> {
    let mut config = match &cli.config {
        Some(path) => ContextConfig::load(path)?,
        None => ContextConfig::default(),
    };
    if let Some(n) = cli.max_retained {
        config.max_retained_messages = n;
    }
    if let Some(n) = cli.recent_window {
        config.recent_window_size = n;
    }
    if let Some(n) = cli.freshness_window {
        config.cache_freshness_window = n;
    }
    if cli.no_cache {
        config.caching_enabled = false;
    }
    if cli.no_summary {
        config.summarizer.enabled = false;
    }
    Ok(config)
}

fn print_json(value: &impl serde::Serialize) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| format!("failed to encode: {e}"))?;
    println!("{text}");
    Ok(())
}

async fn run(cli: Cli) -> Result<(), String> {
    let transcript = load_transcript(&cli.transcript)?;
    let config = build_config(&cli)?;
    let summarizer_config = config.summarizer.config.clone();
    let summaries_on = config.summarizer.enabled;
    let api_key = std::env::var("OPENROUTER_KEY").ok();

    let mut manager = ContextManager::new(config)
        .map_err(|e| e.to_string())?
        .with_instructions(transcript.instructions)
        .with_event_handler(LoggingHandler);

    if summaries_on {
        manager = match (&api_key, cli.digest) {
            (Some(key), false) => {
                let client = OpenRouterClient::new(key.clone())?;
                manager.with_summary_backend(OpenRouterSummaryBackend::new(
                    client,
                    summarizer_config,
                ))
            }
            (None, false) => {
                warn!("OPENROUTER_KEY is not set; using the offline digest for summaries");
                manager.with_summary_backend(LightweightDigest)
            }
            (_, true) => manager.with_summary_backend(LightweightDigest),
        };
    }

    let mut last = None;
    for message in transcript.messages {
        if message.role == Some(MessageRole::Assistant) {
            manager.record(message).map_err(|e| e.to_string())?;
            continue;
        }
        let turn = manager.prepare(message).await.map_err(|e| e.to_string())?;
        if cli.every_turn {
            print_json(&serde_json::json!({
                "report": &turn.report,
                "messages": turn.wire(),
            }))?;
        }
        last = Some(turn);
    }

    let turn = last.ok_or_else(|| "transcript has no turns to prepare".to_string())?;
    let request = turn.to_request(&cli.model, cli.max_tokens, cli.temperature);
    if !cli.every_turn {
        print_json(&request)?;
        print_json(&turn.report)?;
    }

    if cli.send {
        let key = api_key.ok_or_else(|| "OPENROUTER_KEY must be set for --send".to_string())?;
        let client = OpenRouterClient::new(key)?;
        let completion = client.chat(&request).await?;
        println!("{}", completion.content.unwrap_or_default());

        if let Some(usage) = completion.usage {
            let mut tracker = CostTracker::new();
            tracker.record(&usage, &pricing_for_model(&cli.model));
            info!("{}", tracker.summary());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
