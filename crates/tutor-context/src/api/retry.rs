//! Exponential backoff for the summary transport.
//!
//! Transient failures (429, 5xx, connection resets, timeouts) are retried;
//! client errors (400, 401, 403, 404, 422) never are. The context engine
//! itself never retries anything. This lives with the collaborator.

use std::time::Duration;
use tracing::warn;

/// Backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = fail immediately).
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Scale delays down by a fixed per-attempt factor so concurrent sessions
    /// do not retry in lockstep.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        const JITTER: [f64; 4] = [0.75, 0.90, 0.60, 0.85];

        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let factor = if self.jitter {
            JITTER[attempt as usize % JITTER.len()]
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }
}

/// How a transport error string should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Unknown,
}

/// Classify an error string produced by [`OpenRouterClient`](crate::OpenRouterClient).
pub fn classify_error(error: &str) -> ErrorKind {
    const PERMANENT: [&str; 8] = [
        "HTTP 400",
        "HTTP 401",
        "HTTP 403",
        "HTTP 404",
        "HTTP 422",
        "invalid",
        "bad request",
        "unauthorized",
    ];
    const TRANSIENT_STATUS: [&str; 5] = ["HTTP 429", "HTTP 500", "HTTP 502", "HTTP 503", "HTTP 504"];
    const TRANSIENT_TEXT: [&str; 7] = [
        "request failed:",
        "connection reset",
        "connection refused",
        "timed out",
        "timeout",
        "broken pipe",
        "network",
    ];

    if PERMANENT.iter().any(|p| error.contains(p)) {
        return ErrorKind::Permanent;
    }
    let lower = error.to_lowercase();
    if TRANSIENT_STATUS.iter().any(|s| error.contains(s))
        || TRANSIENT_TEXT.iter().any(|p| lower.contains(p))
    {
        ErrorKind::Transient
    } else {
        ErrorKind::Unknown
    }
}

/// Run `call` until it succeeds, fails with a non-transient error, or the
/// retry budget is spent.
pub async fn retry_call<T, F, Fut>(config: &RetryConfig, mut call: F) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, String>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < config.max_retries && classify_error(&e) == ErrorKind::Transient => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "Transient API error (attempt {}/{}): {e}. Retrying in {delay:?}...",
                    attempt + 1,
                    config.max_retries,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
