//! Summarization over the OpenRouter chat completions API.

use crate::api::retry::{RetryConfig, retry_call};
use crate::context::summarizer::{SummarizerConfig, SummaryBackend, SummaryFuture, SummaryRequest};
use crate::{ChatRequest, OpenRouterClient, WireMessage};
use tracing::debug;

/// [`SummaryBackend`] that asks a cheap chat model for the summary.
///
/// Transient transport errors are retried with backoff; everything else is
/// handed back to the summarizer as a failure.
pub struct OpenRouterSummaryBackend {
    client: OpenRouterClient,
    config: SummarizerConfig,
    retry: RetryConfig,
}

impl OpenRouterSummaryBackend {
    pub fn new(client: OpenRouterClient, config: SummarizerConfig) -> Self {
        let retry = RetryConfig::with_retries(config.max_retries);
        Self {
            client,
            config,
            retry,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn build_request(&self, request: &SummaryRequest<'_>) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                WireMessage::system(request.system_prompt()),
                WireMessage::user(request.user_prompt()),
            ],
            max_tokens: self.config.max_summary_tokens,
            temperature: self.config.temperature,
            usage: None,
        }
    }
}

impl SummaryBackend for OpenRouterSummaryBackend {
    fn summarize<'a>(&'a self, request: SummaryRequest<'a>) -> SummaryFuture<'a> {
        Box::pin(async move {
            let body = self.build_request(&request);
            debug!(
                "Summarizing {} message(s) with {}",
                request.messages.len(),
                body.model
            );
            let completion = retry_call(&self.retry, || self.client.chat(&body)).await?;
            completion
                .content
                .ok_or_else(|| "summary model returned no content".to_string())
        })
    }
}
