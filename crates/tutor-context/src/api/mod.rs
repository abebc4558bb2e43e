//! Transport-side collaborators.
//!
//! - [`summary`]: [`OpenRouterSummaryBackend`], the network summarization
//!   backend.
//! - [`retry`]: transient error detection (429, 5xx, network timeouts) with
//!   exponential backoff. Used by the summary backend only.
//! - [`pricing`]: per-model pricing with cache-read discounts and a
//!   cumulative [`CostTracker`].

pub mod pricing;
pub mod retry;
pub mod summary;

pub use pricing::{CostTracker, ModelPricing, pricing_for_model};
pub use retry::RetryConfig;
pub use summary::OpenRouterSummaryBackend;
