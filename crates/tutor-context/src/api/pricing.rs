//! Per-model pricing with prefix-cache discounts, and a cumulative tracker.
//!
//! Cached prompt tokens are billed at a fraction of the input price. For
//! Claude models that fraction is 10%; other providers are billed at full
//! price here, which keeps estimates conservative.

use crate::UsageInfo;

/// USD per 1M tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    /// Fraction of the input price charged for cache reads.
    pub cache_read_multiplier: f64,
}

impl ModelPricing {
    fn new(input: f64, output: f64) -> Self {
        Self {
            input_per_million: input,
            output_per_million: output,
            cache_read_multiplier: 1.0,
        }
    }

    fn with_cache_discount(mut self, multiplier: f64) -> Self {
        self.cache_read_multiplier = multiplier;
        self
    }

    /// Estimate cost. `cached_tokens` is the part of `prompt_tokens` served
    /// from cache.
    pub fn estimate_cost(&self, prompt_tokens: u32, cached_tokens: u32, completion_tokens: u32) -> f64 {
        let cached = cached_tokens.min(prompt_tokens) as f64;
        let uncached = prompt_tokens as f64 - cached;
        let input = (uncached + cached * self.cache_read_multiplier) / 1_000_000.0
            * self.input_per_million;
        input + (completion_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        // Mid-range estimate for unknown models.
        Self::new(3.0, 15.0)
    }
}

/// Approximate pricing for a model, matched on the name after the last `/`.
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();

    let pricing = if name.contains("opus") {
        ModelPricing::new(15.0, 75.0)
    } else if name.contains("sonnet") {
        ModelPricing::new(3.0, 15.0)
    } else if name.contains("haiku-4") {
        ModelPricing::new(1.0, 5.0)
    } else if name.contains("haiku") {
        ModelPricing::new(0.25, 1.25)
    } else if name.contains("gpt-4o-mini") {
        ModelPricing::new(0.15, 0.60)
    } else if name.contains("gpt-4o") {
        ModelPricing::new(2.50, 10.0)
    } else if name.contains("gemini") && name.contains("flash") {
        ModelPricing::new(0.10, 0.40)
    } else if name.contains("gemini") {
        ModelPricing::new(1.25, 5.0)
    } else if name.contains("deepseek-r1") {
        ModelPricing::new(0.20, 4.50)
    } else if name.contains("deepseek") {
        ModelPricing::new(0.27, 1.10)
    } else {
        ModelPricing::default()
    };

    if name.contains("claude") {
        pricing.with_cache_discount(0.1)
    } else {
        pricing
    }
}

/// Cumulative token and cost totals for a session.
#[derive(Debug, Default)]
pub struct CostTracker {
    pub total_prompt_tokens: u64,
    pub total_cached_tokens: u64,
    pub total_completion_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the usage block of one response.
    pub fn record(&mut self, usage: &UsageInfo, pricing: &ModelPricing) {
        let prompt = usage.prompt_tokens.unwrap_or(0);
        let completion = usage.completion_tokens.unwrap_or(0);
        let cached = usage.cached_tokens();
        self.total_prompt_tokens += prompt as u64;
        self.total_cached_tokens += cached as u64;
        self.total_completion_tokens += completion as u64;
        self.estimated_cost_usd += pricing.estimate_cost(prompt, cached, completion);
    }

    /// Fraction of prompt tokens served from cache.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_prompt_tokens == 0 {
            0.0
        } else {
            self.total_cached_tokens as f64 / self.total_prompt_tokens as f64
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "tokens: {} prompt ({} cached, {:.0}%) + {} completion, est. cost: ${:.4}",
            self.total_prompt_tokens,
            self.total_cached_tokens,
            self.cache_hit_rate() * 100.0,
            self.total_completion_tokens,
            self.estimated_cost_usd,
        )
    }
}
