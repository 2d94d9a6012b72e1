pub mod providers;

use serde::{Deserialize, Serialize};

/// Token usage reported for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// USD per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Published rates by model family, most specific first.
const PRICES: &[(&str, Price)] = &[
    ("opus", Price::new(0.015, 0.075)),
    ("sonnet", Price::new(0.003, 0.015)),
    ("haiku", Price::new(0.0008, 0.004)),
    ("gpt-4o-mini", Price::new(0.000_15, 0.0006)),
    ("gpt-4o", Price::new(0.0025, 0.01)),
    ("gpt-4", Price::new(0.03, 0.06)),
];

impl Price {
    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// Rate for `model` by family name. Unknown models get mid-tier rates.
    pub fn for_model(model: &str) -> Self {
        let model = model.to_lowercase();
        PRICES
            .iter()
            .find(|(family, _)| model.contains(family))
            .map_or(Self::new(0.003, 0.015), |(_, price)| *price)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 / 1000.0) * self.input_per_1k
            + (usage.output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// Cumulative spend across one enrichment sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostTracker {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub estimated_cost_usd: f64,
}

impl CostTracker {
    /// Record a billed call, whether or not its reply was usable.
    pub fn record_spend(&mut self, usage: &TokenUsage, cost_usd: f64) {
        self.total_input_tokens += usage.input_tokens;
        self.total_output_tokens += usage.output_tokens;
        self.total_requests += 1;
        self.estimated_cost_usd += cost_usd;
    }

    pub fn record_failure(&mut self) {
        self.failed_requests += 1;
    }

    /// A budget of 0 means unlimited.
    pub fn is_over_budget(&self, budget: f64) -> bool {
        budget > 0.0 && self.estimated_cost_usd >= budget
    }
}

/// A hosted model that turns one prompt into one reply.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn model_id(&self) -> &str;

    /// Send `prompt` with the provider's configured sampling settings.
    async fn complete(&self, prompt: &str) -> crate::error::Result<(String, TokenUsage)>;

    /// USD billed for `usage` on this model.
    fn cost(&self, usage: &TokenUsage) -> f64;
}
