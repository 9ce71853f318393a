//! Cost estimator: static per-model pricing table and
//! `(modelId, inputTokens, outputTokens) -> dollars` mapping.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Upstream LLM provider. Drives both tokenizer choice and prefix-cache
/// discount rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    OpenSource,
    Other,
}

impl Provider {
    /// Prefix-cache discount rate applied by the prefix optimizer.
    pub fn prefix_discount_rate(self) -> f64 {
        match self {
            Provider::OpenAi => 0.5,
            Provider::Anthropic => 0.9,
            Provider::Google => 0.75,
            Provider::OpenSource | Provider::Other => 0.0,
        }
    }

    /// Minimum stable-prefix token count required before the provider's
    /// prompt cache activates at all.
    pub fn min_prefix_tokens(self) -> usize {
        match self {
            Provider::OpenAi => 1024,
            _ => 0,
        }
    }
}

/// Static pricing and capability record for one model id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub provider: Provider,
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
    pub max_complexity: Option<u8>,
}

impl ModelSpec {
    pub fn new(
        id: impl Into<String>,
        provider: Provider,
        input_cost_per_million: f64,
        output_cost_per_million: f64,
    ) -> Self {
        Self {
            id: id.into(),
            provider,
            input_cost_per_million,
            output_cost_per_million,
            max_complexity: None,
        }
    }

    pub fn with_max_complexity(mut self, max_complexity: u8) -> Self {
        self.max_complexity = Some(max_complexity);
        self
    }

    pub fn calculate_cost(&self, input_tokens: usize, output_tokens: usize) -> f64 {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_million;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_million;
        input_cost + output_cost
    }
}

/// Well-known pricing entries, reproduced verbatim as static configuration.
pub fn default_pricing_table() -> Vec<ModelSpec> {
    vec![
        ModelSpec::new("gpt-4o", Provider::OpenAi, 2.50, 10.00).with_max_complexity(100),
        ModelSpec::new("gpt-4o-mini", Provider::OpenAi, 0.15, 0.60).with_max_complexity(60),
        ModelSpec::new(
            "claude-3-5-sonnet-20241022",
            Provider::Anthropic,
            3.00,
            15.00,
        )
        .with_max_complexity(100),
        ModelSpec::new(
            "claude-3-5-haiku-20241022",
            Provider::Anthropic,
            0.80,
            4.00,
        )
        .with_max_complexity(55),
        ModelSpec::new("gemini-1.5-pro", Provider::Google, 1.25, 5.00).with_max_complexity(90),
        ModelSpec::new("gemini-1.5-flash", Provider::Google, 0.075, 0.30)
            .with_max_complexity(50),
    ]
}

/// In-memory lookup table mapping model id -> pricing/capability record.
#[derive(Debug, Clone)]
pub struct PricingTable {
    models: Vec<ModelSpec>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new(default_pricing_table())
    }
}

impl PricingTable {
    pub fn new(models: Vec<ModelSpec>) -> Self {
        Self { models }
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == model_id)
    }

    pub fn models(&self) -> &[ModelSpec] {
        &self.models
    }

    /// `(modelId, inputTokens, outputTokens) -> dollars`; fails with
    /// `UnknownModel` where pricing is mandatory.
    pub fn estimate_cost(
        &self,
        model_id: &str,
        input_tokens: usize,
        output_tokens: usize,
    ) -> Result<f64> {
        self.get(model_id)
            .map(|m| m.calculate_cost(input_tokens, output_tokens))
            .ok_or_else(|| Error::unknown_model(model_id))
    }

    /// Same as [`Self::estimate_cost`] but swallows `UnknownModel` to `0.0`,
    /// for savings-reporting paths where pricing is advisory.
    pub fn estimate_cost_or_zero(&self, model_id: &str, input_tokens: usize, output_tokens: usize) -> f64 {
        self.estimate_cost(model_id, input_tokens, output_tokens)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_fails() {
        let table = PricingTable::default();
        let err = table.estimate_cost("not-a-model", 100, 100).unwrap_err();
        assert!(matches!(err, Error::UnknownModel(_)));
    }

    #[test]
    fn known_model_computes_cost() {
        let table = PricingTable::default();
        let cost = table
            .estimate_cost("gpt-4o-mini", 5_000_000, 0)
            .expect("known model");
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn anthropic_discount_rate_matches_spec() {
        assert_eq!(Provider::Anthropic.prefix_discount_rate(), 0.9);
        assert_eq!(Provider::OpenAi.min_prefix_tokens(), 1024);
    }
}
