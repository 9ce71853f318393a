//! Model router: complexity-scored model tier downgrade.
//!
//! Weighted regex feature extraction feeds a 0-100 complexity score, then
//! cheapest-tier selection under a max-complexity ceiling.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::pricing::PricingTable;

/// One entry of `router: {tiers: [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTier {
    pub model_id: String,
    pub max_complexity: u8,
}

/// `router: {...}` configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub tiers: Vec<ModelTier>,
    pub complexity_threshold: u8,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tiers: Vec::new(),
            complexity_threshold: 0,
        }
    }
}

static TECHNICAL_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(algorithm|architecture|concurren\w*|database|deadlock|kernel|latency|mutex|protocol|recursion|schema|thread|topology|transaction)\b")
        .expect("static regex")
});

static PUNCTUATION_DENSITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[;{}\[\]()<>]").expect("static regex")
});

/// Weighted feature extraction over length, punctuation, and technical-term
/// density, producing a 0-100 complexity score.
pub fn complexity(prompt: &str) -> u8 {
    let len = prompt.chars().count();
    let length_score = ((len as f64 / 2_000.0) * 40.0).min(40.0);

    let punctuation_hits = PUNCTUATION_DENSITY.find_iter(prompt).count();
    let punctuation_score = ((punctuation_hits as f64 / 20.0) * 30.0).min(30.0);

    let technical_hits = TECHNICAL_TERMS.find_iter(prompt).count();
    let technical_score = ((technical_hits as f64 / 5.0) * 30.0).min(30.0);

    (length_score + punctuation_score + technical_score).round().clamp(0.0, 100.0) as u8
}

/// Outcome of routing: either the original model (no downgrade available or
/// needed) or a cheaper tier, with the resulting savings.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub selected_model: String,
    pub complexity: u8,
    pub downgraded: bool,
    pub savings: f64,
}

/// Picks the cheapest tier whose `max_complexity >= score`; skipped entirely
/// when the request context is `tier_routed`.
pub struct ModelRouter {
    config: RouterConfig,
}

impl ModelRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn route(
        &self,
        prompt: &str,
        original_model: &str,
        pricing: &PricingTable,
        input_tokens: usize,
        output_tokens: usize,
    ) -> RoutingDecision {
        let score = complexity(prompt);

        let chosen = self
            .config
            .tiers
            .iter()
            .filter(|t| t.max_complexity as u16 >= score as u16)
            .min_by(|a, b| {
                let cost_a = pricing.estimate_cost_or_zero(&a.model_id, input_tokens, output_tokens);
                let cost_b = pricing.estimate_cost_or_zero(&b.model_id, input_tokens, output_tokens);
                cost_a.partial_cmp(&cost_b).unwrap_or(std::cmp::Ordering::Equal)
            });

        match chosen {
            Some(tier) if tier.model_id != original_model => {
                let original_cost =
                    pricing.estimate_cost_or_zero(original_model, input_tokens, output_tokens);
                let new_cost =
                    pricing.estimate_cost_or_zero(&tier.model_id, input_tokens, output_tokens);
                RoutingDecision {
                    selected_model: tier.model_id.clone(),
                    complexity: score,
                    downgraded: true,
                    savings: (original_cost - new_cost).max(0.0),
                }
            }
            _ => RoutingDecision {
                selected_model: original_model.to_string(),
                complexity: score,
                downgraded: false,
                savings: 0.0,
            },
        }
    }
}
