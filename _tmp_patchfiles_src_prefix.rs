//! Prefix optimizer: reorder messages to maximize provider-side
//! prompt-cache hits, and estimate the resulting savings.
//!
//! Stable/volatile message classification feeds a per-provider discount
//! table and, for Anthropic, explicit cache-breakpoint positions.

use serde::{Deserialize, Serialize};

use crate::message::{Message, Role};
use crate::pricing::Provider;
use crate::tokens::TokenCounter;

/// `prefix: {...}` configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefixConfig {
    pub provider: Provider,
}

impl Default for PrefixConfig {
    fn default() -> Self {
        Self {
            provider: Provider::OpenAi,
        }
    }
}

/// An Anthropic-style cache-breakpoint position within the reordered message
/// list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBreakpoint {
    pub index: usize,
}

/// Result of reordering a conversation for prefix-cache affinity.
#[derive(Debug, Clone)]
pub struct PrefixResult {
    pub messages: Vec<Message>,
    pub stable_count: usize,
    pub prefix_tokens: usize,
    pub estimated_savings: f64,
    pub breakpoints: Vec<CacheBreakpoint>,
}

fn is_stable(message: &Message) -> bool {
    if message.role == Role::System || message.pinned {
        return true;
    }
    let lower = message.content.trim_start().to_lowercase();
    lower.starts_with("previous conversation summary") || lower.starts_with("summary:")
}

/// Reorders `messages` as stable-first then volatile (original order
/// preserved within each group), and estimates prefix-cache savings.
pub struct PrefixOptimizer {
    counter: TokenCounter,
}

impl PrefixOptimizer {
    pub fn new(counter: TokenCounter) -> Self {
        Self { counter }
    }

    pub fn optimize(
        &self,
        messages: &[Message],
        config: &PrefixConfig,
        input_price_per_million: f64,
    ) -> PrefixResult {
        let (stable, volatile): (Vec<&Message>, Vec<&Message>) =
            messages.iter().partition(|m| is_stable(m));

        let prefix_tokens = self.counter.count_chat_tokens(
            &stable.iter().map(|m| (*m).clone()).collect::<Vec<_>>(),
        ).total;

        let provider = config.provider;
        let activates = prefix_tokens >= provider.min_prefix_tokens();
        let estimated_savings = if activates {
            (prefix_tokens as f64 / 1_000_000.0)
                * input_price_per_million
                * provider.prefix_discount_rate()
        } else {
            0.0
        };

        let stable_count = stable.len();
        let mut out: Vec<Message> = stable.iter().map(|m| (*m).clone()).collect();
        out.extend(volatile.into_iter().cloned());

        let breakpoints = match provider {
            Provider::Anthropic if stable_count > 0 => {
                let mut bp = Vec::new();
                if let Some(first) = out.first() {
                    if first.role == Role::System
                        && self.counter.count_tokens(&first.content) > 200
                    {
                        bp.push(CacheBreakpoint { index: 0 });
                    }
                }
                bp.push(CacheBreakpoint {
                    index: stable_count.saturating_sub(1),
                });
                bp
            }
            _ => Vec::new(),
        };

        PrefixResult {
            messages: out,
            stable_count,
            prefix_tokens,
            estimated_savings,
            breakpoints,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer() -> PrefixOptimizer {
        PrefixOptimizer::new(TokenCounter::new(Provider::Anthropic))
    }

    #[test]
    fn stable_messages_come_first() {
        let messages = vec![
            Message::user("volatile question"),
            Message::system("be helpful").pin(),
            Message::user("another volatile message"),
        ];
        let result = optimizer().optimize(&messages, &PrefixConfig::default(), 3.0);
        assert_eq!(result.messages[0].content, "be helpful");
        assert_eq!(result.stable_count, 1);
    }

    #[test]
    fn anthropic_breakpoint_at_end_of_stable_section() {
        let messages = vec![
            Message::system("short system prompt").pin(),
            Message::user("hello"),
        ];
        let config = PrefixConfig {
            provider: Provider::Anthropic,
        };
        let result = optimizer().optimize(&messages, &config, 3.0);
        assert!(result.breakpoints.contains(&CacheBreakpoint { index: 0 }));
    }

    #[test]
    fn openai_requires_1024_tokens_to_activate() {
        let messages = vec![Message::system("short").pin(), Message::user("hi")];
        let config = PrefixConfig {
            provider: Provider::OpenAi,
        };
        let result = optimizer().optimize(&messages, &config, 2.5);
        assert_eq!(result.estimated_savings, 0.0);
    }
}


