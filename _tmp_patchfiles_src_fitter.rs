//! Context fitter: token-budget-aware message trimming with
//! pinning, built on [`crate::message::Message`] and [`crate::tokens::TokenCounter`].

use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::tokens::TokenCounter;

/// `context: {...}` configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_context_tokens: usize,
    pub reserve_for_output: usize,
    /// Include a synthetic summary message for evicted content when it fits.
    pub summarize_evicted: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 8_192,
            reserve_for_output: 1_024,
            summarize_evicted: true,
        }
    }
}

/// Chat-priming token overhead counted against the remaining budget.
const CHAT_PRIMING_TOKENS: usize = 3;

/// Result of fitting a conversation into the configured token budget.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub messages: Vec<Message>,
    pub original_tokens: usize,
    pub trimmed_tokens: usize,
    pub evicted_count: usize,
    pub evicted_tokens: usize,
}

impl FitResult {
    pub fn saved_tokens(&self) -> usize {
        self.original_tokens.saturating_sub(self.trimmed_tokens)
    }
}

/// Fits `messages` into `config`'s token budget, keeping pinned/system
/// messages unconditionally and evicting unpinned messages oldest-first
/// until the remainder fits.
pub struct ContextFitter {
    counter: TokenCounter,
}

impl ContextFitter {
    pub fn new(counter: TokenCounter) -> Self {
        Self { counter }
    }

    pub fn fit(&self, messages: &[Message], config: &ContextConfig) -> FitResult {
        let original_tokens = self.counter.count_chat_tokens(messages).total;

        let (pinned, unpinned): (Vec<&Message>, Vec<&Message>) =
            messages.iter().partition(|m| m.is_protected());

        let pinned_tokens: usize = pinned.iter().map(|m| self.message_tokens(m)).sum();

        let remaining_budget = (config.max_context_tokens as i64)
            - (config.reserve_for_output as i64)
            - (pinned_tokens as i64)
            - (CHAT_PRIMING_TOKENS as i64);
        let mut remaining = remaining_budget.max(0) as usize;

        // Newest to oldest.
        let mut kept_rev: Vec<&Message> = Vec::new();
        let mut evicted: Vec<&Message> = Vec::new();
        for m in unpinned.iter().rev() {
            let tokens = self.message_tokens(m);
            if tokens <= remaining {
                remaining -= tokens;
                kept_rev.push(m);
            } else {
                evicted.push(m);
            }
        }
        let kept: Vec<&Message> = {
            let mut v = kept_rev;
            v.reverse();
            v
        };

        let evicted_tokens: usize = evicted.iter().map(|m| self.message_tokens(m)).sum();
        let evicted_count = evicted.len();

        let mut out: Vec<Message> = pinned.into_iter().cloned().collect();
        out.extend(kept.into_iter().cloned());

        if evicted_count > 0 && config.summarize_evicted {
            let summary_text = build_summary(&evicted);
            let summary = Message::system(summary_text).pin();
            let summary_tokens = self.message_tokens(&summary);
            if summary_tokens <= remaining {
                out.push(summary);
            }
        }

        let trimmed_tokens = self.counter.count_chat_tokens(&out).total;

        FitResult {
            messages: out,
            original_tokens,
            trimmed_tokens,
            evicted_count,
            evicted_tokens,
        }
    }

    fn message_tokens(&self, message: &Message) -> usize {
        self.counter
            .count_chat_tokens(std::slice::from_ref(message))
            .total
    }
}

/// First 100 chars of each evicted message, in original order.
fn build_summary(evicted: &[&Message]) -> String {
    let mut ordered = evicted.to_vec();
    ordered.reverse();
    let parts: Vec<String> = ordered
        .iter()
        .map(|m| {
            let truncated: String = m.content.chars().take(100).collect();
            format!("[{:?}] {truncated}", m.role)
        })
        .collect();
    format!("previous conversation summary: {}", parts.join(" | "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use crate::pricing::Provider;

    fn fitter() -> ContextFitter {
        ContextFitter::new(TokenCounter::new(Provider::OpenAi))
    }

    #[test]
    fn pinned_messages_always_survive() {
        let messages = vec![
            Message::system("be helpful"),
            Message::user("msg1"),
            Message::user("msg2"),
            Message::user("the latest question").pin(),
        ];
        let config = ContextConfig {
            max_context_tokens: 20,
            reserve_for_output: 5,
            summarize_evicted: false,
        };
        let result = fitter().fit(&messages, &config);
        assert!(result
            .messages
            .iter()
            .any(|m| m.role == Role::System && m.content == "be helpful"));
        assert!(result.messages.iter().any(|m| m.content == "the latest question"));
    }

    #[test]
    fn trimming_reports_savings_when_over_budget() {
        let messages: Vec<Message> = (0..6)
            .map(|i| Message::user(format!("message number {i} with some extra padding text")))
            .collect();
        let config = ContextConfig {
            max_context_tokens: 50,
            reserve_for_output: 20,
            summarize_evicted: true,
        };
        let result = fitter().fit(&messages, &config);
        assert!(result.original_tokens > result.trimmed_tokens);
        assert!(result.saved_tokens() > 0);
        assert!(result.evicted_count > 0);
    }

    #[test]
    fn output_order_is_pinned_then_kept_in_original_order() {
        let messages = vec![
            Message::system("sys"),
            Message::user("a"),
            Message::user("b"),
            Message::user("c"),
        ];
        let config = ContextConfig {
            max_context_tokens: 1_000,
            reserve_for_output: 0,
            summarize_evicted: false,
        };
        let result = fitter().fit(&messages, &config);
        let contents: Vec<&str> = result.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["sys", "a", "b", "c"]);
    }
}


