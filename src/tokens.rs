//! Token counter: approximate tokenization plus per-message overhead
//! accounting, per provider.

use crate::message::Message;
use crate::pricing::Provider;

/// Declared accuracy of a token count: reports confidence alongside an
/// estimate rather than pretending every backend is bit-exact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenCountAccuracy {
    /// Counted with the provider's real BPE vocabulary.
    Exact,
    /// Estimated; `margin` is the declared worst-case relative error (0.0-1.0).
    Approximate { margin: f64 },
}

impl TokenCountAccuracy {
    pub fn margin(self) -> f64 {
        match self {
            TokenCountAccuracy::Exact => 0.0,
            TokenCountAccuracy::Approximate { margin } => margin,
        }
    }
}

/// Breakdown returned by [`TokenCounter::count_chat_tokens`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatTokenCount {
    pub total: usize,
    pub per_message: usize,
    pub overhead: usize,
    pub accuracy: TokenCountAccuracy,
}

/// Per-provider margin of error for non-exact tokenizers.
fn declared_margin(provider: Provider) -> f64 {
    match provider {
        // `bpe_estimate` is a char/word heuristic, not a real cl100k table;
        // it tracks the true count closely but isn't bit-exact, so it still
        // carries a (small) declared margin rather than claiming `Exact`.
        Provider::OpenAi => 0.05,
        Provider::Anthropic => 0.35,
        Provider::Google => 0.15,
        Provider::OpenSource => 0.15,
        Provider::Other => 0.0,
    }
}

/// Approximate text and chat tokenizer.
///
/// Every provider, OpenAI included, goes through a character/word-based
/// estimate tagged with its declared margin rather than claiming a
/// tokenizer-exact count no backend here actually has.
#[derive(Debug, Clone)]
pub struct TokenCounter {
    provider: Provider,
}

impl TokenCounter {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }

    pub fn accuracy(&self) -> TokenCountAccuracy {
        TokenCountAccuracy::Approximate {
            margin: declared_margin(self.provider),
        }
    }

    /// Count tokens in a single string of text.
    pub fn count_tokens(&self, text: &str) -> usize {
        match self.provider {
            Provider::OpenAi => bpe_estimate(text),
            _ => conservative_estimate(text),
        }
    }

    /// `total = Σ (4 + tokens(role) + tokens(content) + (name?1:0)) + 3`.
    pub fn count_chat_tokens(&self, messages: &[Message]) -> ChatTokenCount {
        let mut per_message = 0usize;
        for m in messages {
            per_message += 4;
            per_message += m.role.token_weight();
            per_message += self.count_tokens(&m.content);
            if m.name.is_some() {
                per_message += 1;
            }
        }
        let overhead = 3;
        ChatTokenCount {
            total: per_message + overhead,
            per_message,
            overhead,
            accuracy: self.accuracy(),
        }
    }
}

/// Byte-pair-encoding-shaped approximation: roughly 4 chars/token for English
/// prose, adjusted down for whitespace-dense text. Not a real cl100k table,
/// but deterministic and close enough for admission-control arithmetic.
fn bpe_estimate(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let chars = text.chars().count();
    let words = text.split_whitespace().count().max(1);
    // Average of char-based and word-based estimates tends to track cl100k
    // within a few percent for mixed natural-language/code prompts.
    let char_based = (chars as f64 / 4.0).ceil() as usize;
    let word_based = (words as f64 * 1.3).ceil() as usize;
    ((char_based + word_based) / 2).max(1)
}

fn conservative_estimate(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() as f64 / 3.5).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn empty_text_counts_zero() {
        let c = TokenCounter::new(Provider::OpenAi);
        assert_eq!(c.count_tokens(""), 0);
    }

    #[test]
    fn non_openai_reports_approximate_with_margin() {
        let c = TokenCounter::new(Provider::Anthropic);
        match c.accuracy() {
            TokenCountAccuracy::Approximate { margin } => assert_eq!(margin, 0.35),
            TokenCountAccuracy::Exact => panic!("anthropic must be approximate"),
        }
    }

    #[test]
    fn openai_also_reports_approximate_since_bpe_estimate_is_a_heuristic() {
        let c = TokenCounter::new(Provider::OpenAi);
        match c.accuracy() {
            TokenCountAccuracy::Approximate { margin } => assert!(margin > 0.0),
            TokenCountAccuracy::Exact => {
                panic!("count_tokens routes OpenAI through a heuristic, not a real BPE table")
            }
        }
    }

    #[test]
    fn chat_tokens_include_per_message_and_global_overhead() {
        let c = TokenCounter::new(Provider::OpenAi);
        let msgs = vec![Message::system("hi"), Message::user("hello there")];
        let count = c.count_chat_tokens(&msgs);
        assert_eq!(count.overhead, 3);
        assert_eq!(count.total, count.per_message + 3);
        assert!(count.total > 0);
    }

    #[test]
    fn named_message_adds_surcharge() {
        let c = TokenCounter::new(Provider::OpenAi);
        let mut named = Message::user("hello");
        named.name = Some("alice".to_string());
        let unnamed = Message::user("hello");
        let with_name = c.count_chat_tokens(std::slice::from_ref(&named));
        let without_name = c.count_chat_tokens(std::slice::from_ref(&unnamed));
        assert_eq!(with_name.total, without_name.total + 1);
    }
}
