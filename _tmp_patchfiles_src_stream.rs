//! Stream tracker: incremental token counting for streamed
//! responses.

use crate::tokens::TokenCounter;

/// Final token counts reported by [`StreamTracker::finish`] /
/// [`StreamTracker::abort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Accumulates output tokens chunk-by-chunk as a stream is consumed.
///
/// Input tokens are set once, up front, from the pre-call estimate; output
/// tokens grow with each `add_chunk` call via the shared token counter.
pub struct StreamTracker {
    counter: TokenCounter,
    input_tokens: usize,
    output_tokens: usize,
}

impl StreamTracker {
    pub fn new(counter: TokenCounter, input_tokens: usize) -> Self {
        Self {
            counter,
            input_tokens,
            output_tokens: 0,
        }
    }

    /// Accumulates output tokens for one streamed chunk of text.
    pub fn add_chunk(&mut self, text: &str) {
        self.output_tokens += self.counter.count_tokens(text);
    }

    pub fn finish(&self) -> StreamUsage {
        StreamUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }

    /// Same shape as [`Self::finish`]; called on cancellation, to make the
    /// "whatever was counted so far" contract explicit at call sites.
    pub fn abort(&self) -> StreamUsage {
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::Provider;

    #[test]
    fn accumulates_tokens_across_chunks() {
        let mut tracker = StreamTracker::new(TokenCounter::new(Provider::OpenAi), 50);
        tracker.add_chunk("Hello ");
        tracker.add_chunk("world, this is a streamed response.");
        let usage = tracker.finish();
        assert_eq!(usage.input_tokens, 50);
        assert!(usage.output_tokens > 0);
    }

    #[test]
    fn abort_reports_whatever_was_counted_so_far() {
        let mut tracker = StreamTracker::new(TokenCounter::new(Provider::OpenAi), 10);
        tracker.add_chunk("partial");
        let partial = tracker.abort();
        assert!(partial.output_tokens > 0);
        assert_eq!(partial.input_tokens, 10);
    }
}


