//! Cache entry and aggregate statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored response keyed by its exact and fuzzy fingerprints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub model: String,
    pub prompt: String,
    pub response: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub stored_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub ttl_ms: i64,
    pub hits: u64,
}

impl CacheEntry {
    pub fn new(
        fingerprint: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
        response: impl Into<String>,
        input_tokens: usize,
        output_tokens: usize,
        ttl_ms: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            fingerprint: fingerprint.into(),
            model: model.into(),
            prompt: prompt.into(),
            response: response.into(),
            input_tokens,
            output_tokens,
            stored_at: now,
            last_accessed: now,
            ttl_ms,
            hits: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.stored_at).num_milliseconds() >= self.ttl_ms
    }

    pub fn record_hit(&mut self, now: DateTime<Utc>) {
        self.hits += 1;
        self.last_accessed = now;
    }
}

/// How a cache hit was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Fuzzy,
}

/// Result of a cache lookup.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit {
        entry: CacheEntry,
        match_type: MatchType,
        similarity: f64,
    },
    Miss,
}

/// Aggregate hit/miss/savings counters for one cache instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub cached_tokens: u64,
    pub estimated_savings: f64,
    pub entry_count: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self, tokens: u64, savings: f64) {
        self.hits += 1;
        self.cached_tokens += tokens;
        self.estimated_savings += savings;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }
}
