//! Request guard: debounce, dedup, rate limit, and per-hour
//! cost ceiling admission control.
//!
//! Owned `Vec`/`HashMap` state behind a single mutex, pruned lazily on
//! access, mirroring the rolling-window bookkeeping used elsewhere in the
//! pipeline's budget/breaker components.

use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};

use crate::tokens::TokenCounter;

/// `guard: {...}` configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub debounce_ms: i64,
    pub max_requests_per_minute: usize,
    pub max_cost_per_hour: f64,
    pub deduplicate_window_ms: i64,
    pub deduplicate_in_flight: bool,
    pub min_input_length: usize,
    pub max_input_tokens: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 0,
            max_requests_per_minute: 60,
            max_cost_per_hour: f64::INFINITY,
            deduplicate_window_ms: 5_000,
            deduplicate_in_flight: true,
            min_input_length: 2,
            max_input_tokens: usize::MAX,
        }
    }
}

/// Why a request was blocked at admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    TooShort,
    TooManyTokens,
    Deduped,
    Debounced,
    RateLimited,
    HourlyCostCeiling,
    InFlightDuplicate,
}

impl BlockReason {
    pub fn message(&self) -> &'static str {
        match self {
            BlockReason::TooShort => "Prompt too short",
            BlockReason::TooManyTokens => "Prompt exceeds maxInputTokens",
            BlockReason::Deduped => "Deduped: identical prompt seen recently",
            BlockReason::Debounced => "Debounced: too soon after last request",
            BlockReason::RateLimited => "Rate limited: too many requests per minute",
            BlockReason::HourlyCostCeiling => "Projected hourly spend exceeds maxCostPerHour",
            BlockReason::InFlightDuplicate => "Deduped: identical request already in flight",
        }
    }
}

/// Admission decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Allowed,
    Blocked(BlockReason),
}

/// Read-only guard statistics; `stats()` MUST NOT mutate the cost log.
#[derive(Debug, Clone, Default)]
pub struct GuardStats {
    pub blocked_count: u64,
    pub cumulative_savings: f64,
    pub requests_in_last_minute: usize,
    pub spend_in_last_hour: f64,
}

struct Inner {
    last_request_time: Option<DateTime<Utc>>,
    request_timestamps: Vec<DateTime<Utc>>,
    cost_log: Vec<(DateTime<Utc>, f64)>,
    in_flight: HashMap<String, oneshot::Sender<()>>,
    recent_prompts: HashMap<String, DateTime<Utc>>,
    blocked_count: u64,
    cumulative_savings: f64,
}

/// Admission predicate over prompt/debounce/dedup/rate/cost state.
pub struct RequestGuard {
    config: GuardConfig,
    counter: TokenCounter,
    state: Mutex<Inner>,
}

fn fingerprint(prompt: &str) -> String {
    prompt.trim().to_lowercase()
}

impl RequestGuard {
    pub fn new(config: GuardConfig, counter: TokenCounter) -> Self {
        Self {
            config,
            counter,
            state: Mutex::new(Inner {
                last_request_time: None,
                request_timestamps: Vec::new(),
                cost_log: Vec::new(),
                in_flight: HashMap::new(),
                recent_prompts: HashMap::new(),
                blocked_count: 0,
                cumulative_savings: 0.0,
            }),
        }
    }

    /// Runs the admission checks in order; first failure wins. On admission,
    /// records timestamp/fingerprint/debounce reset.
    pub async fn check(&self, prompt: &str, estimated_cost: f64) -> Admission {
        let now = Utc::now();
        let trimmed_len = prompt.trim().chars().count();
        let mut inner = self.state.lock().await;

        prune(&mut inner, now);

        if trimmed_len < self.config.min_input_length {
            return self.block(&mut inner, BlockReason::TooShort, estimated_cost);
        }
        if self.counter.count_tokens(prompt) > self.config.max_input_tokens {
            return self.block(&mut inner, BlockReason::TooManyTokens, estimated_cost);
        }

        let fp = fingerprint(prompt);
        if let Some(seen_at) = inner.recent_prompts.get(&fp) {
            if (now - *seen_at).num_milliseconds() < self.config.deduplicate_window_ms {
                return self.block(&mut inner, BlockReason::Deduped, estimated_cost);
            }
        }

        if let Some(last) = inner.last_request_time {
            if (now - last).num_milliseconds() < self.config.debounce_ms {
                return self.block(&mut inner, BlockReason::Debounced, estimated_cost);
            }
        }

        if inner.request_timestamps.len() >= self.config.max_requests_per_minute {
            return self.block(&mut inner, BlockReason::RateLimited, estimated_cost);
        }

        let hourly_spend: f64 = inner.cost_log.iter().map(|(_, c)| c).sum();
        if hourly_spend + estimated_cost > self.config.max_cost_per_hour {
            return self.block(&mut inner, BlockReason::HourlyCostCeiling, estimated_cost);
        }

        if self.config.deduplicate_in_flight && inner.in_flight.contains_key(&fp) {
            return self.block(&mut inner, BlockReason::InFlightDuplicate, estimated_cost);
        }

        inner.request_timestamps.push(now);
        inner.recent_prompts.insert(fp, now);
        inner.last_request_time = Some(now);
        inner.blocked_count = 0;
        Admission::Allowed
    }

    fn block(&self, inner: &mut Inner, reason: BlockReason, estimated_cost: f64) -> Admission {
        inner.blocked_count += 1;
        inner.cumulative_savings += estimated_cost;
        Admission::Blocked(reason)
    }

    /// Register an admitted request as in-flight; returns a handle whose
    /// `abort()` signals any debounce-superseded waiter.
    pub async fn begin_in_flight(&self, prompt: &str) -> InFlightHandle {
        let fp = fingerprint(prompt);
        let (tx, rx) = oneshot::channel();
        let mut inner = self.state.lock().await;
        if let Some(old) = inner.in_flight.insert(fp.clone(), tx) {
            let _ = old.send(());
        }
        InFlightHandle { rx: Some(rx) }
    }

    pub async fn end_in_flight(&self, prompt: &str) {
        let fp = fingerprint(prompt);
        self.state.lock().await.in_flight.remove(&fp);
    }

    pub async fn record_spend(&self, cost: f64) {
        let now = Utc::now();
        self.state.lock().await.cost_log.push((now, cost));
    }

    /// Read-only; does not mutate the cost log.
    pub async fn stats(&self) -> GuardStats {
        let now = Utc::now();
        let inner = self.state.lock().await;
        let requests_in_last_minute = inner
            .request_timestamps
            .iter()
            .filter(|t| (now - **t).num_seconds() < 60)
            .count();
        let spend_in_last_hour = inner
            .cost_log
            .iter()
            .filter(|(t, _)| (now - *t).num_seconds() < 3_600)
            .map(|(_, c)| c)
            .sum();
        GuardStats {
            blocked_count: inner.blocked_count,
            cumulative_savings: inner.cumulative_savings,
            requests_in_last_minute,
            spend_in_last_hour,
        }
    }
}

fn prune(inner: &mut Inner, now: DateTime<Utc>) {
    inner
        .request_timestamps
        .retain(|t| (now - *t).num_seconds() < 60);
    inner.cost_log.retain(|(t, _)| (now - *t).num_seconds() < 3_600);
    inner
        .recent_prompts
        .retain(|_, t| (now - *t).num_seconds() < 3_600);
}

/// Abort handle returned by [`RequestGuard::begin_in_flight`]. The superseded
/// waiter's future resolves with `None` rather than hanging.
pub struct InFlightHandle {
    rx: Option<oneshot::Receiver<()>>,
}

impl InFlightHandle {
    /// Awaits supersession; resolves `true` iff a newer identical request
    /// arrived and this one was signaled to abort.
    pub async fn was_superseded(&mut self) -> bool {
        match self.rx.take() {
            Some(rx) => rx.await.is_ok(),
            None => false,
        }
    }
}

/// A generic debounce helper: collapses rapid-fire callers under the same
/// key. A call superseded by a newer one within `wait`
/// resolves `Ok(None)` rather than hanging, and its abort handle is signaled;
/// non-abort errors from `fn_` propagate to the caller of the final,
/// un-superseded call.
pub struct Debouncer {
    pending: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new()
    }
}

impl Debouncer {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Waits `wait`, then runs `fn_`, unless a newer call under the same
    /// `key` arrives first -- in which case this call resolves `Ok(None)`
    /// immediately and never runs `fn_`.
    pub async fn debounce<F, Fut, T>(
        &self,
        key: impl Into<String>,
        wait: std::time::Duration,
        fn_: F,
    ) -> crate::error::Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        let key = key.into();
        let (tx, mut abort_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if let Some(old) = pending.insert(key.clone(), tx) {
                let _ = old.send(());
            }
        }

        tokio::select! {
            _ = &mut abort_rx => Ok(None),
            _ = tokio::time::sleep(wait) => {
                let mut pending = self.pending.lock().await;
                pending.remove(&key);
                drop(pending);
                fn_().await.map(Some)
            }
        }
    }
}
