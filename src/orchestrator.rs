//! Pipeline orchestrator: assembles guard, cache, context fitter, router,
//! prefix optimizer, circuit breaker, user budget, and ledger into
//! `transform_params` / `wrap_generate` / `wrap_stream`.
//!
//! Per-request pipeline metadata is a concrete [`RequestContext`] struct
//! threaded explicitly through the stages — no hidden sentinel map.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::Stream;
use futures::StreamExt;
use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use crate::breaker::{BreakerDecision, CircuitBreaker};
use crate::cache::{CacheLookup, MatchType, ResponseCache};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventName};
use crate::fitter::ContextFitter;
use crate::guard::{Admission, InFlightHandle, RequestGuard};
use crate::ledger::{CostLedger, NewLedgerEntry, Savings};
use crate::message::Message;
use crate::prefix::PrefixOptimizer;
use crate::pricing::PricingTable;
use crate::router::ModelRouter;
use crate::stream::{StreamTracker, StreamUsage};
use crate::tokens::TokenCounter;
use crate::user_budget::{AdmissionOutcome, BudgetDenial, BudgetWindow, UserBudgetManager};

/// Parameters for one outbound call: the model id and the conversation so
/// far. This is the payload `transform_params` rewrites in place.
#[derive(Debug, Clone)]
pub struct Params {
    pub model: String,
    pub messages: Vec<Message>,
    pub user_id: Option<String>,
    pub expected_output_tokens: Option<usize>,
}

/// Token usage reported back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Result of `wrap_generate`.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub text: String,
    pub usage: Usage,
    pub finish_reason: String,
    pub cache_hit: bool,
}

/// Payload for the `on_usage` hook: fired once per completed (non-cache-hit)
/// generation, after the ledger entry (if any) is recorded.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cost: f64,
}

/// Payload for the `on_blocked` hook: fired for every admission rejection,
/// regardless of which stage produced it.
#[derive(Debug, Clone)]
pub struct BlockedEvent {
    pub reason: String,
    pub estimated_cost: f64,
}

/// Caller-supplied callback hooks, the `onUsage`/`onBlocked`/
/// `onBudgetExceeded`/`onBudgetWarning` surface of the configuration. Kept
/// separate from [`crate::config::Config`] since closures aren't
/// TOML-deserializable; wired in via [`TokenShield::with_hooks`].
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_usage: Option<Arc<dyn Fn(UsageEvent) + Send + Sync>>,
    pub on_blocked: Option<Arc<dyn Fn(BlockedEvent) + Send + Sync>>,
    pub on_budget_exceeded: Option<Arc<dyn Fn(&str, BudgetDenial) + Send + Sync>>,
    pub on_budget_warning: Option<Arc<dyn Fn(&str, BudgetWindow) + Send + Sync>>,
}

/// The async generator function the caller supplies; TokenShield never makes
/// the HTTP call to a provider itself.
pub type DoGenerate = Box<
    dyn FnOnce(Params) -> Pin<Box<dyn Future<Output = Result<GenerateOutcome>> + Send>> + Send,
>;

/// RAII guard over a user-budget in-flight reservation. Releases on drop
/// unless [`Self::settle`] or [`Self::release`] consumed it first — the
/// Rust-idiomatic strengthening of the "MUST call exactly one of settle or
/// release" contract.
pub struct InFlightReservation {
    manager: Arc<UserBudgetManager>,
    user_id: String,
    amount: f64,
    consumed: bool,
}

impl InFlightReservation {
    fn new(manager: Arc<UserBudgetManager>, user_id: String, amount: f64) -> Self {
        Self {
            manager,
            user_id,
            amount,
            consumed: false,
        }
    }

    pub async fn settle(mut self, actual_cost: f64) {
        self.manager
            .settle(&self.user_id, actual_cost, self.amount)
            .await;
        self.consumed = true;
    }

    pub async fn release(mut self) {
        self.manager.release(&self.user_id, self.amount).await;
        self.consumed = true;
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl Drop for InFlightReservation {
    fn drop(&mut self) {
        if !self.consumed {
            let manager = self.manager.clone();
            let user_id = self.user_id.clone();
            let amount = self.amount;
            tokio::spawn(async move {
                manager.release(&user_id, amount).await;
            });
        }
    }
}

/// RAII wrapper over [`RequestGuard::begin_in_flight`]. Releases the
/// registration on drop unless [`Self::release`] already consumed it,
/// mirroring [`InFlightReservation`]'s settle-or-release contract.
pub struct InFlightRegistration {
    guard: Arc<RequestGuard>,
    prompt: String,
    handle: InFlightHandle,
    released: bool,
}

impl InFlightRegistration {
    /// Resolves `true` iff a newer identical request superseded this one and
    /// it should abort rather than call `doGenerate`.
    pub async fn was_superseded(&mut self) -> bool {
        self.handle.was_superseded().await
    }

    async fn release(mut self) {
        self.guard.end_in_flight(&self.prompt).await;
        self.released = true;
    }
}

impl Drop for InFlightRegistration {
    fn drop(&mut self) {
        if !self.released {
            let guard = self.guard.clone();
            let prompt = self.prompt.clone();
            tokio::spawn(async move {
                guard.end_in_flight(&prompt).await;
            });
        }
    }
}

/// Per-request context threaded through the pre-call stages.
pub struct RequestContext {
    /// Correlates this request's events and trace spans across stages; not
    /// part of any externally-visible fingerprint.
    pub request_id: Uuid,
    pub params: Params,
    pub estimated_cost: f64,
    pub tier_routed: bool,
    pub reservation: Option<InFlightReservation>,
    pub cache_hit: Option<(String, MatchType, f64, usize, usize)>,
    pub in_flight: Option<InFlightRegistration>,
}

/// Health snapshot.
#[derive(Debug, Clone, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub breaker_tripped: Option<bool>,
    pub cache_hit_rate: Option<f64>,
    pub guard_blocked_rate: Option<f64>,
    pub total_spent: Option<f64>,
    pub total_saved: Option<f64>,
}

/// The assembled TokenShield pipeline.
pub struct TokenShield {
    config: Config,
    events: Arc<EventBus>,
    counter: TokenCounter,
    pricing: Arc<PricingTable>,
    cache: Option<Arc<ResponseCache>>,
    fitter: Option<Arc<ContextFitter>>,
    prefix_optimizer: Option<Arc<PrefixOptimizer>>,
    guard: Option<Arc<RequestGuard>>,
    breaker: Arc<CircuitBreaker>,
    user_budget: Arc<UserBudgetManager>,
    ledger: Option<Arc<CostLedger>>,
    router: Option<Arc<ModelRouter>>,
    hooks: Hooks,
}

impl TokenShield {
    pub fn new(config: Config, pricing: PricingTable, counter: TokenCounter) -> Result<Self> {
        let events = Arc::new(if config.events.global_forwarding {
            EventBus::with_global_forwarding()
        } else {
            EventBus::new()
        });

        let persistence_backend = Self::build_persistence_backend(&config)?;

        let cache = if config.modules.cache {
            let mut cache = ResponseCache::new(config.cache.clone())?;
            if config.cache.persist {
                if let Some(backend) = &persistence_backend {
                    cache = cache.with_persistence(backend.clone()).with_events(events.clone());
                }
            }
            Some(cache)
        } else {
            None
        };
        let fitter = if config.modules.context {
            Some(Arc::new(ContextFitter::new(counter.clone())))
        } else {
            None
        };
        let prefix_optimizer = if config.modules.prefix {
            Some(Arc::new(PrefixOptimizer::new(counter.clone())))
        } else {
            None
        };
        let guard = if config.modules.guard {
            Some(Arc::new(RequestGuard::new(
                config.guard.clone(),
                counter.clone(),
            )))
        } else {
            None
        };
        let router = if config.modules.router {
            Some(Arc::new(ModelRouter::new(config.router.clone())))
        } else {
            None
        };
        let ledger = if config.modules.ledger {
            let mut ledger = CostLedger::new(config.ledger.clone());
            if config.ledger.persist {
                if let Some(backend) = &persistence_backend {
                    ledger = ledger.with_persistence(backend.clone()).with_events(events.clone());
                }
            }
            Some(ledger)
        } else {
            None
        };
        let mut breaker = CircuitBreaker::new(config.breaker.clone());
        if config.breaker.persist {
            if let Some(backend) = &persistence_backend {
                breaker = breaker.with_persistence(backend.clone()).with_events(events.clone());
            }
        }
        let mut user_budget = UserBudgetManager::new(config.user_budget.clone());
        if config.user_budget.persist {
            if let Some(backend) = &persistence_backend {
                user_budget = user_budget.with_persistence(backend.clone()).with_events(events.clone());
            }
        }

        Ok(Self {
            breaker: Arc::new(breaker),
            user_budget: Arc::new(user_budget),
            events,
            pricing: Arc::new(pricing),
            counter,
            cache: cache.map(Arc::new),
            fitter,
            prefix_optimizer,
            guard,
            ledger: ledger.map(Arc::new),
            router,
            hooks: Hooks::default(),
            config,
        })
    }

    /// Builds the shared snapshot backend when any component opts into
    /// persistence, or `None` when the crate's `persistence` feature is
    /// disabled or nothing asked for it.
    #[cfg(feature = "persistence")]
    fn build_persistence_backend(
        config: &Config,
    ) -> Result<Option<Arc<dyn crate::persistence::PersistenceBackend>>> {
        let needs_persistence = config.cache.persist
            || config.ledger.persist
            || config.breaker.persist
            || config.user_budget.persist;
        if !needs_persistence {
            return Ok(None);
        }
        let backend: Arc<dyn crate::persistence::PersistenceBackend> = match &config.persistence.path {
            Some(path) => Arc::new(crate::persistence::sqlite::SqlitePersistence::open_sync(path)?),
            None => Arc::new(crate::persistence::sqlite::SqlitePersistence::in_memory()?),
        };
        Ok(Some(backend))
    }

    #[cfg(not(feature = "persistence"))]
    fn build_persistence_backend(
        _config: &Config,
    ) -> Result<Option<Arc<dyn crate::persistence::PersistenceBackend>>> {
        Ok(None)
    }

    /// Restores `cache`/`ledger`/`breaker` snapshots from the persistence
    /// backend attached at construction time, if any. Not called
    /// automatically since [`Self::new`] is synchronous; call this once
    /// after construction, before serving traffic.
    pub async fn hydrate_from_persistence(&self) {
        if let Some(cache) = &self.cache {
            cache.hydrate_from_persistence().await;
        }
        if let Some(ledger) = &self.ledger {
            ledger.hydrate_from_persistence().await;
        }
        self.breaker.hydrate_from_persistence().await;
        self.user_budget.hydrate_from_persistence().await;
    }

    /// Attaches `onUsage`/`onBlocked`/`onBudgetExceeded`/`onBudgetWarning`
    /// callback hooks. Consumes and returns `self`, builder-style.
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    fn last_user_text(messages: &[Message]) -> String {
        messages
            .iter()
            .rev()
            .find(|m| m.role == crate::message::Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    /// Runs the fixed-order pre-call stages: breaker -> userBudget (may
    /// route the model) -> guard -> cacheLookup -> contextTrim -> router
    /// (skipped if tier-routed) -> prefixOptimize.
    ///
    /// Lock acquisition order across components follows breaker < userBudget
    /// < guard < cache < ledger.
    #[instrument(skip(self, params))]
    pub async fn transform_params(&self, mut params: Params) -> Result<(Params, RequestContext)> {
        let request_id = Uuid::new_v4();
        let prompt = Self::last_user_text(&params.messages);
        let expected_output = params.expected_output_tokens.unwrap_or(0);
        let input_tokens_estimate = self.counter.count_chat_tokens(&params.messages).total;
        // Pricing is mandatory at the breaker/user-budget admission point:
        // an unknown model id fails the request rather than silently
        // pricing it at zero.
        let estimated_cost =
            self.pricing
                .estimate_cost(&params.model, input_tokens_estimate, expected_output)?;

        // 1. Breaker.
        let breaker_decision = self
            .breaker
            .check(
                self.pricing
                    .estimate_cost(&params.model, input_tokens_estimate, 0)?,
                self.pricing
                    .estimate_cost(&params.model, 0, expected_output)?,
            )
            .await;
        if let BreakerDecision::Blocked {
            reason,
            allowed,
            window,
        } = &breaker_decision
        {
            self.events
                .emit(
                    EventName::BreakerTripped,
                    json!({ "window": format!("{window:?}"), "allowed": allowed, "reason": reason }),
                )
                .await;
        }
        if let BreakerDecision::Blocked {
            reason,
            allowed: false,
            ..
        } = breaker_decision
        {
            self.emit_blocked(request_id, &reason, estimated_cost).await;
            return Err(Error::blocked(reason, estimated_cost));
        }
        for window in self.breaker.drain_warnings().await {
            self.events
                .emit(
                    EventName::BreakerWarning,
                    json!({ "window": format!("{window:?}") }),
                )
                .await;
        }

        // 2. User budget (may tier-route the model).
        let mut tier_routed = false;
        let mut reservation = None;
        if let Some(user_id) = params.user_id.clone() {
            match self.user_budget.admit(&user_id, estimated_cost).await {
                AdmissionOutcome::Denied(denial) => {
                    let reason = format!("User budget exceeded: {denial:?}");
                    self.events
                        .emit(EventName::UserBudgetExceeded, json!({ "userId": user_id }))
                        .await;
                    if let Some(hook) = &self.hooks.on_budget_exceeded {
                        hook(&user_id, denial);
                    }
                    self.emit_blocked(request_id, &reason, estimated_cost).await;
                    return Err(Error::blocked(reason, estimated_cost));
                }
                AdmissionOutcome::Reserved {
                    inflight_amount,
                    tier_routed_model,
                    warnings,
                } => {
                    if let Some(model) = tier_routed_model {
                        params.model = model;
                        tier_routed = true;
                    }
                    for window in warnings {
                        self.events
                            .emit(
                                EventName::UserBudgetWarning,
                                json!({ "userId": user_id, "window": format!("{window:?}") }),
                            )
                            .await;
                        if let Some(hook) = &self.hooks.on_budget_warning {
                            hook(&user_id, window);
                        }
                    }
                    reservation = Some(InFlightReservation::new(
                        self.user_budget.clone(),
                        user_id,
                        inflight_amount,
                    ));
                }
            }
        }

        // From here on, any early return MUST release the reservation.
        let result = self
            .transform_params_after_budget(request_id, params, prompt, estimated_cost, tier_routed)
            .await;

        match result {
            Ok((params, mut ctx)) => {
                ctx.reservation = reservation;
                Ok((params, ctx))
            }
            Err(e) => {
                if let Some(reservation) = reservation {
                    reservation.release().await;
                }
                Err(e)
            }
        }
    }

    async fn transform_params_after_budget(
        &self,
        request_id: Uuid,
        mut params: Params,
        prompt: String,
        estimated_cost: f64,
        tier_routed: bool,
    ) -> Result<(Params, RequestContext)> {
        // 3. Guard.
        let mut in_flight = None;
        if let Some(guard) = &self.guard {
            match guard.check(&prompt, estimated_cost).await {
                Admission::Blocked(reason) => {
                    let msg = reason.message().to_string();
                    self.emit_blocked(request_id, &msg, estimated_cost).await;
                    return Err(Error::blocked(msg, estimated_cost));
                }
                Admission::Allowed => {}
            }
            if self.config.guard.deduplicate_in_flight {
                in_flight = Some(InFlightRegistration {
                    guard: guard.clone(),
                    prompt: prompt.clone(),
                    handle: guard.begin_in_flight(&prompt).await,
                    released: false,
                });
            }
        }
        self.events
            .emit(
                EventName::RequestAllowed,
                json!({ "requestId": request_id.to_string(), "prompt": prompt, "model": params.model }),
            )
            .await;

        // 4. Cache lookup.
        let mut cache_hit = None;
        if let Some(cache) = &self.cache {
            match cache.lookup(&prompt, &params.model).await {
                CacheLookup::Hit {
                    entry,
                    match_type,
                    similarity,
                } => {
                    self.events
                        .emit(
                            EventName::CacheHit,
                            json!({
                                "matchType": format!("{match_type:?}"),
                                "similarity": similarity,
                                "savedCost": self.pricing.estimate_cost_or_zero(
                                    &params.model, entry.input_tokens, entry.output_tokens),
                            }),
                        )
                        .await;
                    cache_hit = Some((
                        entry.response,
                        match_type,
                        similarity,
                        entry.input_tokens,
                        entry.output_tokens,
                    ));
                }
                CacheLookup::Miss => {
                    self.events
                        .emit(EventName::CacheMiss, json!({ "prompt": prompt }))
                        .await;
                }
            }
        }

        let mut ctx = RequestContext {
            request_id,
            params: params.clone(),
            estimated_cost,
            tier_routed,
            reservation: None,
            cache_hit: cache_hit.clone(),
            in_flight,
        };

        if cache_hit.is_some() {
            // Cache-hit short-circuits the remaining pre-call stages.
            return Ok((params, ctx));
        }

        // 5. Context trim.
        if let Some(fitter) = &self.fitter {
            let fit = fitter.fit(&params.messages, &self.config.context);
            if fit.evicted_count > 0 {
                self.events
                    .emit(
                        EventName::ContextTrimmed,
                        json!({
                            "originalTokens": fit.original_tokens,
                            "trimmedTokens": fit.trimmed_tokens,
                            "savedTokens": fit.saved_tokens(),
                        }),
                    )
                    .await;
            }
            params.messages = fit.messages;
        }

        // 6. Router (skipped if tier-routed).
        if !tier_routed {
            if let Some(router) = &self.router {
                let input_tokens = self.counter.count_chat_tokens(&params.messages).total;
                let decision = router.route(
                    &prompt,
                    &params.model,
                    &self.pricing,
                    input_tokens,
                    params.expected_output_tokens.unwrap_or(0),
                );
                if decision.downgraded {
                    self.events
                        .emit(
                            EventName::RouterDowngraded,
                            json!({
                                "originalModel": params.model,
                                "selectedModel": decision.selected_model,
                                "complexity": decision.complexity,
                                "savedCost": decision.savings,
                            }),
                        )
                        .await;
                    params.model = decision.selected_model;
                }
            }
        }

        // 7. Prefix optimize.
        if let Some(optimizer) = &self.prefix_optimizer {
            let price = self
                .pricing
                .get(&params.model)
                .map(|m| m.input_cost_per_million)
                .unwrap_or(0.0);
            let result = optimizer.optimize(&params.messages, &self.config.prefix, price);
            params.messages = result.messages;
        }

        ctx.params = params.clone();
        Ok((params, ctx))
    }

    async fn emit_blocked(&self, request_id: Uuid, reason: &str, estimated_cost: f64) {
        self.events
            .emit(
                EventName::RequestBlocked,
                json!({
                    "requestId": request_id.to_string(),
                    "reason": reason,
                    "estimatedCost": estimated_cost,
                }),
            )
            .await;
        if let Some(hook) = &self.hooks.on_blocked {
            hook(BlockedEvent {
                reason: reason.to_string(),
                estimated_cost,
            });
        }
    }

    /// Either synthesizes a cache-hit result (without calling `do_generate`)
    /// or calls it, records usage, updates the cache, and returns.
    #[instrument(skip(self, do_generate, ctx))]
    pub async fn wrap_generate(
        &self,
        do_generate: DoGenerate,
        ctx: RequestContext,
    ) -> Result<GenerateOutcome> {
        let RequestContext {
            request_id,
            params,
            cache_hit,
            reservation,
            in_flight,
            ..
        } = ctx;

        if let Some((response, _match_type, _similarity, input_tokens, output_tokens)) = cache_hit
        {
            if let Some(reservation) = reservation {
                reservation.release().await;
            }
            if let Some(in_flight) = in_flight {
                in_flight.release().await;
            }
            if let Some(ledger) = &self.ledger {
                let saved = self
                    .pricing
                    .estimate_cost_or_zero(&params.model, input_tokens, output_tokens);
                ledger.record_cache_hit(params.model.clone(), saved).await;
            }
            return Ok(GenerateOutcome {
                text: response,
                usage: Usage::default(),
                finish_reason: "cache".to_string(),
                cache_hit: true,
            });
        }

        let prompt = Self::last_user_text(&params.messages);
        let model = params.model.clone();
        let started = std::time::Instant::now();

        // A newer identical request may supersede this one while it's
        // in flight; the older call aborts rather than completing the
        // downstream generate call.
        let generated = match in_flight {
            Some(mut in_flight) => {
                let result = tokio::select! {
                    _ = in_flight.was_superseded() => Err(Error::blocked(
                        "Superseded by a newer identical in-flight request",
                        0.0,
                    )),
                    result = do_generate(params) => result,
                };
                in_flight.release().await;
                result
            }
            None => do_generate(params).await,
        };

        let outcome = match generated {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(reservation) = reservation {
                    reservation.release().await;
                }
                return Err(e);
            }
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let actual_cost = self.pricing.estimate_cost_or_zero(
            &model,
            outcome.usage.prompt_tokens,
            outcome.usage.completion_tokens,
        );

        self.breaker.record_spend(actual_cost).await;
        if let Some(guard) = &self.guard {
            guard.record_spend(actual_cost).await;
        }
        if let Some(reservation) = reservation {
            let user_id = reservation.user_id().to_string();
            reservation.settle(actual_cost).await;
            self.events
                .emit(
                    EventName::UserBudgetSpend,
                    json!({ "userId": user_id, "cost": actual_cost }),
                )
                .await;
        }
        if let Some(hook) = &self.hooks.on_usage {
            hook(UsageEvent {
                model: model.clone(),
                input_tokens: outcome.usage.prompt_tokens,
                output_tokens: outcome.usage.completion_tokens,
                cost: actual_cost,
            });
        }
        if let Some(ledger) = &self.ledger {
            ledger
                .record(NewLedgerEntry {
                    model: model.clone(),
                    input_tokens: outcome.usage.prompt_tokens,
                    output_tokens: outcome.usage.completion_tokens,
                    cost: actual_cost,
                    savings: Savings::default(),
                    feature: None,
                    latency_ms: Some(latency_ms),
                })
                .await;
            self.events
                .emit(
                    EventName::LedgerEntry,
                    json!({
                        "requestId": request_id.to_string(),
                        "model": model,
                        "inputTokens": outcome.usage.prompt_tokens,
                        "outputTokens": outcome.usage.completion_tokens,
                        "cost": actual_cost,
                    }),
                )
                .await;
        }
        if let Some(cache) = &self.cache {
            cache
                .store(
                    &prompt,
                    &outcome.text,
                    &model,
                    outcome.usage.prompt_tokens,
                    outcome.usage.completion_tokens,
                )
                .await;
            self.events
                .emit(
                    EventName::CacheStore,
                    json!({ "prompt": prompt, "model": model }),
                )
                .await;
        }

        Ok(outcome)
    }

    /// Wraps an upstream text-delta stream so ledger/breaker/user-budget are
    /// updated exactly once regardless of whether the stream ends in `done`,
    /// `error`, or is `cancel`led mid-read. The returned `AtomicBool` is the
    /// caller's cancel switch: flipping it to
    /// `true` causes the next poll of the returned stream to terminate and
    /// fire the terminal recorder with whatever was counted so far.
    pub fn wrap_stream<S>(
        &self,
        upstream: S,
        ctx: RequestContext,
    ) -> (
        Pin<Box<dyn Stream<Item = Result<String>> + Send>>,
        Arc<AtomicBool>,
    )
    where
        S: Stream<Item = Result<String>> + Send + 'static,
    {
        let recorded = Arc::new(AtomicBool::new(false));
        let cancel_flag = Arc::new(AtomicBool::new(false));

        let request_id = ctx.request_id;
        let model = ctx.params.model.clone();
        let prompt = Self::last_user_text(&ctx.params.messages);
        let breaker = self.breaker.clone();
        let guard = self.guard.clone();
        let ledger = self.ledger.clone();
        let cache = self.cache.clone();
        let pricing = self.pricing.clone();
        let events = self.events.clone();
        let hooks = self.hooks.clone();
        let input_tokens = self.counter.count_chat_tokens(&ctx.params.messages).total;
        let counter = self.counter.clone();
        let reservation = ctx.reservation;
        let in_flight = ctx.in_flight;

        let tracker = Arc::new(tokio::sync::Mutex::new(StreamTracker::new(
            counter,
            input_tokens,
        )));
        let full_text = Arc::new(tokio::sync::Mutex::new(String::new()));
        let reservation_slot = Arc::new(tokio::sync::Mutex::new(Some(reservation)));
        let in_flight_slot = Arc::new(tokio::sync::Mutex::new(Some(in_flight)));

        let record_once = move |usage: StreamUsage, text: String| {
            let breaker = breaker.clone();
            let guard = guard.clone();
            let ledger = ledger.clone();
            let cache = cache.clone();
            let pricing = pricing.clone();
            let events = events.clone();
            let model = model.clone();
            let prompt = prompt.clone();
            let recorded = recorded.clone();
            let reservation_slot = reservation_slot.clone();
            let in_flight_slot = in_flight_slot.clone();
            let request_id = request_id;
            let hooks = hooks.clone();
            async move {
                if recorded.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(in_flight) = in_flight_slot.lock().await.take().flatten() {
                    in_flight.release().await;
                }
                let cost =
                    pricing.estimate_cost_or_zero(&model, usage.input_tokens, usage.output_tokens);
                breaker.record_spend(cost).await;
                if let Some(guard) = &guard {
                    guard.record_spend(cost).await;
                }
                if let Some(reservation) = reservation_slot.lock().await.take().flatten() {
                    let user_id = reservation.user_id().to_string();
                    reservation.settle(cost).await;
                    events
                        .emit(
                            EventName::UserBudgetSpend,
                            json!({ "userId": user_id, "cost": cost }),
                        )
                        .await;
                }
                if let Some(hook) = &hooks.on_usage {
                    hook(UsageEvent {
                        model: model.clone(),
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        cost,
                    });
                }
                if let Some(ledger) = &ledger {
                    ledger
                        .record(NewLedgerEntry {
                            model: model.clone(),
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                            cost,
                            savings: Savings::default(),
                            feature: None,
                            latency_ms: None,
                        })
                        .await;
                    events
                        .emit(
                            EventName::LedgerEntry,
                            json!({
                                "requestId": request_id.to_string(),
                                "model": model,
                                "inputTokens": usage.input_tokens,
                                "outputTokens": usage.output_tokens,
                                "cost": cost,
                            }),
                        )
                        .await;
                }
                if !text.is_empty() {
                    if let Some(cache) = &cache {
                        cache
                            .store(&prompt, &text, &model, usage.input_tokens, usage.output_tokens)
                            .await;
                    }
                }
            }
        };

        let stream = async_stream_wrap(upstream, tracker, full_text, cancel_flag.clone(), record_once);
        (Box::pin(stream), cancel_flag)
    }
}

/// State threaded through [`futures::stream::unfold`] in [`async_stream_wrap`].
/// `None` once the terminal recorder has run, so the unfold stops producing
/// items no matter how many more times it is polled.
struct WrapState<F> {
    upstream: Pin<Box<dyn Stream<Item = Result<String>> + Send>>,
    tracker: Arc<tokio::sync::Mutex<StreamTracker>>,
    full_text: Arc<tokio::sync::Mutex<String>>,
    cancel_flag: Arc<AtomicBool>,
    record_once: Arc<F>,
    done: bool,
}

/// Drives `upstream` to completion (or cancellation), running `record_once`
/// exactly once on whichever of done/error/cancel happens first. Built on [`futures::stream::unfold`] rather than
/// a generator macro, keeping the dependency surface to the existing
/// `futures` crate. `upstream` is pinned once up front, so the
/// per-poll `next()` call never needs the caller's stream type to be `Unpin`.
fn async_stream_wrap<S, F, Fut>(
    upstream: S,
    tracker: Arc<tokio::sync::Mutex<StreamTracker>>,
    full_text: Arc<tokio::sync::Mutex<String>>,
    cancel_flag: Arc<AtomicBool>,
    record_once: F,
) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = Result<String>> + Send + 'static,
    F: Fn(StreamUsage, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let state = WrapState {
        upstream: Box::pin(upstream),
        tracker,
        full_text,
        cancel_flag,
        record_once: Arc::new(record_once),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        if state.cancel_flag.load(Ordering::SeqCst) {
            let usage = state.tracker.lock().await.abort();
            let text = state.full_text.lock().await.clone();
            (state.record_once)(usage, text).await;
            state.done = true;
            return None;
        }

        match state.upstream.next().await {
            Some(Ok(chunk)) => {
                state.tracker.lock().await.add_chunk(&chunk);
                state.full_text.lock().await.push_str(&chunk);
                Some((Ok(chunk), state))
            }
            Some(Err(e)) => {
                let usage = state.tracker.lock().await.abort();
                let text = state.full_text.lock().await.clone();
                (state.record_once)(usage, text).await;
                state.done = true;
                Some((Err(e), state))
            }
            None => {
                let usage = state.tracker.lock().await.finish();
                let text = state.full_text.lock().await.clone();
                (state.record_once)(usage, text).await;
                state.done = true;
                None
            }
        }
    })
}

impl TokenShield {
    /// Per-field semantics: a disabled module reports `null` (here, `None`);
    /// `healthy = !breaker_tripped`.
    pub async fn health_check(&self) -> HealthStatus {
        let breaker_status = self.breaker.status().await;
        let cache_hit_rate = match &self.cache {
            Some(cache) => Some(cache.stats().await.hit_rate()),
            None => None,
        };
        let guard_blocked_rate = match &self.guard {
            Some(guard) => Some(guard.stats().await.blocked_count as f64),
            None => None,
        };
        let (total_spent, total_saved) = match &self.ledger {
            Some(ledger) => {
                let summary = ledger.summary().await;
                (Some(summary.total_spent), Some(summary.total_saved))
            }
            None => (None, None),
        };
        HealthStatus {
            healthy: !breaker_status.tripped,
            breaker_tripped: Some(breaker_status.tripped),
            cache_hit_rate,
            guard_blocked_rate,
            total_spent,
            total_saved,
        }
    }

    /// Idempotent; no persistent handles are held outside the optional
    /// SQLite backend (closed by its own `Drop`), but this hook is kept as
    /// an explicit lifecycle boundary matching the public surface.
    pub fn dispose(&self) {
        tracing::debug!("tokenshield instance disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::pricing::{ModelSpec, Provider};

    fn test_pricing() -> PricingTable {
        PricingTable::new(vec![ModelSpec::new(
            "gpt-4o-mini",
            Provider::OpenAi,
            0.15,
            0.60,
        )])
    }

    fn shield(config: Config) -> TokenShield {
        TokenShield::new(config, test_pricing(), TokenCounter::new(Provider::OpenAi)).unwrap()
    }

    fn params(prompt: &str) -> Params {
        Params {
            model: "gpt-4o-mini".to_string(),
            messages: vec![Message::user(prompt)],
            user_id: None,
            expected_output_tokens: Some(5),
        }
    }

    fn ok_generate(text: &'static str, input: usize, output: usize) -> DoGenerate {
        Box::new(move |_p| {
            Box::pin(async move {
                Ok(GenerateOutcome {
                    text: text.to_string(),
                    usage: Usage {
                        prompt_tokens: input,
                        completion_tokens: output,
                    },
                    finish_reason: "stop".to_string(),
                    cache_hit: false,
                })
            })
        })
    }

    #[tokio::test]
    async fn cache_miss_then_store_then_hit() {
        let mut config = Config::default();
        // Isolated from the guard's dedup window (covered separately by
        // `guard_dedup_blocks_second_identical_call`) so the repeated
        // identical prompt here reaches the cache stage on both calls.
        config.modules.guard = false;
        let shield = shield(config);
        let (_p1, ctx1) = shield
            .transform_params(params("What is the capital of France?"))
            .await
            .unwrap();
        assert!(ctx1.cache_hit.is_none());
        let result1 = shield
            .wrap_generate(ok_generate("Paris", 20, 5), ctx1)
            .await
            .unwrap();
        assert!(!result1.cache_hit);
        assert_eq!(result1.text, "Paris");

        let (_p2, ctx2) = shield
            .transform_params(params("What is the capital of France?"))
            .await
            .unwrap();
        assert!(ctx2.cache_hit.is_some());
        let result2 = shield
            .wrap_generate(
                Box::new(|_p| {
                    Box::pin(async move { panic!("doGenerate must not be called on a cache hit") })
                }),
                ctx2,
            )
            .await
            .unwrap();
        assert!(result2.cache_hit);
        assert_eq!(result2.text, "Paris");
        assert_eq!(result2.usage, Usage::default());
    }

    #[tokio::test]
    async fn guard_dedup_blocks_second_identical_call() {
        let mut config = Config::default();
        config.guard.deduplicate_window_ms = 5_000;
        config.modules.cache = false;
        let shield = shield(config);
        shield
            .transform_params(params("Tell me a joke about cats"))
            .await
            .unwrap();
        let err = shield
            .transform_params(params("Tell me a joke about cats"))
            .await
            .unwrap_err();
        assert!(err.is_blocked());
    }

    #[tokio::test]
    async fn breaker_session_limit_blocks_second_call() {
        let mut config = Config::default();
        config.breaker.per_session = Some(0.002);
        config.modules.cache = false;
        config.modules.guard = false;
        let shield = shield(config);

        let (_p, ctx) = shield
            .transform_params(params("First request"))
            .await
            .unwrap();
        shield
            .wrap_generate(ok_generate("ok", 5_000, 5_000), ctx)
            .await
            .unwrap();

        let err = shield
            .transform_params(params("Second request"))
            .await
            .unwrap_err();
        assert!(err.is_blocked());
    }

    #[tokio::test]
    async fn context_trim_keeps_system_message_under_tight_budget() {
        let mut config = Config::default();
        config.modules.guard = false;
        config.modules.cache = false;
        config.context.max_context_tokens = 50;
        config.context.reserve_for_output = 20;
        let shield = shield(config);

        let mut messages = vec![Message::system("be terse")];
        for i in 0..6 {
            messages.push(Message::user(format!(
                "this is message number {i} with some padding text to use tokens"
            )));
        }
        let p = Params {
            model: "gpt-4o-mini".to_string(),
            messages,
            user_id: None,
            expected_output_tokens: Some(5),
        };
        let (transformed, _ctx) = shield.transform_params(p).await.unwrap();
        assert!(transformed
            .messages
            .iter()
            .any(|m| m.role == crate::message::Role::System));
    }

    #[tokio::test]
    async fn release_on_cache_hit_zeroes_inflight() {
        let mut config = Config::default();
        let mut users = std::collections::HashMap::new();
        users.insert(
            "alice".to_string(),
            crate::user_budget::Budget {
                daily: 10.0,
                monthly: 100.0,
            },
        );
        config.user_budget.users = users;
        config.modules.guard = false;
        let shield = shield(config);

        let mut p = params("cache me please");
        p.user_id = Some("alice".to_string());
        let (_p1, ctx1) = shield.transform_params(p.clone()).await.unwrap();
        shield
            .wrap_generate(ok_generate("cached answer", 10, 5), ctx1)
            .await
            .unwrap();

        let (_p2, ctx2) = shield.transform_params(p).await.unwrap();
        assert!(ctx2.cache_hit.is_some());
        shield
            .wrap_generate(
                Box::new(|_p| Box::pin(async move { panic!("must not call on cache hit") })),
                ctx2,
            )
            .await
            .unwrap();

        assert_eq!(shield.user_budget.inflight("alice").await, 0.0);
        assert_eq!(shield.user_budget.spent_today("alice").await, 0.0);
    }

    #[tokio::test]
    async fn stream_cancel_records_ledger_entry_exactly_once() {
        use futures::stream;

        let shield = shield(Config::default());
        let (_p, ctx) = shield
            .transform_params(params("stream this please"))
            .await
            .unwrap();

        let chunks = stream::iter(vec![
            Ok("Hello ".to_string()),
            Ok("world".to_string()),
            Ok(" this keeps going".to_string()),
        ]);
        let (mut wrapped, cancel) = shield.wrap_stream(chunks, ctx);

        let _ = wrapped.next().await;
        let _ = wrapped.next().await;
        cancel.store(true, Ordering::SeqCst);
        while wrapped.next().await.is_some() {}

        let summary = shield.ledger.as_ref().unwrap().summary().await;
        assert_eq!(summary.entry_count, 1);
    }

    #[tokio::test]
    async fn on_usage_hook_fires_with_actual_cost_after_generate() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let shield = shield(Config::default()).with_hooks(Hooks {
            on_usage: Some(Arc::new(move |event: UsageEvent| {
                seen2.lock().unwrap().push(event);
            })),
            ..Hooks::default()
        });

        let (_p, ctx) = shield.transform_params(params("hook me")).await.unwrap();
        shield
            .wrap_generate(ok_generate("done", 10, 5), ctx)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].input_tokens, 10);
        assert_eq!(seen[0].output_tokens, 5);
    }

    #[tokio::test]
    async fn on_blocked_hook_fires_on_guard_rejection() {
        let blocked = Arc::new(std::sync::Mutex::new(Vec::new()));
        let blocked2 = blocked.clone();
        let mut config = Config::default();
        config.guard.deduplicate_window_ms = 5_000;
        config.modules.cache = false;
        let shield = shield(config).with_hooks(Hooks {
            on_blocked: Some(Arc::new(move |event: BlockedEvent| {
                blocked2.lock().unwrap().push(event);
            })),
            ..Hooks::default()
        });

        shield
            .transform_params(params("duplicate me"))
            .await
            .unwrap();
        let err = shield
            .transform_params(params("duplicate me"))
            .await
            .unwrap_err();
        assert!(err.is_blocked());
        assert_eq!(blocked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn on_budget_exceeded_hook_fires_and_emits_event() {
        let denied = Arc::new(std::sync::Mutex::new(Vec::new()));
        let denied2 = denied.clone();
        let mut config = Config::default();
        let mut users = std::collections::HashMap::new();
        users.insert(
            "dave".to_string(),
            crate::user_budget::Budget {
                daily: 0.000_001,
                monthly: 0.000_001,
            },
        );
        config.user_budget.users = users;
        let shield = shield(config).with_hooks(Hooks {
            on_budget_exceeded: Some(Arc::new(move |user_id: &str, denial| {
                denied2.lock().unwrap().push((user_id.to_string(), denial));
            })),
            ..Hooks::default()
        });

        let mut p = params("over budget");
        p.user_id = Some("dave".to_string());
        let err = shield.transform_params(p).await.unwrap_err();
        assert!(err.is_blocked());
        assert_eq!(denied.lock().unwrap().len(), 1);
        assert_eq!(denied.lock().unwrap()[0].0, "dave");
    }

    #[tokio::test]
    async fn on_budget_warning_hook_fires_past_eighty_percent_threshold() {
        let warned = Arc::new(std::sync::Mutex::new(Vec::new()));
        let warned2 = warned.clone();
        let mut config = Config::default();
        let mut users = std::collections::HashMap::new();
        users.insert(
            "erin".to_string(),
            crate::user_budget::Budget {
                daily: 1.0,
                monthly: 1_000.0,
            },
        );
        config.user_budget.users = users;
        config.modules.cache = false;
        config.modules.guard = false;
        let shield = shield(config).with_hooks(Hooks {
            on_budget_warning: Some(Arc::new(move |user_id: &str, window| {
                warned2.lock().unwrap().push((user_id.to_string(), window));
            })),
            ..Hooks::default()
        });

        let mut p = params("near the limit");
        p.user_id = Some("erin".to_string());
        // A large expected-output estimate pushes the admission reservation
        // itself past 80% of the 1.0 daily budget (0.6/million * 1.5M = 0.9),
        // so the warning fires during transform_params, before any call.
        p.expected_output_tokens = Some(1_500_000);
        let (_p, ctx) = shield.transform_params(p).await.unwrap();
        shield
            .wrap_generate(ok_generate("ok", 10, 5), ctx)
            .await
            .unwrap();

        assert_eq!(warned.lock().unwrap().len(), 1);
        assert_eq!(warned.lock().unwrap()[0].0, "erin");
        assert_eq!(warned.lock().unwrap()[0].1, BudgetWindow::Daily);
    }

    fn slow_generate(text: &'static str, input: usize, output: usize, delay_ms: u64) -> DoGenerate {
        Box::new(move |_p| {
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                Ok(GenerateOutcome {
                    text: text.to_string(),
                    usage: Usage {
                        prompt_tokens: input,
                        completion_tokens: output,
                    },
                    finish_reason: "stop".to_string(),
                    cache_hit: false,
                })
            })
        })
    }

    #[tokio::test]
    async fn superseded_in_flight_request_aborts_and_newer_one_succeeds() {
        let mut config = Config::default();
        config.guard.deduplicate_window_ms = 0;
        config.modules.cache = false;
        let shield = shield(config);

        let (_p1, ctx1) = shield
            .transform_params(params("identical in-flight prompt"))
            .await
            .unwrap();
        let (_p2, ctx2) = shield
            .transform_params(params("identical in-flight prompt"))
            .await
            .unwrap();

        let err = shield
            .wrap_generate(slow_generate("first", 10, 5, 50), ctx1)
            .await
            .unwrap_err();
        assert!(err.is_blocked());

        let result = shield
            .wrap_generate(ok_generate("second", 10, 5), ctx2)
            .await
            .unwrap();
        assert_eq!(result.text, "second");
    }
}
