//! User budget manager: per-user daily/monthly caps with
//! in-flight reservation semantics.
//!
//! Window boundaries are recomputed at read time by comparing `Utc::now()`
//! against a stored window-start rather than running a background sweep.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::events::{EventBus, EventName};
use crate::persistence::{prefixes, PersistenceBackend};

/// Per-user daily/monthly limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Budget {
    pub daily: f64,
    pub monthly: f64,
}

/// `userBudget: {...}` configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserBudgetConfig {
    pub default_budget: Option<Budget>,
    pub users: HashMap<String, Budget>,
    /// Optional tier -> model override, applied before the complexity
    /// router runs.
    pub tier_models: HashMap<String, String>,
    /// Fire-and-forget snapshot persistence; ignored unless the crate's
    /// `persistence` feature is enabled.
    pub persist: bool,
}

/// Which of a user's two budget windows a warning/denial refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetWindow {
    Daily,
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserState {
    budget: Budget,
    spent_today: f64,
    spent_this_month: f64,
    inflight: f64,
    day_window_start: DateTime<Utc>,
    month_window_start: DateTime<Utc>,
    tier: Option<String>,
    warned_daily: bool,
    warned_monthly: bool,
}

impl UserState {
    fn new(budget: Budget, now: DateTime<Utc>) -> Self {
        Self {
            budget,
            spent_today: 0.0,
            spent_this_month: 0.0,
            inflight: 0.0,
            day_window_start: now,
            month_window_start: now,
            tier: None,
            warned_daily: false,
            warned_monthly: false,
        }
    }

    fn roll_windows(&mut self, now: DateTime<Utc>) {
        if (now - self.day_window_start).num_hours() >= 24 {
            self.spent_today = 0.0;
            self.day_window_start = now;
            self.warned_daily = false;
        }
        if now.year() != self.month_window_start.year() || now.month() != self.month_window_start.month() {
            self.spent_this_month = 0.0;
            self.month_window_start = now;
            self.warned_monthly = false;
        }
    }

    /// Idempotent per threshold crossing: fires once per window per rollover,
    /// mirroring the circuit breaker's 80%-of-limit warning semantics.
    fn check_warnings(&mut self, projected_daily: f64, projected_monthly: f64) -> Vec<BudgetWindow> {
        let mut fired = Vec::new();
        if !self.warned_daily && self.budget.daily > 0.0 && projected_daily >= 0.8 * self.budget.daily {
            self.warned_daily = true;
            fired.push(BudgetWindow::Daily);
        }
        if !self.warned_monthly && self.budget.monthly > 0.0 && projected_monthly >= 0.8 * self.budget.monthly {
            self.warned_monthly = true;
            fired.push(BudgetWindow::Monthly);
        }
        fired
    }
}

/// Why admission was denied by the user-budget manager.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetDenial {
    DailyLimitExceeded,
    MonthlyLimitExceeded,
}

/// Outcome of admission: either a reservation (with the model the user's
/// tier may have routed to), or a denial.
#[derive(Debug, Clone)]
pub enum AdmissionOutcome {
    Reserved {
        inflight_amount: f64,
        tier_routed_model: Option<String>,
        /// Windows that just crossed the 80%-of-limit warning threshold on
        /// this admission; empty unless a crossing just happened.
        warnings: Vec<BudgetWindow>,
    },
    Denied(BudgetDenial),
}

/// Per-user daily/monthly cap enforcement with in-flight reservation.
///
/// Every admitted request MUST call exactly one of [`Self::settle`] or
/// [`Self::release`] — see [`crate::orchestrator::InFlightReservation`] for
/// the RAII guard that enforces this in Rust.
pub struct UserBudgetManager {
    config: UserBudgetConfig,
    users: Mutex<HashMap<String, UserState>>,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    events: Option<Arc<EventBus>>,
}

impl UserBudgetManager {
    pub fn new(config: UserBudgetConfig) -> Self {
        Self {
            config,
            users: Mutex::new(HashMap::new()),
            persistence: None,
            events: None,
        }
    }

    /// Wires a backend the manager fire-and-forget persists per-user state
    /// to after every [`Self::settle`]/[`Self::release`].
    pub fn with_persistence(mut self, backend: Arc<dyn PersistenceBackend>) -> Self {
        self.persistence = Some(backend);
        self
    }

    /// Wires the event bus `storage:error` is reported through on a failed
    /// fire-and-forget persistence write.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    async fn persist_best_effort(&self, users: &HashMap<String, UserState>) {
        let Some(backend) = &self.persistence else {
            return;
        };
        let Ok(payload) = serde_json::to_vec(users) else {
            return;
        };
        if let Err(e) = backend.save(prefixes::USER_BUDGET, payload).await {
            tracing::warn!(error = %e, "user budget persistence failed");
            if let Some(events) = &self.events {
                events
                    .emit(
                        EventName::StorageError,
                        serde_json::json!({
                            "module": "user_budget",
                            "operation": "settle",
                            "error": e.to_string(),
                        }),
                    )
                    .await;
            }
        }
    }

    /// Loads a previously persisted per-user state snapshot, if the
    /// configured backend has one.
    pub async fn hydrate_from_persistence(&self) {
        let Some(backend) = &self.persistence else {
            return;
        };
        let loaded = match backend.load(prefixes::USER_BUDGET).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "user budget hydration failed");
                if let Some(events) = &self.events {
                    events
                        .emit(
                            EventName::StorageError,
                            serde_json::json!({
                                "module": "user_budget",
                                "operation": "hydrate",
                                "error": e.to_string(),
                            }),
                        )
                        .await;
                }
                return;
            }
        };
        if let Ok(users) = serde_json::from_slice::<HashMap<String, UserState>>(&loaded) {
            *self.users.lock().await = users;
        }
    }

    fn budget_for(&self, user_id: &str) -> Option<Budget> {
        self.config
            .users
            .get(user_id)
            .copied()
            .or(self.config.default_budget)
    }

    /// Reserves `estimated_cost` against both the daily and monthly windows
    /// after checking `spent + inflight + estimatedCost <= limit` for each.
    /// Applies tier-model routing if configured for this user.
    pub async fn admit(&self, user_id: &str, estimated_cost: f64) -> AdmissionOutcome {
        let Some(budget) = self.budget_for(user_id) else {
            // No budget configured for this user: unmanaged, always admit.
            return AdmissionOutcome::Reserved {
                inflight_amount: 0.0,
                tier_routed_model: None,
                warnings: Vec::new(),
            };
        };
        let now = Utc::now();
        let mut users = self.users.lock().await;
        let state = users
            .entry(user_id.to_string())
            .or_insert_with(|| UserState::new(budget, now));
        state.budget = budget;
        state.roll_windows(now);

        if state.spent_today + state.inflight + estimated_cost > state.budget.daily {
            return AdmissionOutcome::Denied(BudgetDenial::DailyLimitExceeded);
        }
        if state.spent_this_month + state.inflight + estimated_cost > state.budget.monthly {
            return AdmissionOutcome::Denied(BudgetDenial::MonthlyLimitExceeded);
        }

        state.inflight += estimated_cost;
        let warnings = state.check_warnings(
            state.spent_today + state.inflight,
            state.spent_this_month + state.inflight,
        );
        let tier_routed_model = state
            .tier
            .as_ref()
            .and_then(|tier| self.config.tier_models.get(tier))
            .cloned();

        AdmissionOutcome::Reserved {
            inflight_amount: estimated_cost,
            tier_routed_model,
            warnings,
        }
    }

    /// Sets the tier for a user (e.g. from an external account-tier lookup);
    /// consulted by [`Self::admit`] for model-tier routing.
    pub async fn set_tier(&self, user_id: &str, tier: impl Into<String>) {
        let now = Utc::now();
        let mut users = self.users.lock().await;
        let budget = self.budget_for(user_id).unwrap_or(Budget {
            daily: f64::INFINITY,
            monthly: f64::INFINITY,
        });
        let state = users
            .entry(user_id.to_string())
            .or_insert_with(|| UserState::new(budget, now));
        state.tier = Some(tier.into());
    }

    /// `spent += actual_cost; inflight -= inflight_amount` (floor 0).
    pub async fn settle(&self, user_id: &str, actual_cost: f64, inflight_amount: f64) {
        let snapshot = {
            let mut users = self.users.lock().await;
            if let Some(state) = users.get_mut(user_id) {
                state.spent_today += actual_cost;
                state.spent_this_month += actual_cost;
                state.inflight = (state.inflight - inflight_amount).max(0.0);
            }
            users.clone()
        };
        if self.config.persist {
            self.persist_best_effort(&snapshot).await;
        }
    }

    /// `inflight -= inflight_amount` (floor 0); used on cache hit, downstream
    /// admission failure, or API error.
    pub async fn release(&self, user_id: &str, inflight_amount: f64) {
        let snapshot = {
            let mut users = self.users.lock().await;
            if let Some(state) = users.get_mut(user_id) {
                state.inflight = (state.inflight - inflight_amount).max(0.0);
            }
            users.clone()
        };
        if self.config.persist {
            self.persist_best_effort(&snapshot).await;
        }
    }

    pub async fn inflight(&self, user_id: &str) -> f64 {
        self.users
            .lock()
            .await
            .get(user_id)
            .map(|s| s.inflight)
            .unwrap_or(0.0)
    }

    pub async fn spent_today(&self, user_id: &str) -> f64 {
        self.users
            .lock()
            .await
            .get(user_id)
            .map(|s| s.spent_today)
            .unwrap_or(0.0)
    }
}
