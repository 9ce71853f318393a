//! Circuit breaker: global spending ceilings across
//! session/hour/day rolling windows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::events::{EventBus, EventName};
use crate::persistence::{prefixes, PersistenceBackend};

/// Which window a breaker block/warning refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Session,
    Hour,
    Day,
}

/// Block semantics once a window's spend reaches its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerAction {
    /// Never blocks; only emits warnings.
    Warn,
    /// Blocks in the accounting sense but `allowed=true`, `reason="Throttled"`.
    Throttle,
    /// Blocks hard.
    Stop,
}

/// `breaker: {limits: {...}, action, persist}` configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub per_session: Option<f64>,
    pub per_hour: Option<f64>,
    pub per_day: Option<f64>,
    pub action: BreakerAction,
    /// Fire-and-forget snapshot persistence; ignored unless the crate's
    /// `persistence` feature is enabled.
    pub persist: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            per_session: None,
            per_hour: None,
            per_day: None,
            action: BreakerAction::Stop,
            persist: false,
        }
    }
}

/// Admission decision from the breaker.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerDecision {
    Allowed,
    /// `allowed=true` (throttle) or hard block (stop); `reason` always set
    /// when the window would otherwise trip.
    Blocked {
        reason: String,
        window: WindowKind,
        allowed: bool,
    },
}

/// Current spend, limit, and trip status per window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub session_spend: f64,
    pub hour_spend: f64,
    pub day_spend: f64,
    pub session_limit: Option<f64>,
    pub hour_limit: Option<f64>,
    pub day_limit: Option<f64>,
    pub tripped: bool,
}

struct Inner {
    cost_log: Vec<(DateTime<Utc>, f64)>,
    warned_thresholds: std::collections::HashSet<WindowKind>,
}

/// Three rolling-window cost accumulators (session infinite, hour 3600s, day
/// 86400s) with configurable limits and block semantics.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<Inner>,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    events: Option<Arc<EventBus>>,
}

fn percent_used(spend: f64, limit: Option<f64>) -> f64 {
    match limit {
        None => 0.0,
        Some(limit) if limit <= 0.0 => 999.0,
        Some(limit) => (spend / limit) * 100.0,
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(Inner {
                cost_log: Vec::new(),
                warned_thresholds: std::collections::HashSet::new(),
            }),
            persistence: None,
            events: None,
        }
    }

    /// Wires a backend the breaker fire-and-forget persists `cost_log` to
    /// after every [`Self::record_spend`].
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

    async fn persist_best_effort(&self, cost_log: &[(DateTime<Utc>, f64)]) {
        let Some(backend) = &self.persistence else {
            return;
        };
        let Ok(payload) = serde_json::to_vec(cost_log) else {
            return;
        };
        if let Err(e) = backend.save(prefixes::BREAKER, payload).await {
            tracing::warn!(error = %e, "breaker persistence failed");
            if let Some(events) = &self.events {
                events
                    .emit(
                        EventName::StorageError,
                        serde_json::json!({
                            "module": "breaker",
                            "operation": "record",
                            "error": e.to_string(),
                        }),
                    )
                    .await;
            }
        }
    }

    /// Loads a previously persisted `cost_log` snapshot, if the configured
    /// backend has one.
    pub async fn hydrate_from_persistence(&self) {
        let Some(backend) = &self.persistence else {
            return;
        };
        let loaded = match backend.load(prefixes::BREAKER).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "breaker hydration failed");
                if let Some(events) = &self.events {
                    events
                        .emit(
                            EventName::StorageError,
                            serde_json::json!({
                                "module": "breaker",
                                "operation": "hydrate",
                                "error": e.to_string(),
                            }),
                        )
                        .await;
                }
                return;
            }
        };
        if let Ok(cost_log) = serde_json::from_slice::<Vec<(DateTime<Utc>, f64)>>(&loaded) {
            self.state.lock().await.cost_log = cost_log;
        }
    }

    fn window_spend(cost_log: &[(DateTime<Utc>, f64)], now: DateTime<Utc>, window: WindowKind) -> f64 {
        match window {
            WindowKind::Session => cost_log.iter().map(|(_, c)| c).sum(),
            WindowKind::Hour => cost_log
                .iter()
                .filter(|(t, _)| (now - *t).num_seconds() < 3_600)
                .map(|(_, c)| c)
                .sum(),
            WindowKind::Day => cost_log
                .iter()
                .filter(|(t, _)| (now - *t).num_seconds() < 86_400)
                .map(|(_, c)| c)
                .sum(),
        }
    }

    fn limit_of(&self, window: WindowKind) -> Option<f64> {
        match window {
            WindowKind::Session => self.config.per_session,
            WindowKind::Hour => self.config.per_hour,
            WindowKind::Day => self.config.per_day,
        }
    }

    /// Checks every window; blocked iff any current spend + estimate reaches
    /// its limit. Fires warnings (idempotent per threshold crossing)
    /// when projected spend crosses 80% of a limit.
    pub async fn check(&self, estimated_input: f64, estimated_output: f64) -> BreakerDecision {
        let projected = estimated_input + estimated_output;
        let now = Utc::now();
        let mut inner = self.state.lock().await;

        for window in [WindowKind::Session, WindowKind::Hour, WindowKind::Day] {
            let Some(limit) = self.limit_of(window) else {
                continue;
            };
            let spend = Self::window_spend(&inner.cost_log, now, window);
            let projected_spend = spend + projected;

            if limit <= 0.0 || projected_spend >= limit {
                let reason = format!(
                    "Circuit breaker: {window:?} spend {spend:.4} + projected {projected:.4} >= limit {limit:.4}"
                );
                return match self.config.action {
                    BreakerAction::Warn => BreakerDecision::Allowed,
                    BreakerAction::Throttle => BreakerDecision::Blocked {
                        reason: "Throttled".to_string(),
                        window,
                        allowed: true,
                    },
                    BreakerAction::Stop => BreakerDecision::Blocked {
                        reason,
                        window,
                        allowed: false,
                    },
                };
            }

            if projected_spend >= 0.8 * limit && !inner.warned_thresholds.contains(&window) {
                inner.warned_thresholds.insert(window);
            }
        }

        BreakerDecision::Allowed
    }

    /// Returns `Some(window)` for each window that just crossed the 80%
    /// warning threshold on the most recent [`Self::check`] call, so the
    /// orchestrator can emit `breaker:warning` exactly once per crossing.
    pub async fn drain_warnings(&self) -> Vec<WindowKind> {
        let mut inner = self.state.lock().await;
        inner.warned_thresholds.drain().collect()
    }

    /// Appends `(now, cost)` after the API call.
    pub async fn record_spend(&self, cost: f64) {
        let now = Utc::now();
        let snapshot = {
            let mut inner = self.state.lock().await;
            inner.cost_log.push((now, cost));
            inner.cost_log.clone()
        };
        if self.config.persist {
            self.persist_best_effort(&snapshot).await;
        }
    }

    pub async fn status(&self) -> BreakerStatus {
        let now = Utc::now();
        let inner = self.state.lock().await;
        let session_spend = Self::window_spend(&inner.cost_log, now, WindowKind::Session);
        let hour_spend = Self::window_spend(&inner.cost_log, now, WindowKind::Hour);
        let day_spend = Self::window_spend(&inner.cost_log, now, WindowKind::Day);
        let tripped = [
            (session_spend, self.config.per_session),
            (hour_spend, self.config.per_hour),
            (day_spend, self.config.per_day),
        ]
        .iter()
        .any(|(spend, limit)| match limit {
            Some(limit) => *spend >= *limit,
            None => false,
        });
        BreakerStatus {
            session_spend,
            hour_spend,
            day_spend,
            session_limit: self.config.per_session,
            hour_limit: self.config.per_hour,
            day_limit: self.config.per_day,
            tripped,
        }
    }

    pub fn percent_used(status: &BreakerStatus, window: WindowKind) -> f64 {
        match window {
            WindowKind::Session => percent_used(status.session_spend, status.session_limit),
            WindowKind::Hour => percent_used(status.hour_spend, status.hour_limit),
            WindowKind::Day => percent_used(status.day_spend, status.day_limit),
        }
    }

    /// Clears all state.
    pub async fn reset(&self) {
        let mut inner = self.state.lock().await;
        inner.cost_log.clear();
        inner.warned_thresholds.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_limit_trips_after_spend_recorded() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            per_session: Some(0.002),
            action: BreakerAction::Stop,
            ..Default::default()
        });
        // Call 1: prompt costs (5000/1e6)*0.15 + (5000/1e6)*0.60 = 0.00375 > 0.002
        let decision = breaker.check(0.00375, 0.0).await;
        assert!(matches!(decision, BreakerDecision::Blocked { allowed: false, .. }));
    }

    #[tokio::test]
    async fn check_blocks_iff_status_reports_tripped() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            per_hour: Some(1.0),
            action: BreakerAction::Stop,
            ..Default::default()
        });
        breaker.record_spend(0.5).await;
        let decision = breaker.check(0.6, 0.0).await;
        let status = breaker.status().await;
        assert!(matches!(decision, BreakerDecision::Blocked { .. }));
        assert!(status.tripped);
    }

    #[tokio::test]
    async fn zero_limit_blocks_everything_with_percent_999() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            per_hour: Some(0.0),
            action: BreakerAction::Stop,
            ..Default::default()
        });
        let decision = breaker.check(0.0001, 0.0).await;
        assert!(matches!(decision, BreakerDecision::Blocked { .. }));
        let status = breaker.status().await;
        assert_eq!(CircuitBreaker::percent_used(&status, WindowKind::Hour), 999.0);
    }

    #[tokio::test]
    async fn throttle_action_allows_but_flags_throttled() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            per_hour: Some(0.001),
            action: BreakerAction::Throttle,
            ..Default::default()
        });
        let decision = breaker.check(0.01, 0.0).await;
        match decision {
            BreakerDecision::Blocked { allowed, reason, .. } => {
                assert!(allowed);
                assert_eq!(reason, "Throttled");
            }
            BreakerDecision::Allowed => panic!("expected throttled block"),
        }
    }

    #[tokio::test]
    async fn reset_clears_spend() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            per_hour: Some(1.0),
            ..Default::default()
        });
        breaker.record_spend(0.9).await;
        breaker.reset().await;
        let status = breaker.status().await;
        assert_eq!(status.hour_spend, 0.0);
        assert!(!status.tripped);
    }
}


