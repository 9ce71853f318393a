//! # tokenshield-core
//!
//! A client-side interception layer sitting between application code and an
//! LLM provider SDK. It never makes a network call itself — callers supply
//! the `doGenerate`/`doStream` function — but wraps every call with admission
//! control, prompt optimization, response caching, model routing, and cost
//! accounting.
//!
//! ## Pipeline
//!
//! - **Guard**: debounce, dedup, rate limit, per-hour cost ceiling.
//! - **Cache**: exact + fuzzy (MinHash/LSH) response cache.
//! - **Context fitter**: token-budget-aware message trimming.
//! - **Router**: complexity-scored model tier downgrade.
//! - **Prefix optimizer**: reorder messages for provider prompt-cache affinity.
//! - **Circuit breaker**: session/hour/day rolling-window spend ceilings.
//! - **User budget**: per-user daily/monthly caps with in-flight reservation.
//! - **Ledger**: append-only, hash-chainable cost and savings record.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tokenshield_core::{Config, PricingTable, TokenCounter, Provider, TokenShield};
//!
//! let shield = TokenShield::new(
//!     Config::default(),
//!     PricingTable::default(),
//!     TokenCounter::new(Provider::OpenAi),
//! )?;
//! ```

pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod fitter;
pub mod guard;
pub mod ledger;
pub mod message;
pub mod orchestrator;
pub mod persistence;
pub mod prefix;
pub mod pricing;
pub mod router;
pub mod stream;
pub mod tokens;
pub mod user_budget;

pub use breaker::{BreakerAction, BreakerConfig, BreakerDecision, BreakerStatus, CircuitBreaker, WindowKind};
pub use cache::{CacheConfig, CacheEntry, CacheLookup, CacheStats, MatchType, MinHashConfig, ResponseCache};
pub use config::{Config, EventsConfig, ModulesConfig, PersistenceConfig};
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventName};
pub use fitter::{ContextConfig, ContextFitter, FitResult};
pub use guard::{
    Admission, BlockReason, Debouncer, GuardConfig, GuardStats, InFlightHandle, RequestGuard,
};
pub use ledger::{CostLedger, IntegrityReport, LedgerConfig, LedgerEntry, LedgerSummary, NewLedgerEntry, Savings};
pub use message::{Message, Role};
pub use orchestrator::{
    BlockedEvent, DoGenerate, GenerateOutcome, HealthStatus, Hooks, InFlightReservation, Params,
    RequestContext, TokenShield, Usage, UsageEvent,
};
pub use persistence::{prefixes, PersistenceBackend};
#[cfg(feature = "persistence")]
pub use persistence::SqlitePersistence;
pub use prefix::{CacheBreakpoint, PrefixConfig, PrefixOptimizer, PrefixResult};
pub use pricing::{ModelSpec, PricingTable, Provider};
pub use router::{ModelRouter, ModelTier, RouterConfig, RoutingDecision};
pub use stream::{StreamTracker, StreamUsage};
pub use tokens::{ChatTokenCount, TokenCountAccuracy, TokenCounter};
pub use user_budget::{
    AdmissionOutcome, Budget, BudgetDenial, BudgetWindow, UserBudgetConfig, UserBudgetManager,
};


