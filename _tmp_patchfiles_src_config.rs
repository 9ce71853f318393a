//! Pipeline configuration: a nested, `serde`-deserializable
//! record enumerating recognized options, loadable from TOML.
//!
//! Every nested struct carries its own `#[serde(default)]` so a partially
//! specified document is valid at any nesting depth.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::breaker::BreakerConfig;
use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::fitter::ContextConfig;
use crate::guard::GuardConfig;
use crate::ledger::LedgerConfig;
use crate::prefix::PrefixConfig;
use crate::router::RouterConfig;
use crate::user_budget::UserBudgetConfig;

/// Per-component on/off toggles. All default `true`
/// except `router`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    pub guard: bool,
    pub cache: bool,
    pub context: bool,
    pub router: bool,
    pub prefix: bool,
    pub ledger: bool,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            guard: true,
            cache: true,
            context: true,
            router: false,
            prefix: true,
            ledger: true,
        }
    }
}

/// Event bus options. Per-instance delivery is always on; forwarding to the
/// process-wide bus is opt-in since instances otherwise share no state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub global_forwarding: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            global_forwarding: false,
        }
    }
}

/// Where the shared SQLite snapshot store lives. Only consulted when the
/// crate's `persistence` feature is enabled and at least one component's
/// `persist` flag is set; an absent path falls back to an in-memory
/// database, which loses its snapshots on process exit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub path: Option<String>,
}

/// Top-level configuration for a `TokenShield` instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub modules: ModulesConfig,
    pub guard: GuardConfig,
    pub cache: CacheConfig,
    pub context: ContextConfig,
    pub router: RouterConfig,
    pub prefix: PrefixConfig,
    pub ledger: LedgerConfig,
    pub breaker: BreakerConfig,
    pub user_budget: UserBudgetConfig,
    pub events: EventsConfig,
    pub persistence: PersistenceConfig,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("reading {:?}: {e}", path.as_ref())))?;
        Self::from_toml_str(&contents)
    }
}
