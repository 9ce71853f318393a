//! Cost ledger: append-only, seq-numbered spend+savings record
//! with optional SHA-256 hash chaining, reusing the `sha2::Sha256` dependency
//! already pulled in for cache-key hashing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::events::{EventBus, EventName};
use crate::persistence::{prefixes, PersistenceBackend};

/// Breakdown of where a request's dollar savings came from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Savings {
    pub cache: f64,
    pub context: f64,
    pub router: f64,
    pub prefix: f64,
}

impl Savings {
    pub fn total(&self) -> f64 {
        self.cache + self.context + self.router + self.prefix
    }
}

/// A single immutable, monotonically sequenced ledger record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cost: f64,
    pub savings: Savings,
    pub feature: Option<String>,
    pub latency_ms: Option<u64>,
    pub prev_hash: Option<String>,
    pub hash: Option<String>,
}

/// Fields supplied by the caller when recording a new entry; `seq`,
/// `timestamp`, and hash-chain fields are assigned by the ledger.
#[derive(Debug, Clone, Default)]
pub struct NewLedgerEntry {
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cost: f64,
    pub savings: Savings,
    pub feature: Option<String>,
    pub latency_ms: Option<u64>,
}

/// Aggregate summary across all recorded entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub total_spent: f64,
    pub total_saved: f64,
    pub by_feature: HashMap<String, f64>,
    pub cache_hits: u64,
    pub entry_count: u64,
}

/// Result of [`CostLedger::verify_integrity`].
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityReport {
    pub valid: bool,
    pub first_bad_seq: Option<u64>,
}

fn chain_hash(entry: &LedgerEntry, prev_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry.seq.to_le_bytes());
    hasher.update(entry.timestamp.timestamp_millis().to_le_bytes());
    hasher.update(entry.model.as_bytes());
    hasher.update(entry.input_tokens.to_le_bytes());
    hasher.update(entry.output_tokens.to_le_bytes());
    hasher.update(entry.cost.to_le_bytes());
    hasher.update(prev_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct Inner {
    entries: Vec<LedgerEntry>,
    last_seq: u64,
}

/// `ledger: {persist, feature}` configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub hash_chaining: bool,
    pub default_feature: Option<String>,
    /// Fire-and-forget snapshot persistence; ignored unless the crate's
    /// `persistence` feature is enabled.
    pub persist: bool,
}

/// Append-only cost ledger. Hash chaining is a separate, explicit opt-in
/// rather than always-on overhead.
pub struct CostLedger {
    config: LedgerConfig,
    state: Mutex<Inner>,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    events: Option<Arc<EventBus>>,
}

impl CostLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(Inner {
                entries: Vec::new(),
                last_seq: 0,
            }),
            persistence: None,
            events: None,
        }
    }

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

    /// Assigns `seq = last + 1`, timestamps, appends, and (if persistence is
    /// configured) fire-and-forgets a snapshot write.
    pub async fn record(&self, new_entry: NewLedgerEntry) -> LedgerEntry {
        let mut inner = self.state.lock().await;
        let seq = inner.last_seq + 1;
        let prev_hash = if self.config.hash_chaining {
            Some(
                inner
                    .entries
                    .last()
                    .and_then(|e| e.hash.clone())
                    .unwrap_or_else(|| "genesis".to_string()),
            )
        } else {
            None
        };

        let mut entry = LedgerEntry {
            seq,
            timestamp: Utc::now(),
            model: new_entry.model,
            input_tokens: new_entry.input_tokens,
            output_tokens: new_entry.output_tokens,
            cost: new_entry.cost,
            savings: new_entry.savings,
            feature: new_entry.feature.or_else(|| self.config.default_feature.clone()),
            latency_ms: new_entry.latency_ms,
            prev_hash: prev_hash.clone(),
            hash: None,
        };
        if let Some(prev) = &prev_hash {
            entry.hash = Some(chain_hash(&entry, prev));
        }

        inner.last_seq = seq;
        inner.entries.push(entry.clone());
        drop(inner);

        self.persist_best_effort().await;
        entry
    }

    /// Records a zero-cost entry whose `savings.cache` reflects the cost that
    /// would have been spent absent the cache hit.
    pub async fn record_cache_hit(
        &self,
        model: impl Into<String>,
        saved_cost: f64,
    ) -> LedgerEntry {
        self.record(NewLedgerEntry {
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            savings: Savings {
                cache: saved_cost,
                ..Default::default()
            },
            feature: None,
            latency_ms: None,
        })
        .await
    }

    pub async fn summary(&self) -> LedgerSummary {
        let inner = self.state.lock().await;
        let mut summary = LedgerSummary::default();
        for entry in &inner.entries {
            summary.total_spent += entry.cost;
            summary.total_saved += entry.savings.total();
            summary.entry_count += 1;
            if entry.savings.cache > 0.0 {
                summary.cache_hits += 1;
            }
            if let Some(feature) = &entry.feature {
                *summary.by_feature.entry(feature.clone()).or_insert(0.0) += entry.cost;
            }
        }
        summary
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().await.entries.clone()
    }

    pub async fn last_seq(&self) -> u64 {
        self.state.lock().await.last_seq
    }

    /// Restores `seq` to the max stored value on hydration from persistence.
    pub async fn hydrate(&self, entries: Vec<LedgerEntry>) {
        let mut inner = self.state.lock().await;
        inner.last_seq = entries.iter().map(|e| e.seq).max().unwrap_or(0);
        inner.entries = entries;
    }

    /// Loads a previously persisted snapshot, if the configured backend has
    /// one, and [`Self::hydrate`]s from it.
    pub async fn hydrate_from_persistence(&self) {
        let Some(backend) = &self.persistence else {
            return;
        };
        let loaded = match backend.load(prefixes::LEDGER).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "ledger hydration failed");
                if let Some(events) = &self.events {
                    events
                        .emit(
                            EventName::StorageError,
                            serde_json::json!({
                                "module": "ledger",
                                "operation": "hydrate",
                                "error": e.to_string(),
                            }),
                        )
                        .await;
                }
                return;
            }
        };
        if let Ok(entries) = serde_json::from_slice::<Vec<LedgerEntry>>(&loaded) {
            self.hydrate(entries).await;
        }
    }

    /// Walks the hash chain, if enabled, and reports the first broken link.
    pub async fn verify_integrity(&self) -> IntegrityReport {
        if !self.config.hash_chaining {
            return IntegrityReport {
                valid: true,
                first_bad_seq: None,
            };
        }
        let inner = self.state.lock().await;
        let mut prev = "genesis".to_string();
        for entry in &inner.entries {
            let expected = chain_hash(entry, &prev);
            if entry.hash.as_deref() != Some(expected.as_str()) {
                return IntegrityReport {
                    valid: false,
                    first_bad_seq: Some(entry.seq),
                };
            }
            prev = expected;
        }
        IntegrityReport {
            valid: true,
            first_bad_seq: None,
        }
    }

    async fn persist_best_effort(&self) {
        let Some(backend) = &self.persistence else {
            return;
        };
        let entries = self.state.lock().await.entries.clone();
        let Ok(payload) = serde_json::to_vec(&entries) else {
            return;
        };
        if let Err(e) = backend.save(prefixes::LEDGER, payload).await {
            tracing::warn!(error = %e, "ledger persistence failed");
            if let Some(events) = &self.events {
                events
                    .emit(
                        EventName::StorageError,
                        serde_json::json!({
                            "module": "ledger",
                            "operation": "record",
                            "error": e.to_string(),
                        }),
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cost: f64) -> NewLedgerEntry {
        NewLedgerEntry {
            model: "gpt-4o-mini".to_string(),
            input_tokens: 100,
            output_tokens: 50,
            cost,
            savings: Savings::default(),
            feature: None,
            latency_ms: Some(120),
        }
    }

    #[tokio::test]
    async fn seq_is_strictly_increasing_and_gap_free() {
        let ledger = CostLedger::new(LedgerConfig::default());
        let e1 = ledger.record(entry(0.01)).await;
        let e2 = ledger.record(entry(0.02)).await;
        let e3 = ledger.record(entry(0.03)).await;
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
        assert_eq!(e3.seq, 3);
    }

    #[tokio::test]
    async fn cache_hit_entry_is_zero_cost_with_savings() {
        let ledger = CostLedger::new(LedgerConfig::default());
        let e = ledger.record_cache_hit("gpt-4o-mini", 0.05).await;
        assert_eq!(e.cost, 0.0);
        assert_eq!(e.savings.cache, 0.05);
    }

    #[tokio::test]
    async fn summary_aggregates_spend_and_savings() {
        let ledger = CostLedger::new(LedgerConfig::default());
        ledger.record(entry(0.01)).await;
        ledger.record_cache_hit("gpt-4o-mini", 0.02).await;
        let summary = ledger.summary().await;
        assert_eq!(summary.total_spent, 0.01);
        assert!((summary.total_saved - 0.02).abs() < 1e-9);
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(summary.entry_count, 2);
    }

    #[tokio::test]
    async fn hash_chain_verifies_when_untampered() {
        let ledger = CostLedger::new(LedgerConfig {
            hash_chaining: true,
            default_feature: None,
            persist: false,
        });
        ledger.record(entry(0.01)).await;
        ledger.record(entry(0.02)).await;
        let report = ledger.verify_integrity().await;
        assert!(report.valid);
    }

    #[tokio::test]
    async fn hash_chain_detects_tampering() {
        let ledger = CostLedger::new(LedgerConfig {
            hash_chaining: true,
            default_feature: None,
            persist: false,
        });
        ledger.record(entry(0.01)).await;
        ledger.record(entry(0.02)).await;
        {
            let mut inner = ledger.state.lock().await;
            inner.entries[0].cost = 99.0;
        }
        let report = ledger.verify_integrity().await;
        assert!(!report.valid);
        assert_eq!(report.first_bad_seq, Some(1));
    }

    #[tokio::test]
    async fn hydrate_restores_seq_to_max_stored() {
        let ledger = CostLedger::new(LedgerConfig::default());
        let existing = vec![
            LedgerEntry {
                seq: 5,
                timestamp: Utc::now(),
                model: "gpt-4o-mini".to_string(),
                input_tokens: 1,
                output_tokens: 1,
                cost: 0.01,
                savings: Savings::default(),
                feature: None,
                latency_ms: None,
                prev_hash: None,
                hash: None,
            },
        ];
        ledger.hydrate(existing).await;
        assert_eq!(ledger.last_seq().await, 5);
        let next = ledger.record(entry(0.01)).await;
        assert_eq!(next.seq, 6);
    }
}


