//! Response cache: exact + fuzzy lookup with LRU/TTL eviction
//! and optional fire-and-forget persistence.

mod entry;
mod minhash;

pub use entry::{CacheEntry, CacheLookup, CacheStats, MatchType};
pub use minhash::{MinHashConfig, MinHashSignature, MinHasher};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use crate::error::Result;
use crate::events::{EventBus, EventName};
use crate::persistence::{prefixes, PersistenceBackend};

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl_ms: i64,
    pub similarity_threshold: f64,
    pub minhash: MinHashConfig,
    /// Fire-and-forget snapshot persistence; ignored unless the crate's
    /// `persistence` feature is enabled.
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            ttl_ms: 3_600_000,
            similarity_threshold: 0.85,
            minhash: MinHashConfig::default(),
            persist: false,
        }
    }
}

/// Normalize the last-user-text for the exact fingerprint: trim + lowercase.
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Exact fingerprint: normalized last-user-text + model id.
pub fn exact_fingerprint(last_user_text: &str, model: &str) -> String {
    format!("{}::{}", normalize(last_user_text), model)
}

struct Slot {
    entry: CacheEntry,
    signature: MinHashSignature,
}

/// Exact + fuzzy response cache.
///
/// Eviction is LRU by access time; on overflow the single
/// least-recently-accessed slot is swap-removed and only its band-bucket rows
/// are rebuilt, rather than rebuilding every bucket on every insert.
pub struct ResponseCache {
    config: CacheConfig,
    hasher: MinHasher,
    slots: RwLock<Vec<Slot>>,
    /// exact fingerprint -> slot index
    exact_index: RwLock<HashMap<String, usize>>,
    /// (band index, band key) -> candidate slot indices
    band_index: RwLock<HashMap<(usize, Vec<u64>), Vec<usize>>>,
    stats: RwLock<CacheStats>,
    /// Serializes structural mutation (insert/update/evict) across `slots`,
    /// `exact_index`, and `band_index` together, so two concurrent `store()`
    /// calls for the same fingerprint can't both observe "absent" and race
    /// into two live slots.
    struct_lock: Mutex<()>,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    events: Option<Arc<EventBus>>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        let hasher = MinHasher::new(config.minhash)?;
        Ok(Self {
            config,
            hasher,
            slots: RwLock::new(Vec::new()),
            exact_index: RwLock::new(HashMap::new()),
            band_index: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            struct_lock: Mutex::new(()),
            persistence: None,
            events: None,
        })
    }

    pub fn with_persistence(mut self, backend: Arc<dyn PersistenceBackend>) -> Self {
        self.persistence = Some(backend);
        self
    }

    /// Wires the event bus `storage:error` is reported through on a failed
    /// fire-and-forget persistence write. Optional: a cache with no bus
    /// attached just logs via `tracing::warn!` instead.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Loads a previously persisted snapshot, if the configured backend has
    /// one, rebuilding the exact and band-bucket indexes from scratch.
    /// Unknown fields on the stored payload are ignored by `serde`'s default
    /// behavior; missing fields fall back to their `Default` impls.
    pub async fn hydrate_from_persistence(&self) {
        let Some(backend) = &self.persistence else {
            return;
        };
        let loaded = match backend.load(prefixes::CACHE).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "cache hydration failed");
                self.emit_storage_error("hydrate", &e.to_string()).await;
                return;
            }
        };
        let Ok(entries) = serde_json::from_slice::<Vec<CacheEntry>>(&loaded) else {
            return;
        };
        let mut slots = self.slots.write().await;
        let mut exact_index = self.exact_index.write().await;
        let mut band_index = self.band_index.write().await;
        slots.clear();
        exact_index.clear();
        band_index.clear();
        for entry in entries {
            let signature = self.hasher.signature(&entry.prompt);
            let idx = slots.len();
            exact_index.insert(entry.fingerprint.clone(), idx);
            for (band_idx, band) in self.hasher.bands(&signature).into_iter().enumerate() {
                band_index.entry((band_idx, band.to_vec())).or_default().push(idx);
            }
            slots.push(Slot { entry, signature });
        }
        drop(band_index);
        drop(exact_index);
        drop(slots);
        self.stats.write().await.entry_count = self.slots.read().await.len();
    }

    /// Effective similarity threshold; short prompts (<10 chars) require a
    /// tighter match.
    fn effective_threshold(&self, prompt: &str) -> f64 {
        if prompt.trim().chars().count() < 10 {
            (self.config.similarity_threshold + 0.05).min(1.0)
        } else {
            self.config.similarity_threshold
        }
    }

    /// Two-stage lookup: exact hash, then fuzzy MinHash/LSH probe.
    #[instrument(skip(self, last_user_text))]
    pub async fn lookup(&self, last_user_text: &str, model: &str) -> CacheLookup {
        let now = Utc::now();
        let fp = exact_fingerprint(last_user_text, model);

        if let Some(&idx) = self.exact_index.read().await.get(&fp) {
            if let Some(lookup) = self.try_hit(idx, MatchType::Exact, 1.0, now).await {
                return lookup;
            }
        }

        let signature = self.hasher.signature(last_user_text);
        let threshold = self.effective_threshold(last_user_text);
        let candidates = self.fuzzy_candidates(&signature, model).await;

        let mut best: Option<(usize, f64)> = None;
        for idx in candidates {
            let slots = self.slots.read().await;
            let Some(slot) = slots.get(idx) else { continue };
            if slot.entry.model != model {
                continue;
            }
            let sim = MinHasher::estimate_similarity(&signature, &slot.signature);
            drop(slots);
            if sim >= threshold && best.map(|(_, b)| sim > b).unwrap_or(true) {
                best = Some((idx, sim));
            }
        }

        if let Some((idx, sim)) = best {
            if let Some(lookup) = self.try_hit(idx, MatchType::Fuzzy, sim, now).await {
                return lookup;
            }
        }

        self.stats.write().await.record_miss();
        CacheLookup::Miss
    }

    async fn fuzzy_candidates(&self, signature: &MinHashSignature, model: &str) -> Vec<usize> {
        let _ = model;
        let bands = self.hasher.bands(signature);
        let index = self.band_index.read().await;
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for (band_idx, band) in bands.iter().enumerate() {
            if let Some(ids) = index.get(&(band_idx, band.to_vec())) {
                for &id in ids {
                    if seen.insert(id) {
                        out.push(id);
                    }
                }
            }
        }
        out
    }

    async fn try_hit(
        &self,
        idx: usize,
        match_type: MatchType,
        similarity: f64,
        now: chrono::DateTime<Utc>,
    ) -> Option<CacheLookup> {
        let mut slots = self.slots.write().await;
        let slot = slots.get_mut(idx)?;
        if slot.entry.is_expired(now) {
            drop(slots);
            let _guard = self.struct_lock.lock().await;
            self.remove_at(idx).await;
            return None;
        }
        slot.entry.record_hit(now);
        let entry = slot.entry.clone();
        drop(slots);
        let mut stats = self.stats.write().await;
        stats.record_hit(entry.input_tokens as u64 + entry.output_tokens as u64, 0.0);
        Some(CacheLookup::Hit {
            entry,
            match_type,
            similarity,
        })
    }

    /// Insert a new entry, evicting the least-recently-accessed slot first if
    /// at capacity.
    #[instrument(skip(self, prompt, response))]
    pub async fn store(
        &self,
        prompt: &str,
        response: &str,
        model: &str,
        input_tokens: usize,
        output_tokens: usize,
    ) {
        let fp = exact_fingerprint(prompt, model);
        let signature = self.hasher.signature(prompt);
        let entry = CacheEntry::new(
            fp.clone(),
            model,
            prompt,
            response,
            input_tokens,
            output_tokens,
            self.config.ttl_ms,
        );

        // Serialize the whole check-then-(update|insert) decision: without
        // this, two concurrent store() calls for the same key could both
        // see "absent" and both append, recreating the duplicate-slot bug
        // this path exists to prevent.
        let _guard = self.struct_lock.lock().await;

        // A live slot for this exact (prompt, model) already exists: update
        // it in place rather than pushing a duplicate, so it stays
        // reachable under exactly one index instead of leaking a second,
        // independently-hit-counted slot into the fuzzy bands.
        let existing = self.exact_index.read().await.get(&fp).copied();
        if let Some(idx) = existing {
            let old_signature = self.slots.read().await.get(idx).map(|s| s.signature.clone());

            let mut band_index = self.band_index.write().await;
            // Only the previous signature's own band rows can contain
            // `idx`: drop it from exactly those instead of scanning every
            // bucket in the index.
            if let Some(old_signature) = &old_signature {
                for (band_idx, band) in self.hasher.bands(old_signature).into_iter().enumerate() {
                    if let Some(bucket) = band_index.get_mut(&(band_idx, band.to_vec())) {
                        bucket.retain(|&i| i != idx);
                        if bucket.is_empty() {
                            band_index.remove(&(band_idx, band.to_vec()));
                        }
                    }
                }
            }
            for (band_idx, band) in self.hasher.bands(&signature).into_iter().enumerate() {
                band_index
                    .entry((band_idx, band.to_vec()))
                    .or_default()
                    .push(idx);
            }
            drop(band_index);

            let mut slots = self.slots.write().await;
            if let Some(slot) = slots.get_mut(idx) {
                slot.entry = entry;
                slot.signature = signature;
            }
            drop(slots);

            self.persist_best_effort().await;
            return;
        }

        {
            let len = self.slots.read().await.len();
            if len >= self.config.max_entries {
                if let Some(victim) = self.least_recently_accessed().await {
                    self.remove_at(victim).await;
                }
            }
        }

        let mut slots = self.slots.write().await;
        let idx = slots.len();
        slots.push(Slot { entry, signature: signature.clone() });
        drop(slots);

        self.exact_index.write().await.insert(fp, idx);
        let mut band_index = self.band_index.write().await;
        for (band_idx, band) in self.hasher.bands(&signature).into_iter().enumerate() {
            band_index
                .entry((band_idx, band.to_vec()))
                .or_default()
                .push(idx);
        }
        drop(band_index);

        self.stats.write().await.entry_count = self.slots.read().await.len();
        self.persist_best_effort().await;
    }

    async fn least_recently_accessed(&self) -> Option<usize> {
        let slots = self.slots.read().await;
        slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.entry.last_accessed)
            .map(|(i, _)| i)
    }

    /// Swap-remove the slot at `idx`; only the affected band rows are
    /// rebuilt, never the whole index.
    async fn remove_at(&self, idx: usize) {
        let mut slots = self.slots.write().await;
        if idx >= slots.len() {
            return;
        }
        let removed = slots.swap_remove(idx);
        let moved_idx = if idx < slots.len() { Some(idx) } else { None };
        drop(slots);

        let mut exact_index = self.exact_index.write().await;
        exact_index.remove(&removed.entry.fingerprint);
        if let Some(moved_idx) = moved_idx {
            let slots = self.slots.read().await;
            if let Some(moved) = slots.get(moved_idx) {
                exact_index.insert(moved.entry.fingerprint.clone(), moved_idx);
            }
        }
        drop(exact_index);

        // `last_idx` is the removed slot's original position in the old,
        // pre-removal index space (it equals `idx` itself when nothing was
        // swapped in, i.e. the removed entry was already the last one).
        let last_idx = {
            let slots = self.slots.read().await;
            slots.len()
        };
        let mut band_index = self.band_index.write().await;
        // Purge the removed entry's own stale bucket memberships (recorded
        // under `idx` when it was stored).
        for bucket in band_index.values_mut() {
            bucket.retain(|&i| i != idx);
        }
        // The moved entry's real bucket memberships were recorded under its
        // old position `last_idx`; remap them to its new position `idx` so
        // it stays fuzzy-reachable.
        if let Some(moved_idx) = moved_idx {
            for bucket in band_index.values_mut() {
                for i in bucket.iter_mut() {
                    if *i == last_idx {
                        *i = moved_idx;
                    }
                }
            }
        }
        band_index.retain(|_, v| !v.is_empty());

        self.stats.write().await.entry_count = self.slots.read().await.len();
    }

    async fn persist_best_effort(&self) {
        let Some(backend) = &self.persistence else {
            return;
        };
        let entries: Vec<CacheEntry> = self
            .slots
            .read()
            .await
            .iter()
            .map(|s| s.entry.clone())
            .collect();
        let Ok(payload) = serde_json::to_vec(&entries) else {
            return;
        };
        if let Err(e) = backend.save(prefixes::CACHE, payload).await {
            tracing::warn!(error = %e, "cache persistence failed");
            self.emit_storage_error("store", &e.to_string()).await;
        }
    }

    async fn emit_storage_error(&self, operation: &str, error: &str) {
        if let Some(events) = &self.events {
            events
                .emit(
                    EventName::StorageError,
                    serde_json::json!({
                        "module": "cache",
                        "operation": operation,
                        "error": error,
                    }),
                )
                .await;
        }
    }

    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CacheConfig {
        CacheConfig {
            max_entries: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn miss_then_store_then_exact_hit() {
        let cache = ResponseCache::new(cfg()).unwrap();
        let prompt = "What is the capital of France?";
        assert!(matches!(
            cache.lookup(prompt, "gpt-4o-mini").await,
            CacheLookup::Miss
        ));
        cache.store(prompt, "Paris", "gpt-4o-mini", 20, 5).await;
        match cache.lookup(prompt, "gpt-4o-mini").await {
            CacheLookup::Hit {
                entry, match_type, ..
            } => {
                assert_eq!(entry.response, "Paris");
                assert_eq!(match_type, MatchType::Exact);
                assert_eq!(entry.hits, 1);
            }
            CacheLookup::Miss => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn fuzzy_hit_on_similar_prompt() {
        let cache = ResponseCache::new(cfg()).unwrap();
        cache
            .store(
                "What is the capital of France?",
                "Paris",
                "gpt-4o-mini",
                20,
                5,
            )
            .await;
        match cache
            .lookup("What is the capital city of France?", "gpt-4o-mini")
            .await
        {
            CacheLookup::Hit { match_type, .. } => assert_eq!(match_type, MatchType::Fuzzy),
            CacheLookup::Miss => panic!("expected fuzzy hit"),
        }
    }

    #[tokio::test]
    async fn duplicate_store_updates_in_place_instead_of_adding_a_second_slot() {
        let cache = ResponseCache::new(cfg()).unwrap();
        let prompt = "What is the capital of France?";
        cache.store(prompt, "Paris", "gpt-4o-mini", 10, 5).await;
        cache
            .store(prompt, "Paris, France", "gpt-4o-mini", 10, 5)
            .await;

        assert_eq!(cache.len().await, 1, "repeated stores of the same key must yield one live slot");
        match cache.lookup(prompt, "gpt-4o-mini").await {
            CacheLookup::Hit { entry, match_type, .. } => {
                assert_eq!(entry.response, "Paris, France");
                assert_eq!(match_type, MatchType::Exact);
            }
            CacheLookup::Miss => panic!("expected hit"),
        }

        // The old slot must not linger in the fuzzy index under a stale id.
        match cache
            .lookup("What is the capital city of France?", "gpt-4o-mini")
            .await
        {
            CacheLookup::Hit { entry, .. } => assert_eq!(entry.response, "Paris, France"),
            CacheLookup::Miss => {}
        }
    }

    #[tokio::test]
    async fn eviction_keeps_entry_count_at_capacity() {
        let cache = ResponseCache::new(cfg()).unwrap();
        for i in 0..5 {
            cache
                .store(&format!("prompt {i}"), "resp", "gpt-4o-mini", 10, 10)
                .await;
        }
        assert_eq!(cache.len().await, 3);
    }

    #[tokio::test]
    async fn moved_entry_stays_fuzzy_reachable_after_swap_remove_eviction() {
        // Capacity 3: fill it, then evict once so the oldest-accessed slot is
        // swap-removed and the last slot is moved into its place. The moved
        // entry's fuzzy reachability must survive the reindex.
        let cache = ResponseCache::new(cfg()).unwrap();
        cache
            .store("What is the capital of France?", "Paris", "gpt-4o-mini", 10, 5)
            .await;
        cache
            .store("What is the capital of Germany?", "Berlin", "gpt-4o-mini", 10, 5)
            .await;
        cache
            .store("What is the capital of Italy?", "Rome", "gpt-4o-mini", 10, 5)
            .await;
        // Over capacity: evicts the least-recently-accessed slot (the first
        // one), swap-removing the last-stored slot into its place.
        cache
            .store("What is the capital of Spain?", "Madrid", "gpt-4o-mini", 10, 5)
            .await;

        match cache
            .lookup("What is the capital city of Italy?", "gpt-4o-mini")
            .await
        {
            CacheLookup::Hit { entry, .. } => assert_eq!(entry.response, "Rome"),
            CacheLookup::Miss => panic!("moved entry should still be fuzzy-reachable"),
        }
    }

    #[tokio::test]
    async fn ttl_expired_entries_are_purged_on_lookup() {
        let mut config = cfg();
        config.ttl_ms = -1;
        let cache = ResponseCache::new(config).unwrap();
        cache.store("hello", "resp", "gpt-4o-mini", 1, 1).await;
        assert!(matches!(
            cache.lookup("hello", "gpt-4o-mini").await,
            CacheLookup::Miss
        ));
        assert_eq!(cache.len().await, 0);
    }
}
