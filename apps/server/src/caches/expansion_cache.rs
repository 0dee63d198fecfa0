//! Content-addressed cache of computed ValueSet expansions.
//!
//! Keys hash the ValueSet definition, the expansion-relevant parameters and
//! the additional resources in scope, so a hit is exactly a fresh expansion
//! of the same inputs. Only expansions that took real work (wall-clock above
//! the configured minimum) are stored; trivial ones are cheaper to recompute
//! than to cache.

use crate::metrics::EXPANSION_CACHE_EVENTS;
use crate::models::Parameters;
use lru::LruCache;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

/// Parameters that select resources rather than shaping the expansion; they
/// are excluded from the cache key.
const NON_SEMANTIC_PARAMS: &[&str] = &["tx-resource", "valueSet", "cache-id"];

/// Compute the content hash for an expansion request.
pub fn expansion_cache_key(
    valueset: &JsonValue,
    parameters: &Parameters,
    additional_resources: &[JsonValue],
) -> String {
    let mut hasher = Sha256::new();

    hasher.update(valueset.to_string().as_bytes());

    for parameter in parameters.all_parameters() {
        if NON_SEMANTIC_PARAMS.contains(&parameter.name.as_str()) {
            continue;
        }
        hasher.update(parameter.name.as_bytes());
        if let Ok(encoded) = serde_json::to_string(&parameter.value) {
            hasher.update(encoded.as_bytes());
        }
    }

    // order-independent digest of the additional resources
    let mut resource_hashes: Vec<String> = additional_resources
        .iter()
        .map(|resource| {
            let mut h = Sha256::new();
            h.update(resource.to_string().as_bytes());
            format!("{:x}", h.finalize())
        })
        .collect();
    resource_hashes.sort();
    for hash in resource_hashes {
        hasher.update(hash.as_bytes());
    }

    format!("{:x}", hasher.finalize())
}

/// LRU cache of expanded ValueSets.
pub struct ExpansionCache {
    entries: Mutex<LruCache<String, JsonValue>>,
    min_cache_time: Duration,
    memory_pressure_entries: usize,
}

impl ExpansionCache {
    pub fn new(capacity: usize, min_cache_time: Duration, memory_pressure_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            min_cache_time,
            memory_pressure_entries,
        }
    }

    pub fn get(&self, key: &str) -> Option<JsonValue> {
        let mut entries = self.entries.lock().expect("expansion cache poisoned");
        let hit = entries.get(key).cloned();
        EXPANSION_CACHE_EVENTS
            .with_label_values(&[if hit.is_some() { "hit" } else { "miss" }])
            .inc();
        hit
    }

    /// Store an expansion that took `duration` to compute. Fast expansions
    /// are skipped; returns whether the entry was stored.
    pub fn store(&self, key: String, expansion: JsonValue, duration: Duration) -> bool {
        if duration < self.min_cache_time {
            return false;
        }
        let mut entries = self.entries.lock().expect("expansion cache poisoned");
        entries.put(key, expansion);
        if entries.len() > self.memory_pressure_entries {
            Self::shed(&mut entries);
        }
        true
    }

    /// Memory-pressure response: drop the least-recently-used half.
    pub fn shed_oldest_half(&self) {
        let mut entries = self.entries.lock().expect("expansion cache poisoned");
        Self::shed(&mut entries);
    }

    fn shed(entries: &mut LruCache<String, JsonValue>) {
        let target = entries.len() / 2;
        while entries.len() > target {
            if entries.pop_lru().is_none() {
                break;
            }
            EXPANSION_CACHE_EVENTS.with_label_values(&["eviction"]).inc();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("expansion cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
