//! Shared application state.

use crate::caches::{ExpansionCache, ResourceCache};
use crate::config::Config;
use crate::providers::ProviderRegistry;
use argentum_models::{CodeSystem, ConceptMap, ValueSet};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// In-memory store of FHIR resources loaded at startup.
///
/// Backs the read endpoints and canonical resolution of ValueSets,
/// CodeSystem resources and ConceptMaps. Read-only after startup.
#[derive(Default)]
pub struct ResourceStore {
    by_id: HashMap<(String, String), JsonValue>,
    resources: Vec<JsonValue>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.json` file in a directory.
    pub fn load_dir(&mut self, dir: &std::path::Path) -> anyhow::Result<usize> {
        let mut loaded = 0;
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        entries.sort();
        for path in entries {
            let text = std::fs::read_to_string(&path)?;
            let resource: JsonValue = serde_json::from_str(&text)?;
            self.insert(resource);
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn insert(&mut self, resource: JsonValue) {
        let resource_type = resource
            .get("resourceType")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if let Some(id) = resource.get("id").and_then(|v| v.as_str()) {
            self.by_id
                .insert((resource_type.clone(), id.to_string()), resource.clone());
        }
        self.resources.push(resource);
    }

    pub fn get(&self, resource_type: &str, id: &str) -> Option<&JsonValue> {
        self.by_id
            .get(&(resource_type.to_string(), id.to_string()))
    }

    fn of_type<'a>(&'a self, resource_type: &str) -> impl Iterator<Item = &'a JsonValue> + 'a {
        let resource_type = resource_type.to_string();
        self.resources.iter().filter(move |r| {
            r.get("resourceType").and_then(|v| v.as_str()) == Some(resource_type.as_str())
        })
    }

    pub fn valuesets(&self) -> HashMap<String, ValueSet> {
        let mut map = HashMap::new();
        for resource in self.of_type("ValueSet") {
            if let Ok(valueset) = serde_json::from_value::<ValueSet>(resource.clone()) {
                if let Some(url) = &valueset.url {
                    map.insert(url.clone(), valueset);
                }
            }
        }
        map
    }

    pub fn code_systems(&self) -> Vec<CodeSystem> {
        self.of_type("CodeSystem")
            .filter_map(|r| serde_json::from_value(r.clone()).ok())
            .collect()
    }

    pub fn concept_maps(&self) -> Vec<ConceptMap> {
        self.of_type("ConceptMap")
            .filter_map(|r| serde_json::from_value(r.clone()).ok())
            .collect()
    }
}

/// Application state shared across requests.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Statically registered providers (SQL stores, UCUM, BCP-47, HGVS)
    pub registry: ProviderRegistry,
    pub store: Arc<ResourceStore>,
    pub resource_cache: Arc<ResourceCache>,
    pub expansion_cache: Arc<ExpansionCache>,
}

impl AppState {
    pub fn new(config: Config, registry: ProviderRegistry, store: ResourceStore) -> Self {
        let expansion_cache = ExpansionCache::new(
            config.operations.expansion_cache_size,
            Duration::from_millis(config.operations.min_cache_time_ms),
            config.operations.memory_pressure_entries,
        );
        Self {
            config: Arc::new(config),
            registry,
            store: Arc::new(store),
            resource_cache: Arc::new(ResourceCache::new()),
            expansion_cache: Arc::new(expansion_cache),
        }
    }
}
