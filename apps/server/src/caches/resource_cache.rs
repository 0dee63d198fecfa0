//! Cache of client-submitted resources.
//!
//! Clients doing repeated validation submit their CodeSystems, ValueSets,
//! supplements and ConceptMaps once under a `cache-id` and reference them in
//! later requests. Entries merge by (resourceType, url, version): re-adding a
//! canonical replaces the previous copy rather than duplicating it.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct CacheSpace {
    resources: Vec<JsonValue>,
    last_used: Instant,
}

/// Concurrent map of cache-id to submitted resources.
///
/// Reads share the outer lock; mutations serialize per cache-id on the inner
/// lock, so two clients with different ids never contend.
#[derive(Debug, Default)]
pub struct ResourceCache {
    spaces: RwLock<HashMap<String, Arc<Mutex<CacheSpace>>>>,
}

fn identity(resource: &JsonValue) -> (String, String, String) {
    let get = |key: &str| {
        resource
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    (get("resourceType"), get("url"), get("version"))
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn space(&self, cache_id: &str) -> Arc<Mutex<CacheSpace>> {
        if let Some(space) = self.spaces.read().expect("resource cache poisoned").get(cache_id) {
            return space.clone();
        }
        let mut spaces = self.spaces.write().expect("resource cache poisoned");
        spaces
            .entry(cache_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CacheSpace {
                    resources: Vec::new(),
                    last_used: Instant::now(),
                }))
            })
            .clone()
    }

    /// Merge resources into a cache space, replacing same-identity entries.
    pub fn add(&self, cache_id: &str, resources: Vec<JsonValue>) {
        let space = self.space(cache_id);
        let mut space = space.lock().expect("cache space poisoned");
        space.last_used = Instant::now();
        for resource in resources {
            let id = identity(&resource);
            if let Some(existing) = space.resources.iter_mut().find(|r| identity(r) == id) {
                *existing = resource;
            } else {
                space.resources.push(resource);
            }
        }
    }

    /// Replace a cache space wholesale.
    pub fn set(&self, cache_id: &str, resources: Vec<JsonValue>) {
        let space = self.space(cache_id);
        let mut space = space.lock().expect("cache space poisoned");
        space.last_used = Instant::now();
        space.resources = resources;
    }

    /// All resources in a cache space, refreshing its last-used stamp.
    pub fn get(&self, cache_id: &str) -> Vec<JsonValue> {
        let spaces = self.spaces.read().expect("resource cache poisoned");
        let Some(space) = spaces.get(cache_id) else {
            return Vec::new();
        };
        let mut space = space.lock().expect("cache space poisoned");
        space.last_used = Instant::now();
        space.resources.clone()
    }

    /// Drop spaces idle for longer than `max_age`.
    pub fn prune(&self, max_age: Duration) {
        let mut spaces = self.spaces.write().expect("resource cache poisoned");
        spaces.retain(|_, space| {
            space
                .lock()
                .map(|space| space.last_used.elapsed() <= max_age)
                .unwrap_or(false)
        });
    }

    pub fn len(&self) -> usize {
        self.spaces.read().expect("resource cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cs(url: &str, version: &str, name: &str) -> JsonValue {
        json!({
            "resourceType": "CodeSystem",
            "url": url,
            "version": version,
            "name": name,
            "status": "active",
            "content": "complete"
        })
    }

    #[test]
    fn add_merges_by_type_url_version() {
        let cache = ResourceCache::new();
        cache.add("client-1", vec![cs("http://example.org/cs", "1.0", "First")]);
        cache.add(
            "client-1",
            vec![
                cs("http://example.org/cs", "1.0", "Replaced"),
                cs("http://example.org/cs", "2.0", "Second"),
            ],
        );

        let resources = cache.get("client-1");
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0]["name"], "Replaced");
    }

    #[test]
    fn set_replaces_the_space() {
        let cache = ResourceCache::new();
        cache.add("client-1", vec![cs("http://example.org/a", "1", "A")]);
        cache.set("client-1", vec![cs("http://example.org/b", "1", "B")]);

        let resources = cache.get("client-1");
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0]["url"], "http://example.org/b");
    }

    #[test]
    fn cache_ids_are_isolated() {
        let cache = ResourceCache::new();
        cache.add("client-1", vec![cs("http://example.org/a", "1", "A")]);
        assert!(cache.get("client-2").is_empty());
    }

    #[test]
    fn prune_drops_idle_spaces() {
        let cache = ResourceCache::new();
        cache.add("client-1", vec![cs("http://example.org/a", "1", "A")]);
        cache.prune(Duration::from_secs(0));
        assert!(cache.is_empty());
    }
}
