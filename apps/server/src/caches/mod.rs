//! Shared, content-addressed caches.

pub mod expansion_cache;
pub mod resource_cache;

pub use expansion_cache::{expansion_cache_key, ExpansionCache};
pub use resource_cache::ResourceCache;
