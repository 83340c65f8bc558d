//! TTL-bounded in-memory response cache.

pub mod entry;
pub mod memory;

pub use entry::CacheEntry;
pub use memory::ResponseCache;

use http::{Method, Uri};

/// Cache key for a request: `"{METHOD}:{URI}"`.
pub fn cache_key(method: &Method, uri: &Uri) -> String {
    format!("{method}:{uri}")
}
