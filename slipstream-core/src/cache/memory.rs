//! In-memory cache store.
//!
//! Reads run concurrently under a shared lock; writes take the exclusive
//! lock, so a completed `set` is visible to every subsequent `get`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::HeaderMap;
use parking_lot::RwLock;

use super::entry::CacheEntry;

/// TTL-bounded `key -> (body, headers)` store.
pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl ResponseCache {
    /// Create an empty cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up a key. Expired entries are treated as misses and left for
    /// [`ResponseCache::cleanup_expired`] to collect.
    pub fn get(&self, key: &str) -> Option<(Bytes, HeaderMap)> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.is_expired() {
            return None;
        }
        Some((entry.body().clone(), entry.headers().clone()))
    }

    /// Insert or overwrite an entry, restarting its TTL.
    pub fn set(&self, key: impl Into<String>, body: Bytes, headers: HeaderMap) {
        let entry = CacheEntry::new(body, headers, self.ttl);
        self.entries.write().insert(key.into(), entry);
    }

    /// Remove a single key.
    pub fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of stored entries, expired ones included.
    pub fn size(&self) -> usize {
        self.entries.read().len()
    }

    /// Remove all expired entries in one pass and report how many went.
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired_at(now));
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn headers_with(name: &'static str, value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, value.parse().unwrap());
        headers
    }

    #[test]
    fn set_and_get_preserves_body_and_headers() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.set(
            "GET:/x",
            Bytes::from_static(b"hello"),
            headers_with("content-type", "application/json"),
        );

        let (body, headers) = cache.get("GET:/x").unwrap();
        assert_eq!(body, Bytes::from_static(b"hello"));
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn missing_key_is_a_miss() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        assert!(cache.get("GET:/nope").is_none());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = ResponseCache::new(Duration::from_millis(10));
        cache.set("GET:/x", Bytes::from_static(b"v"), HeaderMap::new());

        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("GET:/x").is_none());
    }

    #[test]
    fn overwrite_replaces_value_without_growing() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.set("GET:/x", Bytes::from_static(b"one"), HeaderMap::new());
        cache.set("GET:/x", Bytes::from_static(b"two"), HeaderMap::new());

        let (body, _) = cache.get("GET:/x").unwrap();
        assert_eq!(body, Bytes::from_static(b"two"));
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn delete_and_clear() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.set("GET:/a", Bytes::from_static(b"a"), HeaderMap::new());
        cache.set("GET:/b", Bytes::from_static(b"b"), HeaderMap::new());

        cache.delete("GET:/a");
        assert!(cache.get("GET:/a").is_none());
        assert!(cache.get("GET:/b").is_some());

        cache.clear();
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn cleanup_expired_counts_removals() {
        let cache = ResponseCache::new(Duration::from_millis(10));
        cache.set("GET:/a", Bytes::from_static(b"a"), HeaderMap::new());
        cache.set("GET:/b", Bytes::from_static(b"b"), HeaderMap::new());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.cleanup_expired(), 2);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(60)));

        let mut handles = Vec::new();
        for worker in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for round in 0..100 {
                    match (worker + round) % 3 {
                        0 => cache.set("GET:/k", Bytes::from_static(b"v"), HeaderMap::new()),
                        1 => {
                            let _ = cache.get("GET:/k");
                        }
                        _ => {
                            let _ = cache.size();
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Read-your-writes on a single key once the writers are done.
        cache.set("GET:/k", Bytes::from_static(b"final"), HeaderMap::new());
        let (body, _) = cache.get("GET:/k").unwrap();
        assert_eq!(body, Bytes::from_static(b"final"));
    }

    #[test]
    fn multi_value_headers_survive_a_round_trip() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", "a=1".parse().unwrap());
        headers.append("set-cookie", "b=2".parse().unwrap());
        cache.set("GET:/x", Bytes::from_static(b"v"), headers);

        let (_, headers) = cache.get("GET:/x").unwrap();
        let cookies: Vec<_> = headers.get_all("set-cookie").iter().collect();
        assert_eq!(cookies.len(), 2);
    }
}
