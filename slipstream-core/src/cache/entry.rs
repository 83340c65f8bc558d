//! A single cached response.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::HeaderMap;

/// A cached response body plus its headers, valid until `expires_at`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    body: Bytes,
    headers: HeaderMap,
    created_at: Instant,
    expires_at: Instant,
}

impl CacheEntry {
    pub fn new(body: Bytes, headers: HeaderMap, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            body,
            headers,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub(crate) fn expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_after_ttl() {
        let entry = CacheEntry::new(
            Bytes::from_static(b"value"),
            HeaderMap::new(),
            Duration::from_millis(10),
        );
        assert!(!entry.is_expired());

        std::thread::sleep(Duration::from_millis(20));
        assert!(entry.is_expired());
    }
}
