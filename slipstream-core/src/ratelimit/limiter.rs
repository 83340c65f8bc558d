//! Token-bucket rate limiter keyed by client IP.
//!
//! Buckets live in a sharded concurrent map, so calls for distinct clients
//! proceed in parallel while two calls for the same client serialize on the
//! entry guard. The entry API also makes first-contact creation race-safe:
//! concurrent requests from a new IP materialize exactly one bucket.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Refill state for a single client.
#[derive(Debug)]
struct ClientBucket {
    tokens: f64,
    refilled_at: Instant,
    last_seen: Instant,
}

impl ClientBucket {
    fn full(burst: u32) -> Self {
        let now = Instant::now();
        Self {
            tokens: f64::from(burst),
            refilled_at: now,
            last_seen: now,
        }
    }
}

/// Per-IP token-bucket limiter.
///
/// Each bucket holds up to `burst` tokens and refills continuously at
/// `requests_per_minute / 60` tokens per second; one token is consumed per
/// admitted request.
pub struct RateLimiter {
    buckets: DashMap<String, ClientBucket>,
    rate: f64,
    burst: u32,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            rate: f64::from(requests_per_minute) / 60.0,
            burst,
        }
    }

    /// Admit or reject one request from `ip`.
    ///
    /// The bucket is advanced to now before the decision, and `last_seen`
    /// is refreshed whether or not the request is admitted.
    pub fn allow(&self, ip: &str) -> bool {
        let mut bucket = self
            .buckets
            .entry(ip.to_string())
            .or_insert_with(|| ClientBucket::full(self.burst));

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(f64::from(self.burst));
        bucket.refilled_at = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop every bucket idle for longer than `idle_timeout` and report how
    /// many were removed.
    pub fn cleanup_stale(&self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            if now.duration_since(bucket.last_seen) > idle_timeout {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Number of live buckets.
    pub fn size(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn burst_is_admitted_then_cut_off() {
        let limiter = RateLimiter::new(1, 10);

        let admitted = (0..10).filter(|_| limiter.allow("192.168.1.1")).count();
        assert_eq!(admitted, 10);

        assert!(!limiter.allow("192.168.1.1"));
    }

    #[test]
    fn admissions_never_exceed_burst_in_a_tight_loop() {
        let limiter = RateLimiter::new(6, 6);

        let admitted = (0..20).filter(|_| limiter.allow("192.168.1.1")).count();
        assert!(admitted <= 6, "admitted {admitted} requests, expected at most 6");
    }

    #[test]
    fn clients_do_not_share_buckets() {
        let limiter = RateLimiter::new(10, 5);

        for _ in 0..5 {
            assert!(limiter.allow("192.168.1.1"));
            assert!(limiter.allow("192.168.1.2"));
        }
        assert!(!limiter.allow("192.168.1.1"));
        assert!(!limiter.allow("192.168.1.2"));
    }

    #[test]
    fn tokens_refill_over_time() {
        // 600 rpm = 10 tokens per second.
        let limiter = RateLimiter::new(600, 1);

        assert!(limiter.allow("192.168.1.1"));
        assert!(!limiter.allow("192.168.1.1"));

        std::thread::sleep(Duration::from_millis(200));
        assert!(limiter.allow("192.168.1.1"));
    }

    #[test]
    fn cleanup_stale_removes_idle_buckets() {
        let limiter = RateLimiter::new(60, 10);
        for i in 1..=5 {
            limiter.allow(&format!("192.168.1.{i}"));
        }
        assert_eq!(limiter.size(), 5);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(limiter.cleanup_stale(Duration::from_millis(50)), 5);
        assert_eq!(limiter.size(), 0);
    }

    #[test]
    fn cleanup_stale_keeps_recent_buckets() {
        let limiter = RateLimiter::new(60, 10);
        limiter.allow("192.168.1.1");

        assert_eq!(limiter.cleanup_stale(Duration::from_secs(60)), 0);
        assert_eq!(limiter.size(), 1);
    }

    #[test]
    fn concurrent_first_contact_creates_one_bucket_per_ip() {
        let limiter = Arc::new(RateLimiter::new(100, 50));
        let ips = ["192.168.1.1", "192.168.1.2", "192.168.1.3"];

        let mut handles = Vec::new();
        for ip in ips {
            for _ in 0..50 {
                let limiter = Arc::clone(&limiter);
                handles.push(std::thread::spawn(move || {
                    let _ = limiter.allow(ip);
                }));
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(limiter.size(), ips.len());
    }

    #[test]
    fn concurrent_same_ip_admissions_respect_burst() {
        let limiter = Arc::new(RateLimiter::new(1, 20));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(std::thread::spawn(move || {
                (0..10).filter(|_| limiter.allow("10.0.0.1")).count()
            }));
        }
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        // 80 near-simultaneous attempts against a 20-token bucket refilling
        // at one token per minute.
        assert!(admitted <= 21, "admitted {admitted} requests, expected at most 21");
    }
}
