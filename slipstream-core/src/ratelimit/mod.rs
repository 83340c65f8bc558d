//! Per-client request rate limiting.

pub mod limiter;
pub mod reaper;

pub use limiter::RateLimiter;
pub use reaper::BucketReaper;
