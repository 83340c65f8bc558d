//! Background reaper for idle rate-limit buckets.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::limiter::RateLimiter;

/// Periodically prunes buckets that have gone quiet.
///
/// `start` spawns the worker; `stop` is idempotent and waits for it to
/// exit before returning.
pub struct BucketReaper {
    limiter: Arc<RateLimiter>,
    interval: Duration,
    idle_timeout: Duration,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BucketReaper {
    pub fn new(limiter: Arc<RateLimiter>, interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            limiter,
            interval,
            idle_timeout,
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the reaper loop. Calling `start` twice is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let limiter = Arc::clone(&self.limiter);
        let token = self.token.clone();
        let interval = self.interval;
        let idle_timeout = self.idle_timeout;

        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it so the initial
            // sweep happens one full interval after startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        let removed = limiter.cleanup_stale(idle_timeout);
                        if removed > 0 {
                            debug!(removed, "pruned idle rate-limit buckets");
                        }
                    }
                }
            }
        }));
    }

    /// Signal the worker and wait for it to exit.
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
