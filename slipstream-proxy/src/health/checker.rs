//! Background probe loop that flips backend liveness.
//!
//! Every tick each backend is probed concurrently with `GET {url}{endpoint}`.
//! A backend is marked down after `failure_threshold` consecutive failures
//! and, once down, is re-probed no more often than `recovery_interval` so a
//! struggling upstream is not hammered at the tick rate. A single passing
//! probe brings it back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Method, StatusCode, Uri};
use http_body_util::Empty;
use hyper::Request;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use slipstream_core::balancer::SwrrBalancer;
use slipstream_core::domain::backend::SharedBackend;

/// Probe bookkeeping for one backend, keyed by URL.
#[derive(Default)]
struct ProbeState {
    failures: u32,
    last_check: Option<Instant>,
    /// Guards against overlapping probes when a backend responds slower
    /// than the tick interval.
    in_flight: bool,
}

struct CheckerShared {
    balancer: Arc<SwrrBalancer>,
    interval: Duration,
    timeout: Duration,
    endpoint: String,
    failure_threshold: u32,
    recovery_interval: Duration,
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    state: Mutex<HashMap<String, ProbeState>>,
}

/// Periodic health prober over the balancer's backend pool.
pub struct HealthChecker {
    shared: Arc<CheckerShared>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(
        balancer: Arc<SwrrBalancer>,
        interval: Duration,
        timeout: Duration,
        endpoint: String,
        failure_threshold: u32,
        recovery_interval: Duration,
    ) -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            shared: Arc::new(CheckerShared {
                balancer,
                interval,
                timeout,
                endpoint,
                failure_threshold,
                recovery_interval,
                client,
                state: Mutex::new(HashMap::new()),
            }),
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the probe loop. It runs until `cancel` fires or [`stop`] is
    /// called; starting twice is a no-op.
    ///
    /// [`stop`]: HealthChecker::stop
    pub fn start(&self, cancel: CancellationToken) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let token = self.token.clone();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.interval);
            // The first tick completes immediately; skip it so probing
            // starts one full interval after startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => check_all(&shared),
                }
            }
        }));
    }

    /// Signal the probe loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Consecutive probe failures recorded for a backend URL.
    pub fn failure_count(&self, url: &str) -> u32 {
        self.shared
            .state
            .lock()
            .get(url)
            .map_or(0, |state| state.failures)
    }

    pub(crate) fn balancer(&self) -> &Arc<SwrrBalancer> {
        &self.shared.balancer
    }
}

/// Fan one probe out per backend; a slow backend never delays the others.
fn check_all(shared: &Arc<CheckerShared>) {
    for backend in shared.balancer.backends() {
        let shared = Arc::clone(shared);
        tokio::spawn(probe_backend(shared, backend));
    }
}

async fn probe_backend(shared: Arc<CheckerShared>, backend: SharedBackend) {
    let url = backend.url().to_string();

    {
        let mut state = shared.state.lock();
        let entry = state.entry(url.clone()).or_default();
        if entry.in_flight {
            return;
        }
        // Recovery hysteresis: a backend that is already down is left
        // alone until the recovery interval has passed.
        if !backend.is_healthy() {
            if let Some(last_check) = entry.last_check {
                if last_check.elapsed() < shared.recovery_interval {
                    return;
                }
            }
        }
        entry.in_flight = true;
    }

    let started = Instant::now();
    let outcome = run_probe(&shared, &backend).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let mut state = shared.state.lock();
    let entry = state.entry(url.clone()).or_default();
    entry.in_flight = false;
    entry.last_check = Some(Instant::now());

    match outcome {
        Ok(()) => {
            if entry.failures > 0 {
                entry.failures = 0;
            }
            if !backend.is_healthy() {
                backend.set_healthy(true);
                info!(backend = %url, "backend recovered and marked healthy");
            } else {
                debug!(backend = %url, duration_ms, "backend health check passed");
            }
        }
        Err(reason) => {
            entry.failures += 1;
            warn!(backend = %url, error = %reason, duration_ms, "backend health check failed");
            if entry.failures >= shared.failure_threshold && backend.is_healthy() {
                backend.set_healthy(false);
                error!(backend = %url, failures = entry.failures, "backend marked unhealthy");
            }
        }
    }
}

async fn run_probe(shared: &CheckerShared, backend: &SharedBackend) -> Result<(), String> {
    let target: Uri = format!("{}{}", backend.url(), shared.endpoint)
        .parse()
        .map_err(|e| format!("invalid probe URL: {e}"))?;

    let request = Request::builder()
        .method(Method::GET)
        .uri(target)
        .body(Empty::<Bytes>::new())
        .map_err(|e| format!("failed to build probe request: {e}"))?;

    match tokio::time::timeout(shared.timeout, shared.client.request(request)).await {
        Ok(Ok(response)) if response.status() == StatusCode::OK => Ok(()),
        Ok(Ok(response)) => Err(format!("unexpected status {}", response.status())),
        Ok(Err(err)) => Err(format!("request failed: {err}")),
        Err(_) => Err("probe timed out".to_string()),
    }
}
