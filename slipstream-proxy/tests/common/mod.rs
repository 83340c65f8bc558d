//! Shared helpers for integration tests: scripted upstream backends, a
//! proxy harness and a tiny HTTP client.

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use slipstream_core::config::{
    BackendConfig, CacheConfig, Config, HealthCheckConfig, LoggingConfig, RateLimitConfig,
    ServerConfig, TlsConfig,
};
use slipstream_proxy::server::ProxyServer;

/// A scripted upstream. Answers `/healthz` with a switchable status and
/// every other path with `200` and a fixed body, recording what it saw.
pub struct TestBackend {
    pub url: String,
    hits: Arc<AtomicUsize>,
    health_status: Arc<AtomicU16>,
    pub last_headers: Arc<Mutex<Option<HeaderMap>>>,
    shutdown: CancellationToken,
}

impl TestBackend {
    /// Requests served, health probes excluded.
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn set_health_status(&self, status: u16) {
        self.health_status.store(status, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn start_backend(body: &'static str) -> TestBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let health_status = Arc::new(AtomicU16::new(200));
    let last_headers: Arc<Mutex<Option<HeaderMap>>> = Arc::new(Mutex::new(None));
    let shutdown = CancellationToken::new();

    let accept_token = shutdown.clone();
    let task_hits = Arc::clone(&hits);
    let task_health = Arc::clone(&health_status);
    let task_headers = Arc::clone(&last_headers);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = accept_token.cancelled() => return,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { return };
                    let hits = Arc::clone(&task_hits);
                    let health = Arc::clone(&task_health);
                    let headers_slot = Arc::clone(&task_headers);
                    tokio::spawn(async move {
                        let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                            let hits = Arc::clone(&hits);
                            let health = Arc::clone(&health);
                            let headers_slot = Arc::clone(&headers_slot);
                            async move {
                                if req.uri().path() == "/healthz" {
                                    let mut response = Response::new(Full::new(Bytes::new()));
                                    *response.status_mut() =
                                        StatusCode::from_u16(health.load(Ordering::SeqCst))
                                            .unwrap();
                                    return Ok::<_, std::convert::Infallible>(response);
                                }

                                hits.fetch_add(1, Ordering::SeqCst);
                                *headers_slot.lock() = Some(req.headers().clone());

                                let mut response =
                                    Response::new(Full::new(Bytes::from_static(body.as_bytes())));
                                response
                                    .headers_mut()
                                    .insert("x-upstream", "test-backend".parse().unwrap());
                                Ok(response)
                            }
                        });
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
            }
        }
    });

    TestBackend {
        url: format!("http://{addr}"),
        hits,
        health_status,
        last_headers,
        shutdown,
    }
}

/// Reserve an ephemeral port by binding and immediately releasing it.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A config pointing at the given backends, everything else tuned for fast
/// tests: one-second health checking with a threshold of one, caching and
/// rate limiting off.
pub fn test_config(backends: &[(&str, u32)], http_port: u16) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            http_port,
            https_port: free_port(),
            read_timeout: 5,
            write_timeout: 5,
        },
        tls: TlsConfig::default(),
        backends: backends
            .iter()
            .map(|(url, weight)| BackendConfig {
                url: (*url).to_string(),
                weight: *weight,
            })
            .collect(),
        health_check: HealthCheckConfig {
            interval: 1,
            timeout: 1,
            endpoint: "/healthz".to_string(),
            failure_threshold: 1,
            recovery_interval: 1,
        },
        cache: CacheConfig {
            enabled: false,
            ttl: 60,
        },
        rate_limit: RateLimitConfig {
            enabled: false,
            requests_per_minute: 600,
            burst: 100,
        },
        logging: LoggingConfig::default(),
    }
}

/// A proxy running in the background, stopped via its cancellation token.
pub struct RunningProxy {
    base_url: String,
    port: u16,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<(), slipstream_core::Error>>>,
}

impl RunningProxy {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Cancel the root token and wait for the supervisor to return.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Like [`stop`], but bounded; reports whether shutdown finished in time.
    ///
    /// [`stop`]: RunningProxy::stop
    pub async fn stop_within(mut self, deadline: Duration) -> bool {
        self.cancel.cancel();
        match self.handle.take() {
            Some(handle) => tokio::time::timeout(deadline, handle).await.is_ok(),
            None => true,
        }
    }
}

impl Drop for RunningProxy {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn start_proxy(config: Config) -> RunningProxy {
    let port = config.server.http_port;
    let server = ProxyServer::new(config).expect("failed to build proxy server");

    let cancel = CancellationToken::new();
    let run_token = cancel.clone();
    let handle = tokio::spawn(async move { server.run(run_token).await });

    wait_for_port(port).await;
    RunningProxy {
        base_url: format!("http://127.0.0.1:{port}"),
        port,
        cancel,
        handle: Some(handle),
    }
}

pub async fn wait_for_port(port: u16) {
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing is listening on port {port}");
}

pub async fn http_get(url: &str) -> (StatusCode, HeaderMap, Bytes) {
    let client: Client<HttpConnector, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let request = hyper::Request::builder()
        .uri(url)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = client.request(request).await.unwrap();

    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, bytes)
}
