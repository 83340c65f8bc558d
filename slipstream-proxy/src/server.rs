//! Server supervisor.
//!
//! Builds the pipeline once, owns the listeners and the background workers,
//! and tears everything down in order when the root cancellation token
//! fires: checker first, then the reaper, then a graceful connection drain
//! bounded by a deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use slipstream_core::balancer::SwrrBalancer;
use slipstream_core::cache::ResponseCache;
use slipstream_core::config::Config;
use slipstream_core::domain::backend::Backend;
use slipstream_core::error::Error;
use slipstream_core::ratelimit::{BucketReaper, RateLimiter};
use slipstream_filters::{incoming_body, Pipeline};

use crate::dispatch::Dispatcher;
use crate::health::HealthChecker;
use crate::tls;

/// Idle rate-limit buckets are swept on this cadence and dropped after the
/// same period of silence.
const REAPER_PERIOD: Duration = Duration::from_secs(5 * 60);

/// How long draining connections may linger once shutdown starts.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the proxy's lifecycle from construction to graceful shutdown.
pub struct ProxyServer {
    config: Config,
    reaper: Option<BucketReaper>,
    checker: Arc<HealthChecker>,
    pipeline: Arc<Pipeline>,
    dispatcher: Arc<Dispatcher>,
}

impl ProxyServer {
    /// Assemble every subsystem from a validated configuration.
    pub fn new(config: Config) -> Result<Self, Error> {
        let balancer = Arc::new(SwrrBalancer::new());
        for backend in &config.backends {
            balancer.add_backend(Arc::new(Backend::new(&backend.url, backend.weight)));
            info!(url = %backend.url, weight = backend.weight, "backend added");
        }

        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResponseCache::new(config.cache.ttl())));
        let limiter = config.rate_limit.enabled.then(|| {
            Arc::new(RateLimiter::new(
                config.rate_limit.requests_per_minute,
                config.rate_limit.burst,
            ))
        });
        let reaper = limiter
            .as_ref()
            .map(|limiter| BucketReaper::new(Arc::clone(limiter), REAPER_PERIOD, REAPER_PERIOD));

        let checker = Arc::new(HealthChecker::new(
            Arc::clone(&balancer),
            config.health_check.interval(),
            config.health_check.timeout(),
            config.health_check.endpoint.clone(),
            config.health_check.failure_threshold,
            config.health_check.recovery_interval(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&balancer), cache.clone()));
        let pipeline = Arc::new(Pipeline::new(limiter, cache));

        Ok(Self {
            config,
            reaper,
            checker,
            pipeline,
            dispatcher,
        })
    }

    /// Bind the listeners, start the workers and serve until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let tls_acceptor = if self.config.tls.enabled {
            let server_config =
                tls::load_server_config(&self.config.tls.cert_file, &self.config.tls.key_file)?;
            Some(TlsAcceptor::from(server_config))
        } else {
            None
        };

        let http_addr = format!("{}:{}", self.config.server.host, self.config.server.http_port);
        let http_listener = TcpListener::bind(&http_addr)
            .await
            .map_err(|e| Error::Server(format!("failed to bind {http_addr}: {e}")))?;
        info!(address = %http_addr, "starting HTTP server");

        let https_listener = match &tls_acceptor {
            Some(_) => {
                let https_addr =
                    format!("{}:{}", self.config.server.host, self.config.server.https_port);
                let listener = TcpListener::bind(&https_addr)
                    .await
                    .map_err(|e| Error::Server(format!("failed to bind {https_addr}: {e}")))?;
                info!(address = %https_addr, "starting HTTPS server");
                Some(listener)
            }
            None => None,
        };

        self.checker.start(cancel.child_token());
        if let Some(reaper) = &self.reaper {
            reaper.start();
        }

        let read_timeout = self.config.server.read_timeout();
        let http_task = tokio::spawn(serve(
            http_listener,
            None,
            Arc::clone(&self.pipeline),
            Arc::clone(&self.dispatcher),
            read_timeout,
            cancel.child_token(),
        ));
        let https_task = https_listener.map(|listener| {
            tokio::spawn(serve(
                listener,
                tls_acceptor,
                Arc::clone(&self.pipeline),
                Arc::clone(&self.dispatcher),
                read_timeout,
                cancel.child_token(),
            ))
        });

        cancel.cancelled().await;
        info!("shutting down servers");

        self.checker.stop().await;
        if let Some(reaper) = &self.reaper {
            reaper.stop().await;
        }

        let _ = http_task.await;
        if let Some(task) = https_task {
            let _ = task.await;
        }

        info!("server stopped");
        Ok(())
    }
}

/// Accept loop for one listener. Stops accepting when `cancel` fires, then
/// drains in-flight connections under the shutdown deadline.
async fn serve(
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    pipeline: Arc<Pipeline>,
    dispatcher: Arc<Dispatcher>,
    read_timeout: Duration,
    cancel: CancellationToken,
) {
    let connections = TaskTracker::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "failed to accept connection");
                        continue;
                    }
                };
                connections.spawn(handle_connection(
                    stream,
                    peer,
                    tls_acceptor.clone(),
                    Arc::clone(&pipeline),
                    Arc::clone(&dispatcher),
                    read_timeout,
                    cancel.clone(),
                ));
            }
        }
    }

    connections.close();
    tokio::select! {
        _ = connections.wait() => debug!("connections drained"),
        _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
            warn!("graceful shutdown deadline reached, abandoning open connections");
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    pipeline: Arc<Pipeline>,
    dispatcher: Arc<Dispatcher>,
    read_timeout: Duration,
    shutdown: CancellationToken,
) {
    match tls_acceptor {
        Some(acceptor) => {
            match tokio::time::timeout(read_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => {
                    serve_http1(
                        TokioIo::new(tls_stream),
                        peer,
                        true,
                        pipeline,
                        dispatcher,
                        read_timeout,
                        shutdown,
                    )
                    .await
                }
                Ok(Err(err)) => debug!(peer = %peer, error = %err, "TLS handshake failed"),
                Err(_) => debug!(peer = %peer, "TLS handshake timed out"),
            }
        }
        None => {
            serve_http1(
                TokioIo::new(stream),
                peer,
                false,
                pipeline,
                dispatcher,
                read_timeout,
                shutdown,
            )
            .await
        }
    }
}

async fn serve_http1<I>(
    io: TokioIo<I>,
    peer: SocketAddr,
    tls: bool,
    pipeline: Arc<Pipeline>,
    dispatcher: Arc<Dispatcher>,
    read_timeout: Duration,
    shutdown: CancellationToken,
) where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
        let pipeline = Arc::clone(&pipeline);
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            let req = req.map(incoming_body);
            Ok::<_, std::convert::Infallible>(pipeline.handle(req, peer, tls, dispatcher).await)
        }
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout)
        .serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(err) = result {
                debug!(peer = %peer, error = %err, "error serving connection");
            }
        }
        _ = shutdown.cancelled() => {
            // Finish the in-flight exchange, then close.
            conn.as_mut().graceful_shutdown();
            if let Err(err) = conn.as_mut().await {
                debug!(peer = %peer, error = %err, "error draining connection");
            }
        }
    }
}
