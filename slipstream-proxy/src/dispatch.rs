//! Upstream dispatch.
//!
//! Selects a backend, rebuilds the request against the backend's base URL,
//! relays the exchange and feeds cacheable responses back into the cache.
//! All failures are mapped to an error response here; the pipeline never
//! sees a dispatch error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, info, warn};

use slipstream_core::balancer::SwrrBalancer;
use slipstream_core::cache::{cache_key, ResponseCache};
use slipstream_filters::{text_response, Dispatch, ProxyBody, RequestContext};

/// Upstream requests are abandoned after this long, end to end.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Relays requests to balancer-selected backends.
pub struct Dispatcher {
    balancer: Arc<SwrrBalancer>,
    cache: Option<Arc<ResponseCache>>,
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
}

impl Dispatcher {
    /// `cache` is `None` when response caching is disabled.
    pub fn new(balancer: Arc<SwrrBalancer>, cache: Option<Arc<ResponseCache>>) -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        // The legacy client never follows redirects; 3xx responses are
        // relayed to the client as-is.
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            balancer,
            cache,
            client,
        }
    }

    async fn forward(&self, req: Request<ProxyBody>, ctx: &RequestContext) -> Response<Full<Bytes>> {
        let backend = match self.balancer.next() {
            Ok(backend) => backend,
            Err(err) => {
                warn!(
                    request_id = %ctx.request_id,
                    path = %req.uri().path(),
                    error = %err,
                    "no healthy backends available"
                );
                return text_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
            }
        };

        let target = match upstream_uri(backend.url(), req.uri()) {
            Ok(target) => target,
            Err(err) => {
                warn!(
                    request_id = %ctx.request_id,
                    backend = backend.url(),
                    error = %err,
                    "failed to resolve upstream URL"
                );
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let store_key = self
            .cache
            .as_ref()
            .filter(|_| method == Method::GET)
            .map(|_| cache_key(&method, req.uri()));
        let original_host = req
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let (parts, body) = req.into_parts();
        let mut upstream_req = match Request::builder().method(method.clone()).uri(target).body(body)
        {
            Ok(request) => request,
            Err(err) => {
                warn!(
                    request_id = %ctx.request_id,
                    backend = backend.url(),
                    error = %err,
                    "failed to build upstream request"
                );
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        let headers = upstream_req.headers_mut();
        for (name, value) in parts.headers.iter() {
            // Host is derived from the upstream URL.
            if name == header::HOST || is_hop_by_hop(name) {
                continue;
            }
            headers.append(name, value.clone());
        }
        set_forwarding_headers(headers, ctx, &original_host);

        info!(
            request_id = %ctx.request_id,
            method = %method,
            path = %path,
            backend = backend.url(),
            "proxying request"
        );

        let started = Instant::now();
        let response =
            match tokio::time::timeout(UPSTREAM_TIMEOUT, self.client.request(upstream_req)).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    warn!(
                        request_id = %ctx.request_id,
                        backend = backend.url(),
                        path = %path,
                        error = %err,
                        "backend request failed"
                    );
                    return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
                }
                Err(_) => {
                    warn!(
                        request_id = %ctx.request_id,
                        backend = backend.url(),
                        path = %path,
                        "backend request timed out"
                    );
                    return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
                }
            };

        let (response_parts, response_body) = response.into_parts();
        debug!(
            request_id = %ctx.request_id,
            backend = backend.url(),
            path = %path,
            status = response_parts.status.as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "backend response received"
        );

        // Responses are buffered in full; that is what makes them cacheable.
        // The read shares the 30 s budget with the request itself.
        let remaining = UPSTREAM_TIMEOUT.saturating_sub(started.elapsed());
        let body = match tokio::time::timeout(remaining, response_body.collect()).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(err)) => {
                warn!(
                    request_id = %ctx.request_id,
                    backend = backend.url(),
                    path = %path,
                    error = %err,
                    "failed to read backend response body"
                );
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
            Err(_) => {
                warn!(
                    request_id = %ctx.request_id,
                    backend = backend.url(),
                    path = %path,
                    "timed out reading backend response body"
                );
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        let mut relayed_headers = HeaderMap::with_capacity(response_parts.headers.len());
        for (name, value) in response_parts.headers.iter() {
            if is_hop_by_hop(name) {
                continue;
            }
            relayed_headers.append(name, value.clone());
        }

        if let (Some(cache), Some(key)) = (&self.cache, store_key) {
            if response_parts.status == StatusCode::OK {
                cache.set(key.clone(), body.clone(), relayed_headers.clone());
                debug!(
                    request_id = %ctx.request_id,
                    key = %key,
                    size = body.len(),
                    "response cached"
                );
            }
        }

        let mut response = Response::new(Full::new(body));
        *response.status_mut() = response_parts.status;
        *response.headers_mut() = relayed_headers;
        response
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(&self, req: Request<ProxyBody>, ctx: &RequestContext) -> Response<Full<Bytes>> {
        self.forward(req, ctx).await
    }
}

/// Resolve the inbound request path and query against a backend base URL.
fn upstream_uri(backend_url: &str, original: &Uri) -> Result<Uri, http::Error> {
    let base: Uri = backend_url.parse::<Uri>()?;
    let base_path = base.path().trim_end_matches('/').to_string();

    let path_and_query = match original.query() {
        Some(query) => format!("{base_path}{}?{query}", original.path()),
        None => format!("{base_path}{}", original.path()),
    };

    let mut parts = base.into_parts();
    parts.path_and_query = Some(path_and_query.parse()?);
    Ok(Uri::from_parts(parts)?)
}

/// Hop-by-hop headers are meaningful for a single connection and must not
/// be relayed (RFC 7230 section 6.1).
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn set_forwarding_headers(headers: &mut HeaderMap, ctx: &RequestContext, original_host: &str) {
    if let Ok(value) = HeaderValue::from_str(&ctx.client_ip.to_string()) {
        headers.insert("x-forwarded-for", value);
    }
    if let Ok(value) = HeaderValue::from_str(original_host) {
        headers.insert("x-forwarded-host", value.clone());
        if !original_host.is_empty() {
            headers.insert("x-forwarded-server", value);
        }
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static(ctx.scheme()));
}
