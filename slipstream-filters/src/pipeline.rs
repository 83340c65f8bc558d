//! The middleware chain wrapping the dispatcher.
//!
//! Order per request: request-id tagging, rate-limit gate, cache lookup,
//! dispatch, completion log. The chain runs on its own task so an
//! unexpected panic surfaces as a `500` instead of tearing down the
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Response, StatusCode};
use http_body_util::Full;
use hyper::Request;
use tracing::{debug, error, info, warn};

use slipstream_core::cache::{cache_key, ResponseCache};
use slipstream_core::ratelimit::RateLimiter;

use crate::context::RequestContext;
use crate::{text_response, ProxyBody};

/// The seam between the pipeline and whatever relays requests upstream.
///
/// Implementations never fail: upstream trouble is mapped to an error
/// response inside `dispatch`.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, req: Request<ProxyBody>, ctx: &RequestContext) -> Response<Full<Bytes>>;
}

/// Per-request orchestration of rate limiting, caching and dispatch.
pub struct Pipeline {
    limiter: Option<Arc<RateLimiter>>,
    cache: Option<Arc<ResponseCache>>,
}

impl Pipeline {
    /// `None` disables the corresponding stage.
    pub fn new(limiter: Option<Arc<RateLimiter>>, cache: Option<Arc<ResponseCache>>) -> Self {
        Self { limiter, cache }
    }

    /// Run one request through the chain and produce the client response.
    pub async fn handle(
        &self,
        req: Request<ProxyBody>,
        remote_addr: SocketAddr,
        tls: bool,
        dispatcher: Arc<dyn Dispatch>,
    ) -> Response<Full<Bytes>> {
        let ctx = RequestContext::new(remote_addr, tls);
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let limiter = self.limiter.clone();
        let cache = self.cache.clone();
        let worker = tokio::spawn(process(limiter, cache, dispatcher, req, ctx));
        // If the client goes away the connection drops this future; the
        // guard then cancels the worker, aborting any in-flight upstream
        // exchange with it.
        let _abort_guard = AbortOnDrop(worker.abort_handle());

        let mut response = match worker.await {
            Ok(response) => response,
            Err(err) => {
                error!(
                    request_id = %ctx.request_id,
                    path = %path,
                    error = %err,
                    "request handler panicked"
                );
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        };

        if let Ok(value) = ctx.request_id.to_string().parse() {
            response.headers_mut().insert("x-request-id", value);
        }

        info!(
            request_id = %ctx.request_id,
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            duration_ms = ctx.received_at.elapsed().as_millis() as u64,
            "request completed"
        );

        response
    }
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn process(
    limiter: Option<Arc<RateLimiter>>,
    cache: Option<Arc<ResponseCache>>,
    dispatcher: Arc<dyn Dispatch>,
    req: Request<ProxyBody>,
    ctx: RequestContext,
) -> Response<Full<Bytes>> {
    if let Some(limiter) = &limiter {
        let client_ip = ctx.client_ip.to_string();
        if !limiter.allow(&client_ip) {
            warn!(
                request_id = %ctx.request_id,
                client_ip = %client_ip,
                path = %req.uri().path(),
                "rate limit exceeded"
            );
            return text_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
        }
    }

    if let Some(cache) = &cache {
        if req.method() == Method::GET {
            let key = cache_key(req.method(), req.uri());
            if let Some((body, headers)) = cache.get(&key) {
                debug!(request_id = %ctx.request_id, key = %key, "cache hit");
                let mut response = Response::new(Full::new(body));
                *response.headers_mut() = headers;
                return response;
            }
            debug!(request_id = %ctx.request_id, key = %key, "cache miss");
        }
    }

    dispatcher.dispatch(req, &ctx).await
}
