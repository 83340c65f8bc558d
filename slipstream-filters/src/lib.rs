//! Per-request middleware pipeline for the Slipstream reverse proxy.
//!
//! The pipeline tags every request with an id, applies the rate-limit gate,
//! serves cacheable responses without touching an upstream, and otherwise
//! hands the request to the dispatcher behind the [`Dispatch`] seam.

pub mod context;
pub mod pipeline;

pub use context::RequestContext;
pub use pipeline::{Dispatch, Pipeline};

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};

/// The request body type flowing through the pipeline and dispatcher.
pub type ProxyBody = UnsyncBoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Adapt a hyper server body into a [`ProxyBody`].
pub fn incoming_body(body: hyper::body::Incoming) -> ProxyBody {
    body.map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        .boxed_unsync()
}

/// A [`ProxyBody`] holding the given bytes; handy for tests and probes.
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

/// A plain-text response with the given status.
pub fn text_response(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response
}
