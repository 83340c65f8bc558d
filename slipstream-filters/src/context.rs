//! Per-request context threaded through the pipeline.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use uuid::Uuid;

/// Identity and timing of one inbound request.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    /// Unique id echoed back to the client in `X-Request-Id`.
    pub request_id: Uuid,
    /// Client address with the port stripped; keys the rate limiter and
    /// feeds `X-Forwarded-For`.
    pub client_ip: IpAddr,
    /// Whether the inbound connection was TLS-terminated.
    pub tls: bool,
    pub received_at: Instant,
}

impl RequestContext {
    pub fn new(remote_addr: SocketAddr, tls: bool) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client_ip: remote_addr.ip(),
            tls,
            received_at: Instant::now(),
        }
    }

    /// The scheme the client spoke to us, for `X-Forwarded-Proto`.
    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }
}
