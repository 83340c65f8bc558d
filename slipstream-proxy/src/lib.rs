//! Slipstream reverse proxy engine.
//!
//! Ties the core primitives together: the dispatcher relays requests to a
//! balancer-selected backend, the health checker keeps the pool honest, and
//! the server supervisor owns the listeners and background workers.

pub mod dispatch;
pub mod health;
pub mod server;
pub mod tls;
