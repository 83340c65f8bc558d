//! Active backend health checking.

pub mod checker;
pub mod monitor;

pub use checker::HealthChecker;
pub use monitor::{BackendStatus, Monitor};
