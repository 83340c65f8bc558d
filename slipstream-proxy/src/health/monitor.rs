//! Aggregated health reporting.

use std::sync::Arc;

use super::checker::HealthChecker;

/// Point-in-time view of one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    pub url: String,
    pub healthy: bool,
    pub failure_count: u32,
}

/// Read-only window onto the checker and the pool it watches.
pub struct Monitor {
    checker: Arc<HealthChecker>,
}

impl Monitor {
    pub fn new(checker: Arc<HealthChecker>) -> Self {
        Self { checker }
    }

    /// Status snapshot for every backend, in pool order.
    pub fn status(&self) -> Vec<BackendStatus> {
        self.checker
            .balancer()
            .backends()
            .iter()
            .map(|backend| BackendStatus {
                url: backend.url().to_string(),
                healthy: backend.is_healthy(),
                failure_count: self.checker.failure_count(backend.url()),
            })
            .collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.checker.balancer().healthy_count()
    }

    pub fn total_count(&self) -> usize {
        self.checker.balancer().backends().len()
    }
}
