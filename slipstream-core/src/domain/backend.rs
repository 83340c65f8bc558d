//! Backend server models.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Represents a single upstream backend server.
#[derive(Debug)]
pub struct Backend {
    /// The upstream base URL, e.g. `http://10.0.0.5:8080`.
    url: String,
    /// The static balancing weight assigned at configuration time.
    weight: u32,
    /// Whether the backend is currently considered healthy.
    healthy: AtomicBool,
}

impl Backend {
    /// Create a new backend with the given URL and static weight.
    pub fn new(url: impl Into<String>, weight: u32) -> Self {
        Self {
            url: url.into(),
            weight,
            healthy: AtomicBool::new(true), // assume healthy initially
        }
    }

    /// The upstream base URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The static balancing weight.
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Check if the backend is marked healthy.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Update the health status of the backend.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }
}

/// A thread-safe reference to a Backend.
pub type SharedBackend = Arc<Backend>;
