//! Error types for Slipstream.

use thiserror::Error;

/// Result type for Slipstream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Slipstream.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No backend in the pool is currently able to serve traffic
    #[error("no healthy backends available")]
    NoHealthyBackends,

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Server error
    #[error("server error: {0}")]
    Server(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
