//! Error types for the control-plane stream
//!
//! Stream failures themselves are never surfaced as errors: they are absorbed
//! into scheduled retries and owner notifications. What remains here is
//! construction-time failure (bad settings, metric registration) and misuse of
//! the send path.

use thiserror::Error;

/// Primary error type for control-plane stream operations
#[derive(Error, Debug)]
pub enum StreamError {
    /// Invalid settings supplied at construction
    #[error("Configuration error: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    /// Metric registration failed
    #[error("Metrics error: {source}")]
    Metrics {
        #[from]
        source: prometheus::Error,
    },

    /// A message was sent while no stream was active
    #[error("No active gRPC stream for {method}")]
    StreamUnavailable { method: String },
}

/// Rate limit configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("rate limit max_tokens must be greater than 0")]
    ZeroMaxTokens,

    #[error("rate limit fill_rate must be a positive finite number (got {fill_rate})")]
    InvalidFillRate { fill_rate: f64 },
}

/// Reasons a transport could not open a stream
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The underlying channel refused or failed to start the call
    #[error("failed to start stream for {method}: {reason}")]
    StartFailed { method: String, reason: String },
}

/// Result type alias for stream operations
pub type StreamResult<T> = Result<T, StreamError>;
