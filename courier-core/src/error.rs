//! Error types for courier-core

use thiserror::Error;

/// Main error type for the courier-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A single serialized event exceeds the per-event ceiling
    #[error("enqueued payload is too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Non-2xx response from the collection endpoint
    #[error("HTTP {status}")]
    Http {
        status: u16,
        retry_after: Option<u64>,
    },

    /// Network/transport failure (connect, timeout, body read)
    #[error("transport error: {0}")]
    Transport(String),

    /// Plugin setup or execution failure
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Async runtime unavailable or a background task failed
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Result type alias for courier-core
pub type Result<T> = std::result::Result<T, Error>;
