//! Error types for beamline-core

use thiserror::Error;

/// Main error type for the beamline-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Durable queue storage error
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Tracker used before `init`
    #[error("tracker is not initialized")]
    Uninitialized,

    /// Caller-supplied argument failed validation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Delivery/transport error
    #[error("delivery error: {0}")]
    Delivery(String),

    /// Channel content fetch error
    #[error("channel error: {0}")]
    Channel(String),
}

/// Result type alias for beamline-core
pub type Result<T> = std::result::Result<T, Error>;
