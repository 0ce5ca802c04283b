//! Error types for `nerfhub` core library.

use thiserror::Error;

/// Result type alias using `nerfhub` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `nerfhub` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
