//! Error types for config rendering.

use thiserror::Error;

/// Result alias for rendering.
pub type Result<T> = std::result::Result<T, RenderError>;

/// Errors raised while rendering or reading a tunnel engine document.
#[derive(Debug, Error)]
pub enum RenderError {
    /// A mandatory field is missing or malformed. No document is produced.
    #[error("config validation failed: {0}")]
    ConfigValidation(String),

    /// Document could not be (de)serialized.
    #[error("malformed config document: {0}")]
    Serde(#[from] serde_json::Error),

    /// Reading or writing the document failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
