//! Error types for fastload_core.

use thiserror::Error;

use crate::request::ImageSource;

/// Error types for image requests.
///
/// Only `Resolve` and `Io` failures are retried. `Cancelled` is never
/// reported through error callbacks.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Request has no usable path for source {0:?}")]
    MissingPath(ImageSource),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No data resolver registered for source {0:?}")]
    NoResolver(ImageSource),

    #[error("Failed to resolve {path}: {message}")]
    Resolve { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Transformation {key} failed: {message}")]
    Transform { key: String, message: String },

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LoadError {
    pub fn resolve(path: impl Into<String>, message: impl Into<String>) -> Self {
        LoadError::Resolve {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadError::Cancelled)
    }

    /// Failures the resolver boundary may retry. Corrupt data and missing
    /// resolvers will not get better on a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoadError::Resolve { .. } | LoadError::Io(_))
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, LoadError::OutOfMemory(_))
    }

    /// Malformed descriptors, rejected before scheduling.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            LoadError::InvalidKey(_) | LoadError::MissingPath(_) | LoadError::Config(_)
        )
    }
}

/// Result type alias for image operations.
pub type LoadResult<T> = Result<T, LoadError>;
