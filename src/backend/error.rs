//! Error types for the search backend client

use thiserror::Error;

/// Result type alias for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors returned by the search backend
#[derive(Error, Debug)]
pub enum BackendError {
    /// Transport failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Body could not be (de)serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid backend URL
    #[error("invalid backend URL: {0}")]
    Url(#[from] url::ParseError),

    /// The backend answered with an error status
    #[error("backend error ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body
        message: String,
    },

    /// The backend answered with something we cannot interpret
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl BackendError {
    /// Create a malformed response error
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Whether the backend rejected the request, as opposed to being unreachable
    #[must_use]
    pub fn is_api_error(&self) -> bool {
        matches!(self, Self::Api { .. })
    }
}
