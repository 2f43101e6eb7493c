//! Error types for issue tracker providers.

use thiserror::Error;

/// Result type alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors raised while talking to an issue tracker.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON parsing failed.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Authentication failed or credentials missing.
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded, retry after {retry_after_secs} seconds")]
    RateLimitExceeded {
        /// Seconds until rate limit resets.
        retry_after_secs: u64,
    },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Issue not found in the given repository.
    #[error("Issue not found: {repository}#{number}")]
    IssueNotFound {
        /// Repository in owner/name form.
        repository: String,
        /// Issue number.
        number: u64,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Error message from API.
        message: String,
    },

    /// URL parsing failed.
    #[error("URL parsing failed: {0}")]
    UrlParseError(#[from] url::ParseError),
}

impl ProviderError {
    /// Create an issue not found error.
    #[must_use]
    pub fn issue_not_found(repository: impl Into<String>, number: u64) -> Self {
        Self::IssueNotFound {
            repository: repository.into(),
            number,
        }
    }

    /// Create a rate limited error.
    #[must_use]
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::RateLimitExceeded { retry_after_secs }
    }
}
