//! Error types for docsearch

use thiserror::Error;

/// Result type alias for docsearch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for docsearch operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Another reindex attempt holds the in-progress flag
    #[error("Indexing is already in progress")]
    AlreadyInProgress,

    /// Fetching sources failed
    #[error("fetch error: {0}")]
    Fetch(#[from] crate::fetching::FetchError),

    /// Search backend error
    #[error("backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),

    /// Issue tracker error
    #[error("provider error: {0}")]
    Provider(#[from] crate::providers::ProviderError),

    /// Status reporting error
    #[error("report error: {0}")]
    Report(#[from] crate::reporting::ReportError),

    /// A background task panicked or was cancelled
    #[error("task failed: {0}")]
    Join(String),

    /// An alias operation on the search backend failed
    #[error("{context}: {source}")]
    Rollover {
        /// What was being done
        context: String,
        /// Underlying backend failure
        #[source]
        source: crate::backend::BackendError,
    },
}

impl Error {
    /// Wrap a backend error with the rollover step that failed
    #[must_use]
    pub fn rollover(context: impl Into<String>, source: crate::backend::BackendError) -> Self {
        Self::Rollover {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_config() {
        let err = Error::Config("missing field".to_string());
        assert_eq!(err.to_string(), "configuration error: missing field");
    }

    #[test]
    fn test_error_already_in_progress() {
        assert_eq!(
            Error::AlreadyInProgress.to_string(),
            "Indexing is already in progress"
        );
    }

    #[test]
    fn test_error_rollover_keeps_source() {
        use std::error::Error as _;

        let err = Error::rollover(
            "Failed to commit rollover",
            crate::backend::BackendError::malformed("empty body"),
        );
        assert_eq!(
            err.to_string(),
            "Failed to commit rollover: malformed backend response: empty body"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }
}
