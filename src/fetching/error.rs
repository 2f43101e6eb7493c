//! Error types for content fetching

use thiserror::Error;

/// Result type alias for fetching operations
pub type Result<T> = std::result::Result<T, FetchError>;

/// Errors raised while resolving or reading source repositories
#[derive(Error, Debug)]
pub enum FetchError {
    /// Git operation failed
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive extraction failed
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Source URI could not be interpreted
    #[error("invalid source URI '{uri}': {reason}")]
    InvalidUri {
        /// The offending URI
        uri: String,
        /// Why it was rejected
        reason: String,
    },

    /// None of the candidate refs exist in the repository
    #[error("none of the refs {candidates:?} exist in '{repository}'")]
    MissingRef {
        /// Refs that were tried, in order
        candidates: Vec<String>,
        /// Repository location
        repository: String,
    },

    /// A file is missing from a tree
    #[error("missing file '{path}' in tree {tree}")]
    MissingFile {
        /// Requested path
        path: String,
        /// Tree identifier
        tree: String,
    },

    /// One source of a multi-source fetch failed
    #[error("failed to fetch '{label}': {source}")]
    Source {
        /// Label of the failing source
        label: String,
        /// Underlying failure
        #[source]
        source: Box<FetchError>,
    },

    /// The overall fetch deadline elapsed
    #[error("fetching timed out after {elapsed_secs}s; still outstanding: {outstanding:?}")]
    Timeout {
        /// Configured timeout in seconds
        elapsed_secs: u64,
        /// Labels of sources that had not completed
        outstanding: Vec<String>,
    },

    /// The fetch was cancelled before it completed
    #[error("fetch cancelled")]
    Cancelled,

    /// A fetch task panicked or was cancelled unexpectedly
    #[error("fetch task failed: {0}")]
    Join(String),
}

impl FetchError {
    /// Wrap an error with the label of the source it came from
    #[must_use]
    pub fn for_source(label: impl Into<String>, source: FetchError) -> Self {
        Self::Source {
            label: label.into(),
            source: Box::new(source),
        }
    }

    /// Create an invalid URI error
    #[must_use]
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }
}
