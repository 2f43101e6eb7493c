//! Source descriptors: where a repository lives and which branches matter

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::{FetchError, Result};

/// Identifies one fetched source in the result of a multi-source fetch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKey {
    /// The untranslated site every localized site derives from
    Primary,
    /// A localized site, keyed by locale code
    Localized(String),
}

impl SourceKey {
    /// Short label used in logs and error messages
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Primary => "primary",
            Self::Localized(locale) => locale,
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The pair of branches read from each repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchSet {
    /// Branch holding raw sources (metadata, translation lookups)
    pub sources: String,
    /// Branch holding rendered output (indexed content)
    pub pages: String,
}

impl BranchSet {
    /// Create a branch set
    pub fn new(sources: impl Into<String>, pages: impl Into<String>) -> Self {
        Self {
            sources: sources.into(),
            pages: pages.into(),
        }
    }

    /// Branch names in fetch order, deduplicated
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        if self.sources == self.pages {
            vec![self.sources.as_str()]
        } else {
            vec![self.sources.as_str(), self.pages.as_str()]
        }
    }
}

impl Default for BranchSet {
    fn default() -> Self {
        Self::new("main", "gh-pages")
    }
}

/// Where a repository can be obtained from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// A path on the local filesystem (a repository or an archive of one)
    Path(PathBuf),
    /// A remote git URL
    Remote(String),
}

impl SourceLocation {
    /// Interpret a configured URI.
    ///
    /// `file:` URLs and scheme-less strings are filesystem paths; anything else
    /// with a scheme (or scp-like `git@host:path`) is a remote.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(FetchError::invalid_uri(uri, "empty URI"));
        }

        if uri.starts_with("git@") {
            return Ok(Self::Remote(uri.to_string()));
        }

        match Url::parse(uri) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(Self::Path)
                .map_err(|()| FetchError::invalid_uri(uri, "not a valid file path")),
            // Single-letter schemes are Windows drive letters, not URLs
            Ok(url) if url.scheme().len() > 1 => Ok(Self::Remote(uri.to_string())),
            _ => Ok(Self::Path(PathBuf::from(uri))),
        }
    }

    /// Whether this location points at an archive rather than a repository
    #[must_use]
    pub fn is_archive(&self) -> bool {
        match self {
            Self::Path(path) => path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("zip")),
            Self::Remote(_) => false,
        }
    }
}

/// One repository to fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Key under which the fetched handle is returned
    pub key: SourceKey,
    /// Filesystem path or git URL; also the cache key
    pub uri: String,
    /// Branches to fetch
    pub branches: BranchSet,
    /// Path of the gitlink pointing at the primary repository, for localized sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_submodule: Option<String>,
}

impl SourceSpec {
    /// Create the spec of the primary source
    pub fn primary(uri: impl Into<String>, branches: BranchSet) -> Self {
        Self {
            key: SourceKey::Primary,
            uri: uri.into(),
            branches,
            upstream_submodule: None,
        }
    }

    /// Create the spec of a localized source
    pub fn localized(locale: impl Into<String>, uri: impl Into<String>, branches: BranchSet) -> Self {
        Self {
            key: SourceKey::Localized(locale.into()),
            uri: uri.into(),
            branches,
            upstream_submodule: Some(DEFAULT_UPSTREAM_SUBMODULE.to_string()),
        }
    }

    /// Label used in logs and errors
    #[must_use]
    pub fn label(&self) -> &str {
        self.key.label()
    }

    /// Parse the URI into a location
    pub fn location(&self) -> Result<SourceLocation> {
        SourceLocation::parse(&self.uri)
    }
}

/// Default path of the gitlink a localized repository uses to pin its upstream
pub const DEFAULT_UPSTREAM_SUBMODULE: &str = "upstream";
