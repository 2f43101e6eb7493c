//! Configuration management

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fetching::{BranchSet, SourceSpec};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Repositories to fetch
    #[serde(default)]
    pub fetching: FetchingConfig,
    /// Search backend connection
    #[serde(default)]
    pub backend: BackendConfig,
    /// Reindex attempts
    #[serde(default)]
    pub indexing: IndexingConfig,
    /// Where attempt outcomes are reported
    #[serde(default)]
    pub reporting: ReportingConfig,
}

/// Where one repository lives and which branches to read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Filesystem path, archive or git URL
    pub uri: String,
    /// Branch holding raw sources
    #[serde(default = "default_sources_branch")]
    pub sources_branch: String,
    /// Branch holding the rendered site
    #[serde(default = "default_pages_branch")]
    pub pages_branch: String,
    /// Gitlink path pinning a localized repository to the primary one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_submodule: Option<String>,
}

impl SourceConfig {
    /// Source at `uri` with the default branches
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            sources_branch: default_sources_branch(),
            pages_branch: default_pages_branch(),
            upstream_submodule: None,
        }
    }

    fn branches(&self) -> BranchSet {
        BranchSet::new(&self.sources_branch, &self.pages_branch)
    }
}

fn default_sources_branch() -> String {
    "main".to_string()
}

fn default_pages_branch() -> String {
    "gh-pages".to_string()
}

/// Content fetching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchingConfig {
    /// Concurrent fetches; 0 means one per CPU
    pub parallelism: usize,
    /// Overall deadline for fetching every source
    pub timeout_secs: u64,
    /// Open filesystem sources in place instead of cloning them
    pub local_inspection: bool,
    /// Keep repositories between attempts
    pub cache_repositories: bool,
    /// Connect timeout for network remotes; 0 keeps libgit2's default
    pub connect_timeout_secs: u64,
    /// Read timeout for network remotes; 0 keeps libgit2's default
    pub read_timeout_secs: u64,
    /// Where clones and unpacked archives go; the system temp dir if unset
    pub work_dir: Option<PathBuf>,
    /// The untranslated site
    pub primary: Option<SourceConfig>,
    /// Localized sites by locale code
    pub localized: BTreeMap<String, SourceConfig>,
}

impl Default for FetchingConfig {
    fn default() -> Self {
        Self {
            parallelism: 0,
            timeout_secs: 1800,
            local_inspection: false,
            cache_repositories: true,
            connect_timeout_secs: 30,
            read_timeout_secs: 300,
            work_dir: None,
            primary: None,
            localized: BTreeMap::new(),
        }
    }
}

impl FetchingConfig {
    /// Overall fetch deadline
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Connect timeout for network remotes
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Read timeout for network remotes
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Search backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the Elasticsearch/OpenSearch cluster
    pub url: String,
    /// Basic auth user
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<String>,
    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            timeout_secs: 30,
        }
    }
}

/// Retry policy for failed attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts in total, including the first
    pub max_attempts: u32,
    /// Pause between attempts
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_secs: 60,
        }
    }
}

impl RetryConfig {
    /// Pause between attempts
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Reindex settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Documents per bulk request
    pub batch_size: usize,
    /// Concurrent bulk requests; 0 means one per CPU
    pub parallelism: usize,
    /// Retry policy
    pub retry: RetryConfig,
    /// Admin listener host
    pub admin_host: String,
    /// Admin listener port
    pub admin_port: u16,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            parallelism: 0,
            retry: RetryConfig::default(),
            admin_host: "127.0.0.1".to_string(),
            admin_port: 9000,
        }
    }
}

/// Which reporter publishes attempt outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportingType {
    /// Application log only
    #[default]
    Log,
    /// A GitHub tracking issue
    GithubIssue,
}

/// Tracking issue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubReportingConfig {
    /// API token
    pub token: String,
    /// Repository in owner/name form
    pub repository: String,
    /// Number of the tracking issue
    pub issue_id: u64,
    /// Identical warnings are not reposted within this delay
    #[serde(default = "default_warning_repeat_delay_secs")]
    pub warning_repeat_delay_secs: u64,
    /// API base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_warning_repeat_delay_secs() -> u64 {
    86_400
}

fn default_api_url() -> String {
    crate::providers::GitHubIssueTracker::DEFAULT_BASE_URL.to_string()
}

/// Reporting settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// Reporter kind
    #[serde(rename = "type", default)]
    pub kind: ReportingType,
    /// Required for `github_issue`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<GithubReportingConfig>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        let mut config = Self::default();

        if let Some(uri) = var("DOCSEARCH_PRIMARY_URI") {
            let mut primary = SourceConfig::new(uri);
            if let Some(val) = var("DOCSEARCH_PRIMARY_SOURCES_BRANCH") {
                primary.sources_branch = val;
            }
            if let Some(val) = var("DOCSEARCH_PRIMARY_PAGES_BRANCH") {
                primary.pages_branch = val;
            }
            config.fetching.primary = Some(primary);
        }

        // DOCSEARCH_LOCALIZED=ja=https://...,fr=/srv/fr
        if let Some(val) = var("DOCSEARCH_LOCALIZED") {
            for entry in val.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let (locale, uri) = entry.split_once('=').ok_or_else(|| {
                    crate::Error::Config(format!(
                        "DOCSEARCH_LOCALIZED entries must be locale=uri, got '{entry}'"
                    ))
                })?;
                config
                    .fetching
                    .localized
                    .insert(locale.trim().to_string(), SourceConfig::new(uri.trim()));
            }
        }

        if let Some(val) = var("DOCSEARCH_FETCH_PARALLELISM") {
            config.fetching.parallelism = parse_var("DOCSEARCH_FETCH_PARALLELISM", &val)?;
        }
        if let Some(val) = var("DOCSEARCH_FETCH_TIMEOUT_SECS") {
            config.fetching.timeout_secs = parse_var("DOCSEARCH_FETCH_TIMEOUT_SECS", &val)?;
        }
        if let Some(val) = var("DOCSEARCH_LOCAL_INSPECTION") {
            config.fetching.local_inspection = is_truthy(&val);
        }
        if let Some(val) = var("DOCSEARCH_CACHE_REPOSITORIES") {
            config.fetching.cache_repositories = is_truthy(&val);
        }
        if let Some(val) = var("DOCSEARCH_FETCH_CONNECT_TIMEOUT_SECS") {
            config.fetching.connect_timeout_secs =
                parse_var("DOCSEARCH_FETCH_CONNECT_TIMEOUT_SECS", &val)?;
        }
        if let Some(val) = var("DOCSEARCH_FETCH_READ_TIMEOUT_SECS") {
            config.fetching.read_timeout_secs = parse_var("DOCSEARCH_FETCH_READ_TIMEOUT_SECS", &val)?;
        }
        config.fetching.work_dir = var("DOCSEARCH_WORK_DIR").map(PathBuf::from);

        if let Some(val) = var("DOCSEARCH_BACKEND_URL") {
            config.backend.url = val;
        }
        config.backend.username = var("DOCSEARCH_BACKEND_USERNAME").or(config.backend.username);
        config.backend.password = var("DOCSEARCH_BACKEND_PASSWORD").or(config.backend.password);

        if let Some(val) = var("DOCSEARCH_BATCH_SIZE") {
            config.indexing.batch_size = parse_var("DOCSEARCH_BATCH_SIZE", &val)?;
        }
        if let Some(val) = var("DOCSEARCH_RETRY_MAX_ATTEMPTS") {
            config.indexing.retry.max_attempts = parse_var("DOCSEARCH_RETRY_MAX_ATTEMPTS", &val)?;
        }
        if let Some(val) = var("DOCSEARCH_RETRY_DELAY_SECS") {
            config.indexing.retry.delay_secs = parse_var("DOCSEARCH_RETRY_DELAY_SECS", &val)?;
        }
        if let Some(val) = var("DOCSEARCH_ADMIN_HOST") {
            config.indexing.admin_host = val;
        }
        if let Some(val) = var("DOCSEARCH_ADMIN_PORT") {
            config.indexing.admin_port = parse_var("DOCSEARCH_ADMIN_PORT", &val)?;
        }

        if let Some(val) = var("DOCSEARCH_REPORTING_TYPE") {
            config.reporting.kind = match val.as_str() {
                "log" => ReportingType::Log,
                "github_issue" => ReportingType::GithubIssue,
                other => {
                    return Err(crate::Error::Config(format!(
                        "unknown reporting type '{other}'"
                    )));
                }
            };
        }
        if let (Some(repository), Some(issue_id)) =
            (var("DOCSEARCH_GITHUB_REPOSITORY"), var("DOCSEARCH_GITHUB_ISSUE_ID"))
        {
            let token = var("GITHUB_TOKEN")
                .or_else(|| var("DOCSEARCH_GITHUB_TOKEN"))
                .unwrap_or_default();
            config.reporting.github = Some(GithubReportingConfig {
                token,
                repository,
                issue_id: parse_var("DOCSEARCH_GITHUB_ISSUE_ID", &issue_id)?,
                warning_repeat_delay_secs: default_warning_repeat_delay_secs(),
                api_url: var("DOCSEARCH_GITHUB_API_URL").unwrap_or_else(default_api_url),
            });
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;

        if path
            .extension()
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false)
        {
            serde_yaml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
        } else {
            serde_json::from_str(&content).map_err(crate::Error::Json)
        }
    }

    /// Check settings that serde cannot
    pub fn validate(&self) -> crate::Result<()> {
        if self.fetching.primary.is_none() {
            return Err(crate::Error::Config(
                "fetching.primary must name the primary repository".to_string(),
            ));
        }
        if self.indexing.batch_size == 0 {
            return Err(crate::Error::Config(
                "indexing.batch_size must be positive".to_string(),
            ));
        }
        if self.indexing.retry.max_attempts == 0 {
            return Err(crate::Error::Config(
                "indexing.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.reporting.kind == ReportingType::GithubIssue && self.reporting.github.is_none() {
            return Err(crate::Error::Config(
                "reporting type github_issue requires reporting.github settings".to_string(),
            ));
        }
        Ok(())
    }

    /// Fetch specs for the primary source followed by localized ones
    pub fn source_specs(&self) -> crate::Result<Vec<SourceSpec>> {
        let primary = self.fetching.primary.as_ref().ok_or_else(|| {
            crate::Error::Config("fetching.primary must name the primary repository".to_string())
        })?;

        let mut specs = vec![SourceSpec::primary(&primary.uri, primary.branches())];
        for (locale, source) in &self.fetching.localized {
            let mut spec = SourceSpec::localized(locale, &source.uri, source.branches());
            if let Some(submodule) = &source.upstream_submodule {
                spec.upstream_submodule = Some(submodule.clone());
            }
            specs.push(spec);
        }
        Ok(specs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| crate::Error::Config(format!("invalid {name} '{value}': {e}")))
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
