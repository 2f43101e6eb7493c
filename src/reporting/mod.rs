//! Failure collection and status reporting
//!
//! An indexing attempt records [`Failure`]s as it goes. When it ends, the
//! failures are condensed into a [`Status`] and handed to a [`StatusReporter`]:
//! either the application log or a long-lived tracking issue.

pub mod failure;
pub mod github;
pub mod log;
pub mod renderer;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::clock::Clock;
use crate::config::{ReportingConfig, ReportingType};
use crate::providers::{GitHubIssueTracker, ProviderConfig, ProviderError};

pub use failure::{Failure, FailureCause, FailureCollector, FailuresByLevel, Level, Stage, Status};
pub use github::IssueStatusReporter;
pub use log::LogStatusReporter;

/// Result type alias for reporting operations
pub type Result<T> = std::result::Result<T, ReportError>;

/// Errors raised while publishing a report
#[derive(Error, Debug)]
pub enum ReportError {
    /// The issue tracker rejected a call
    #[error("issue tracker error: {0}")]
    Tracker(#[from] ProviderError),

    /// Reporting is misconfigured
    #[error("reporting configuration error: {0}")]
    Config(String),
}

/// Publishes the outcome of an indexing attempt
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Report `status` along with the failures it was derived from
    async fn report(&self, status: Status, failures: &FailuresByLevel) -> Result<()>;

    /// Mark an attempt as running, until its status is reported
    async fn attempt_started(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the reporter selected by configuration
pub fn create_reporter(
    config: &ReportingConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn StatusReporter>> {
    match config.kind {
        ReportingType::Log => Ok(Arc::new(LogStatusReporter::new(clock))),
        ReportingType::GithubIssue => {
            let github = config.github.as_ref().ok_or_else(|| {
                ReportError::Config(
                    "reporting type github_issue requires reporting.github settings".to_string(),
                )
            })?;

            let tracker = GitHubIssueTracker::new(
                ProviderConfig {
                    base_url: github.api_url.clone(),
                    token: Some(github.token.clone()).filter(|t| !t.is_empty()),
                    ..Default::default()
                },
                github.repository.clone(),
                github.issue_id,
            )?;

            let delay = i64::try_from(github.warning_repeat_delay_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .ok_or_else(|| {
                    ReportError::Config(format!(
                        "warning_repeat_delay_secs is too large: {}",
                        github.warning_repeat_delay_secs
                    ))
                })?;

            Ok(Arc::new(IssueStatusReporter::new(Arc::new(tracker), clock, delay)))
        }
    }
}
