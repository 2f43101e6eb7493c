//! GitHub issue tracker implementation.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::json;
use tracing::debug;

use super::base::{BaseProvider, Issue, IssueComment, IssueState, IssueTracker, ProviderConfig};
use super::error::{ProviderError, Result};

/// Comments fetched per page.
const COMMENTS_PER_PAGE: usize = 100;

/// One issue of a GitHub repository, used as a status board.
#[derive(Debug, Clone)]
pub struct GitHubIssueTracker {
    base: BaseProvider,
    repository: String,
    number: u64,
}

impl GitHubIssueTracker {
    /// Default GitHub API URL.
    pub const DEFAULT_BASE_URL: &'static str = "https://api.github.com";

    /// Create a tracker for issue `number` of `repository` (`owner/name`).
    pub fn new(config: ProviderConfig, repository: impl Into<String>, number: u64) -> Result<Self> {
        let repository = repository.into();
        match repository.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {}
            _ => {
                return Err(ProviderError::ConfigurationError(format!(
                    "repository must be in owner/name form, got '{repository}'"
                )));
            }
        }

        Ok(Self {
            base: BaseProvider::new(config)?,
            repository,
            number,
        })
    }

    /// Create a tracker against github.com with a token.
    pub fn with_token(
        token: impl Into<String>,
        repository: impl Into<String>,
        number: u64,
    ) -> Result<Self> {
        let config = ProviderConfig {
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            token: Some(token.into()),
            ..Default::default()
        };
        Self::new(config, repository, number)
    }

    /// Repository in owner/name form.
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Issue number.
    #[must_use]
    pub fn number(&self) -> u64 {
        self.number
    }

    fn issue_path(&self) -> String {
        format!("/repos/{}/issues/{}", self.repository, self.number)
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );

        if let Some(token) = &self.base.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        headers
    }

    async fn patch_issue(&self, body: serde_json::Value) -> Result<()> {
        self.base
            .send_json(Method::PATCH, &self.issue_path(), self.build_headers(), &body)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IssueTracker for GitHubIssueTracker {
    async fn get_issue(&self) -> Result<Issue> {
        let response = self
            .base
            .get(&self.issue_path(), self.build_headers(), &[])
            .await
            .map_err(|e| match e {
                ProviderError::NotFound(_) => {
                    ProviderError::issue_not_found(&self.repository, self.number)
                }
                other => other,
            })?;

        Ok(response.json().await?)
    }

    async fn list_comments_since(&self, since: DateTime<Utc>) -> Result<Vec<IssueComment>> {
        let path = format!("{}/comments", self.issue_path());
        let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let per_page = COMMENTS_PER_PAGE.to_string();

        let mut comments = Vec::new();
        let mut page = 1u32;
        loop {
            let page_str = page.to_string();
            let params = [
                ("since", since.as_str()),
                ("per_page", per_page.as_str()),
                ("page", page_str.as_str()),
            ];

            let response = self.base.get(&path, self.build_headers(), &params).await?;
            let batch: Vec<IssueComment> = response.json().await?;
            let is_last = batch.len() < COMMENTS_PER_PAGE;
            comments.extend(batch);

            if is_last {
                break;
            }
            page += 1;
        }

        debug!(
            "Found {} comments on {}#{} since {}",
            comments.len(),
            self.repository,
            self.number,
            since
        );
        Ok(comments)
    }

    async fn post_comment(&self, body: &str) -> Result<()> {
        let path = format!("{}/comments", self.issue_path());
        self.base
            .send_json(Method::POST, &path, self.build_headers(), &json!({ "body": body }))
            .await?;
        Ok(())
    }

    async fn update_title(&self, title: &str) -> Result<()> {
        self.patch_issue(json!({ "title": title })).await
    }

    async fn update_body(&self, body: &str) -> Result<()> {
        self.patch_issue(json!({ "body": body })).await
    }

    async fn set_state(&self, state: IssueState) -> Result<()> {
        self.patch_issue(json!({ "state": state })).await
    }
}
