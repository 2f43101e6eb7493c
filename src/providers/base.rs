//! Base traits and types for issue tracker providers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::error::{ProviderError, Result};

/// Open/closed state of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    /// The issue is open.
    Open,
    /// The issue is closed.
    Closed,
}

/// An issue, as far as status reporting is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Issue number within its repository.
    pub number: u64,
    /// Current title.
    pub title: String,
    /// Current description, if any.
    #[serde(default)]
    pub body: Option<String>,
    /// Open or closed.
    pub state: IssueState,
}

/// A comment posted on an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueComment {
    /// Comment identifier.
    pub id: u64,
    /// Markdown body.
    #[serde(default)]
    pub body: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Operations on one long-lived tracking issue.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Fetch the issue.
    async fn get_issue(&self) -> Result<Issue>;

    /// Comments updated since `since`, oldest first.
    async fn list_comments_since(&self, since: DateTime<Utc>) -> Result<Vec<IssueComment>>;

    /// Post a new comment.
    async fn post_comment(&self, body: &str) -> Result<()>;

    /// Replace the issue title.
    async fn update_title(&self, title: &str) -> Result<()>;

    /// Replace the issue description.
    async fn update_body(&self, body: &str) -> Result<()>;

    /// Open or close the issue.
    async fn set_state(&self, state: IssueState) -> Result<()>;
}

/// Fixed-window request limiter for API calls.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window_duration: Duration,
    window: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

impl RateLimiter {
    /// Create a new rate limiter.
    #[must_use]
    pub fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_duration: Duration::from_secs(window_seconds),
            window: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Take a slot in the current window, waiting for the next one if it is full.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let elapsed = window.started.elapsed();
                if elapsed >= self.window_duration {
                    window.started = Instant::now();
                    window.count = 0;
                }

                if window.count < self.max_requests {
                    window.count += 1;
                    return;
                }
                self.window_duration.saturating_sub(elapsed)
            };

            tokio::time::sleep(wait).await;
        }
    }
}

/// Configuration for an issue tracker provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL for the API.
    pub base_url: String,
    /// API token.
    pub token: Option<String>,
    /// Maximum requests per rate limit window.
    pub rate_limit_requests: u32,
    /// Rate limit window in seconds.
    pub rate_limit_window: u64,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            rate_limit_requests: 5000,
            rate_limit_window: 3600,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Shared HTTP plumbing for providers.
#[derive(Debug, Clone)]
pub struct BaseProvider {
    /// HTTP client with connection pooling.
    pub client: Client,
    /// Base URL for the API, without trailing slash.
    pub base_url: String,
    /// API token.
    pub token: Option<String>,
    /// Rate limiter shared by clones.
    pub rate_limiter: Arc<RateLimiter>,
}

impl BaseProvider {
    /// Create a new base provider.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("docsearch/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(ProviderError::HttpError)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
            rate_limiter: Arc::new(RateLimiter::new(
                config.rate_limit_requests,
                config.rate_limit_window,
            )),
        })
    }

    /// Start a rate-limited request.
    pub async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        headers: HeaderMap,
    ) -> reqwest::RequestBuilder {
        self.rate_limiter.acquire().await;

        let url = format!("{}{}", self.base_url, path);
        self.client.request(method, &url).headers(headers)
    }

    /// Make a GET request with query parameters.
    pub async fn get(
        &self,
        path: &str,
        headers: HeaderMap,
        params: &[(&str, &str)],
    ) -> Result<reqwest::Response> {
        let request = self.request(reqwest::Method::GET, path, headers).await;
        let response = request.query(params).send().await?;
        Self::check_response(response).await
    }

    /// Send a JSON body.
    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        path: &str,
        headers: HeaderMap,
        body: &T,
    ) -> Result<reqwest::Response> {
        let request = self.request(method, path, headers).await;
        let response = request.json(body).send().await?;
        Self::check_response(response).await
    }

    /// Check response status and return error if not successful.
    pub async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(response.url().path().to_string()));
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ProviderError::AuthenticationError(
                "Authentication failed".to_string(),
            ));
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());
        let exhausted = response
            .headers()
            .get("x-ratelimit-remaining")
            .is_some_and(|v| v.as_bytes() == b"0");

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || (status == reqwest::StatusCode::FORBIDDEN && (exhausted || retry_after.is_some()))
        {
            return Err(ProviderError::rate_limited(retry_after.unwrap_or(60)));
        }

        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthenticationError(
                "Access forbidden".to_string(),
            ));
        }

        let message = response.text().await.unwrap_or_default();
        Err(ProviderError::ApiError {
            status: status.as_u16(),
            message,
        })
    }
}
