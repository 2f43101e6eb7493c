//! Elasticsearch/OpenSearch REST client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};
use url::Url;

use super::error::{BackendError, Result};
use super::{AliasAction, AliasListing, BulkOutcome, Document, RejectedDocument, RolloverResponse, SearchBackend};

/// Connection settings
#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    /// Cluster base URL
    pub url: String,
    /// Basic auth user
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl From<&crate::config::BackendConfig> for ElasticsearchConfig {
    fn from(config: &crate::config::BackendConfig) -> Self {
        Self {
            url: config.url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// Search backend over the Elasticsearch REST API
#[derive(Debug, Clone)]
pub struct ElasticsearchBackend {
    client: Client,
    base_url: Url,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<BulkItem>,
}

#[derive(Deserialize)]
struct BulkItem {
    index: BulkItemResult,
}

#[derive(Deserialize)]
struct BulkItemResult {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

impl ElasticsearchBackend {
    /// Create a client
    pub fn new(config: ElasticsearchConfig) -> Result<Self> {
        let mut base = config.url.trim_end_matches('/').to_string();
        base.push('/');

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("docsearch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: Url::parse(&base)?,
            username: config.username,
            password: config.password,
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.base_url.join(path.trim_start_matches('/'))?;
        let request = self.client.request(method, url);
        Ok(match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        })
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        Self::check_response(response).await
    }

    async fn send_json(&self, method: Method, path: &str, body: &Value) -> Result<Response> {
        self.send(self.request(method, path)?.json(body)).await
    }

    /// Map error statuses to [`BackendError::Api`]
    async fn check_response(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(BackendError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

fn bulk_body(index: &str, documents: &[Document]) -> Result<String> {
    let mut body = String::new();
    for document in documents {
        let action = json!({ "index": { "_index": index, "_id": document.id } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&document.body)?);
        body.push('\n');
    }
    Ok(body)
}

#[async_trait]
impl SearchBackend for ElasticsearchBackend {
    async fn ping(&self) -> Result<()> {
        self.send(self.request(Method::GET, "/")?).await?;
        Ok(())
    }

    async fn create_index(&self, name: &str, body: &Value) -> Result<()> {
        info!("Creating index {}", name);
        self.send_json(Method::PUT, &format!("/{name}"), body).await?;
        Ok(())
    }

    async fn rollover(&self, write_alias: &str, body: &Value) -> Result<RolloverResponse> {
        let response = self
            .send_json(Method::POST, &format!("/{write_alias}/_rollover"), body)
            .await?;
        let value: Value = response.json().await?;
        serde_json::from_value(value)
            .map_err(|e| BackendError::malformed(format!("rollover of {write_alias}: {e}")))
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<()> {
        debug!("Applying {} alias actions", actions.len());
        self.send_json(Method::POST, "/_aliases", &json!({ "actions": actions }))
            .await?;
        Ok(())
    }

    async fn list_aliases(&self) -> Result<AliasListing> {
        let response = self.send(self.request(Method::GET, "/_aliases")?).await?;
        Ok(response.json().await?)
    }

    async fn refresh(&self, target: &str) -> Result<()> {
        self.send(self.request(Method::POST, &format!("/{target}/_refresh"))?)
            .await?;
        Ok(())
    }

    async fn bulk_index(&self, index: &str, documents: &[Document]) -> Result<BulkOutcome> {
        if documents.is_empty() {
            return Ok(BulkOutcome::default());
        }

        let request = self
            .request(Method::POST, "/_bulk")?
            .header(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"))
            .body(bulk_body(index, documents)?);
        let response: BulkResponse = self.send(request).await?.json().await?;

        let mut outcome = BulkOutcome::default();
        for item in response.items {
            let reason = match (item.index.error, item.index.status) {
                (Some(error), _) => error
                    .get("reason")
                    .and_then(Value::as_str)
                    .map_or_else(|| error.to_string(), str::to_string),
                (None, status) if status >= 300 => format!("status {status}"),
                _ => {
                    outcome.indexed += 1;
                    continue;
                }
            };
            outcome.rejected.push(RejectedDocument {
                id: item.index.id,
                reason,
            });
        }

        debug!(
            "Bulk write to {}: {} indexed, {} rejected",
            index,
            outcome.indexed,
            outcome.rejected.len()
        );
        Ok(outcome)
    }
}
