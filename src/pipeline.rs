//! Content pipelines turn fetched repositories into documents
//!
//! Extraction is pluggable; the indexing service only needs the schemas a
//! pipeline writes to and a way to run it against fetched content.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::backend::{Document, IndexSchema};
use crate::error::{Error, Result};
use crate::fetching::{self, FetchedContent, FetchedSource, RepositoryHandle, SourceKey};
use crate::indexer::DocumentSink;
use crate::reporting::{Failure, FailureCollector, Level, Stage};

/// Extracts documents from fetched content
#[async_trait]
pub trait ContentPipeline: Send + Sync {
    /// Schemas of every entity type the pipeline produces
    fn schemas(&self) -> Vec<IndexSchema>;

    /// Push every document found in `content` into `sink`.
    ///
    /// Per-document problems go to `failures`; an `Err` aborts the attempt.
    async fn run(
        &self,
        content: &FetchedContent,
        sink: &dyn DocumentSink,
        failures: &dyn FailureCollector,
    ) -> Result<()>;
}

/// Indexes the rendered HTML of every source as-is, one `page` per file
#[derive(Debug, Clone)]
pub struct RawPagesPipeline {
    primary_locale: String,
}

impl RawPagesPipeline {
    /// Entity type of the documents produced
    pub const ENTITY_TYPE: &'static str = "page";

    /// Create a pipeline labelling primary pages with `primary_locale`
    pub fn new(primary_locale: impl Into<String>) -> Self {
        Self {
            primary_locale: primary_locale.into(),
        }
    }

    /// Schema of the `page` entity type
    #[must_use]
    pub fn schema() -> IndexSchema {
        IndexSchema::new(
            Self::ENTITY_TYPE,
            json!({
                "properties": {
                    "locale": { "type": "keyword" },
                    "path": { "type": "keyword" },
                    "content": { "type": "text" },
                    "committed_at": { "type": "date" },
                    "upstream_commit": { "type": "keyword" },
                }
            }),
        )
    }

    fn locale_of(&self, key: &SourceKey) -> String {
        match key {
            SourceKey::Primary => self.primary_locale.clone(),
            SourceKey::Localized(locale) => locale.clone(),
        }
    }
}

impl Default for RawPagesPipeline {
    fn default() -> Self {
        Self::new("en")
    }
}

#[derive(Default)]
struct Extracted {
    documents: Vec<Document>,
    failures: Vec<Failure>,
}

#[async_trait]
impl ContentPipeline for RawPagesPipeline {
    fn schemas(&self) -> Vec<IndexSchema> {
        vec![Self::schema()]
    }

    async fn run(
        &self,
        content: &FetchedContent,
        sink: &dyn DocumentSink,
        failures: &dyn FailureCollector,
    ) -> Result<()> {
        for source in content.iter() {
            let locale = self.locale_of(&source.spec.key);
            let owned = source.clone();
            let primary = content.primary().cloned();

            let extracted = tokio::task::spawn_blocking(move || {
                extract(&owned, primary.as_deref(), &locale)
            })
            .await
            .map_err(|e| Error::Join(e.to_string()))??;

            info!(
                "Extracted {} pages from {}",
                extracted.documents.len(),
                source.spec.label()
            );
            for failure in extracted.failures {
                failures.collect(failure);
            }
            for document in extracted.documents {
                sink.push(document).await?;
            }
        }
        Ok(())
    }
}

fn extract(
    source: &FetchedSource,
    primary: Option<&RepositoryHandle>,
    locale: &str,
) -> fetching::Result<Extracted> {
    let mut extracted = Extracted::default();
    let upstream_commit = match (source.spec.upstream_submodule.as_deref(), primary) {
        (Some(submodule), Some(primary)) => {
            pinned_upstream(source, primary, submodule, locale, &mut extracted.failures)
        }
        _ => None,
    };

    let pages = source.handle.pages()?;
    let committed_at = pages.committed_at()?;
    for path in pages.list_files("")? {
        if !is_html(&path) {
            continue;
        }
        let bytes = pages.read_file(&path)?;
        match page_document(locale, &path, bytes, committed_at, upstream_commit.as_deref()) {
            Ok(document) => extracted.documents.push(document),
            Err(e) => extracted.failures.push(
                Failure::new(
                    Level::Warning,
                    Stage::Parsing,
                    format!("{locale}: {path} is not valid UTF-8"),
                )
                .with_cause(&e),
            ),
        }
    }
    debug!("{} pages in {}", extracted.documents.len(), source.handle.uri());
    Ok(extracted)
}

/// Commit of the primary sources a localized source is pinned to
fn pinned_upstream(
    source: &FetchedSource,
    primary: &RepositoryHandle,
    submodule: &str,
    locale: &str,
    failures: &mut Vec<Failure>,
) -> Option<String> {
    let sources = source.handle.localized_sources(primary, submodule);
    match sources.pinned_commit() {
        Ok(Some(commit)) => match sources.tree() {
            Ok(_) => Some(commit.to_string()),
            Err(e) => {
                failures.push(
                    Failure::new(
                        Level::Warning,
                        Stage::Translation,
                        format!("{locale}: cannot read primary sources at pinned commit {commit}"),
                    )
                    .with_cause(&e),
                );
                None
            }
        },
        Ok(None) => {
            failures.push(Failure::new(
                Level::Warning,
                Stage::Translation,
                format!("{locale}: no '{submodule}' pointer, sources are not pinned to the primary"),
            ));
            None
        }
        Err(e) => {
            failures.push(
                Failure::new(
                    Level::Warning,
                    Stage::Translation,
                    format!("{locale}: cannot read the '{submodule}' pointer"),
                )
                .with_cause(&e),
            );
            None
        }
    }
}

fn is_html(path: &str) -> bool {
    Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("html"))
}

fn page_document(
    locale: &str,
    path: &str,
    bytes: Vec<u8>,
    committed_at: DateTime<Utc>,
    upstream_commit: Option<&str>,
) -> std::result::Result<Document, std::string::FromUtf8Error> {
    let content = String::from_utf8(bytes)?;
    Ok(Document::new(
        RawPagesPipeline::ENTITY_TYPE,
        format!("{locale}:{path}"),
        json!({
            "locale": locale,
            "path": path,
            "content": content,
            "committed_at": committed_at.to_rfc3339(),
            "upstream_commit": upstream_commit,
        }),
    ))
}
