//! Search backend
//!
//! The index is held by an Elasticsearch/OpenSearch cluster. Every entity type
//! is reached through two aliases: `<entity>-read` for queries and
//! `<entity>-write` for indexing. Concrete indexes are generations named
//! `<entity>-000001`, `<entity>-000002`, ... so the backend's rollover API
//! derives the next name on its own.

pub mod elasticsearch;
pub mod error;
#[cfg(test)]
pub(crate) mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub use elasticsearch::{ElasticsearchBackend, ElasticsearchConfig};
pub use error::{BackendError, Result};

/// Expected schema of one entity type's index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSchema {
    /// Entity type, also the prefix of aliases and generations
    pub entity_type: String,
    /// Index settings
    #[serde(default)]
    pub settings: Value,
    /// Field mappings
    #[serde(default)]
    pub mappings: Value,
}

impl IndexSchema {
    /// Schema with empty settings and the given mappings
    pub fn new(entity_type: impl Into<String>, mappings: Value) -> Self {
        Self {
            entity_type: entity_type.into(),
            settings: json!({}),
            mappings,
        }
    }

    /// Alias queries go through
    #[must_use]
    pub fn read_alias(&self) -> String {
        format!("{}-read", self.entity_type)
    }

    /// Alias documents are written through
    #[must_use]
    pub fn write_alias(&self) -> String {
        format!("{}-write", self.entity_type)
    }

    /// Name of generation `sequence`
    #[must_use]
    pub fn generation_name(&self, sequence: u32) -> String {
        format!("{}-{:06}", self.entity_type, sequence)
    }

    /// Body of a create or rollover request, without aliases
    #[must_use]
    pub fn index_body(&self) -> Value {
        json!({
            "settings": self.settings,
            "mappings": self.mappings,
        })
    }
}

/// One step of an atomic alias update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasAction {
    /// Point `alias` at `index`
    Add {
        /// Target index
        index: String,
        /// Alias name
        alias: String,
        /// Whether `index` becomes the alias' write index
        is_write_index: bool,
    },
    /// Delete `index` along with its aliases
    RemoveIndex {
        /// Index to delete
        index: String,
    },
}

impl AliasAction {
    /// Add action
    pub fn add(index: impl Into<String>, alias: impl Into<String>, is_write_index: bool) -> Self {
        Self::Add {
            index: index.into(),
            alias: alias.into(),
            is_write_index,
        }
    }

    /// Remove-index action
    pub fn remove_index(index: impl Into<String>) -> Self {
        Self::RemoveIndex {
            index: index.into(),
        }
    }
}

/// Indexes involved in a rollover
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RolloverResponse {
    /// Index the write alias pointed to before
    pub old_index: String,
    /// Index the write alias points to now
    pub new_index: String,
}

/// Alias attributes on one index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasMetadata {
    /// Set when the index is the alias' write index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_write_index: Option<bool>,
}

/// Aliases of one index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexAliases {
    /// Aliases by name
    #[serde(default)]
    pub aliases: BTreeMap<String, AliasMetadata>,
}

/// Every index and its aliases, as returned by `GET /_aliases`
pub type AliasListing = BTreeMap<String, IndexAliases>;

/// A document ready to be indexed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Entity type, selecting the index
    pub entity_type: String,
    /// Identifier, unique within the entity type
    pub id: String,
    /// Source body
    pub body: Value,
}

impl Document {
    /// Create a document
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>, body: Value) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            body,
        }
    }
}

/// A document the backend refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDocument {
    /// Document identifier
    pub id: String,
    /// Reason given by the backend
    pub reason: String,
}

/// Result of a bulk write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    /// Documents accepted
    pub indexed: usize,
    /// Documents rejected
    pub rejected: Vec<RejectedDocument>,
}

/// Operations the reindexing engine needs from the search cluster
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Check the cluster is reachable
    async fn ping(&self) -> Result<()>;

    /// Create an index; `body` may carry settings, mappings and aliases
    async fn create_index(&self, name: &str, body: &Value) -> Result<()>;

    /// Roll `write_alias` over to a new generation created with `body`
    async fn rollover(&self, write_alias: &str, body: &Value) -> Result<RolloverResponse>;

    /// Apply alias actions in one atomic request
    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<()>;

    /// Every index with its aliases
    async fn list_aliases(&self) -> Result<AliasListing>;

    /// Make recent writes to `target` searchable
    async fn refresh(&self, target: &str) -> Result<()>;

    /// Write documents to `index` (usually a write alias)
    async fn bulk_index(&self, index: &str, documents: &[Document]) -> Result<BulkOutcome>;
}
