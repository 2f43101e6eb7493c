//! In-memory search backend following the cluster's alias semantics

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::error::{BackendError, Result};
use super::{
    AliasAction, AliasListing, AliasMetadata, BulkOutcome, Document, IndexAliases, IndexSchema,
    RejectedDocument, RolloverResponse, SearchBackend,
};

#[derive(Debug, Clone, Default)]
struct Index {
    /// Alias name to write flag
    aliases: BTreeMap<String, bool>,
    body: Value,
    documents: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    indices: Mutex<BTreeMap<String, Index>>,
    requests: Mutex<Vec<String>>,
    pub fail_rollover_of: Mutex<HashSet<String>>,
    pub fail_alias_updates: Mutex<bool>,
    pub fail_bulk: Mutex<bool>,
    pub reject_ids: Mutex<HashSet<String>>,
}

fn not_found(what: &str) -> BackendError {
    BackendError::Api {
        status: 404,
        message: format!("no such index [{what}]"),
    }
}

fn next_generation(name: &str) -> Option<String> {
    let (prefix, sequence) = name.rsplit_once('-')?;
    let sequence: u32 = sequence.parse().ok()?;
    Some(format!("{prefix}-{:06}", sequence + 1))
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend where generation `sequence` of each schema is live
    pub fn with_generations(schemas: &[IndexSchema], sequence: u32) -> Self {
        let backend = Self::new();
        {
            let mut indices = backend.indices.lock().unwrap();
            for schema in schemas {
                let mut index = Index::default();
                index.aliases.insert(schema.read_alias(), false);
                index.aliases.insert(schema.write_alias(), true);
                indices.insert(schema.generation_name(sequence), index);
            }
        }
        backend
    }

    /// Put an index in place with the given aliases, bypassing any checks
    pub fn force_index(&self, name: &str, aliases: &[(&str, bool)]) {
        let mut indices = self.indices.lock().unwrap();
        let index = indices.entry(name.to_string()).or_default();
        index.aliases = aliases.iter().map(|(a, w)| (a.to_string(), *w)).collect();
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indices.lock().unwrap().keys().cloned().collect()
    }

    /// Indexes an alias points to
    pub fn targets(&self, alias: &str) -> Vec<String> {
        self.indices
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, index)| index.aliases.contains_key(alias))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Index writes through `alias` land in
    pub fn write_target(&self, alias: &str) -> Option<String> {
        let indices = self.indices.lock().unwrap();
        Self::resolve_write(&indices, alias)
    }

    pub fn body(&self, index: &str) -> Option<Value> {
        self.indices.lock().unwrap().get(index).map(|i| i.body.clone())
    }

    pub fn document_ids(&self, index: &str) -> Vec<String> {
        self.indices
            .lock()
            .unwrap()
            .get(index)
            .map(|i| i.documents.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count_requests(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.starts_with(prefix))
            .count()
    }

    fn record(&self, request: String) {
        self.requests.lock().unwrap().push(request);
    }

    fn resolve_write(indices: &BTreeMap<String, Index>, alias: &str) -> Option<String> {
        if indices.contains_key(alias) {
            return Some(alias.to_string());
        }
        let targets: Vec<(&String, bool)> = indices
            .iter()
            .filter_map(|(name, index)| index.aliases.get(alias).map(|w| (name, *w)))
            .collect();
        match targets.as_slice() {
            [(name, _)] => Some((*name).clone()),
            many => many.iter().find(|(_, w)| *w).map(|(n, _)| (*n).clone()),
        }
    }
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    async fn ping(&self) -> Result<()> {
        self.record("ping".to_string());
        Ok(())
    }

    async fn create_index(&self, name: &str, body: &Value) -> Result<()> {
        self.record(format!("create {name}"));
        let mut indices = self.indices.lock().unwrap();
        if indices.contains_key(name) {
            return Err(BackendError::Api {
                status: 400,
                message: format!("resource_already_exists_exception [{name}]"),
            });
        }

        let mut index = Index {
            body: body.clone(),
            ..Default::default()
        };
        if let Some(aliases) = body.get("aliases").and_then(Value::as_object) {
            for (alias, meta) in aliases {
                let write = meta
                    .get("is_write_index")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                index.aliases.insert(alias.clone(), write);
            }
        }
        indices.insert(name.to_string(), index);
        Ok(())
    }

    async fn rollover(&self, write_alias: &str, body: &Value) -> Result<RolloverResponse> {
        self.record(format!("rollover {write_alias}"));
        if self.fail_rollover_of.lock().unwrap().contains(write_alias) {
            return Err(BackendError::Api {
                status: 500,
                message: format!("rollover of [{write_alias}] failed"),
            });
        }

        let mut indices = self.indices.lock().unwrap();
        let old_index =
            Self::resolve_write(&indices, write_alias).ok_or_else(|| not_found(write_alias))?;
        let new_index = next_generation(&old_index)
            .ok_or_else(|| BackendError::malformed(format!("cannot roll over {old_index}")))?;
        if indices.contains_key(&new_index) {
            return Err(BackendError::Api {
                status: 400,
                message: format!("resource_already_exists_exception [{new_index}]"),
            });
        }

        if let Some(old) = indices.get_mut(&old_index) {
            old.aliases.insert(write_alias.to_string(), false);
        }
        let mut index = Index {
            body: body.clone(),
            ..Default::default()
        };
        index.aliases.insert(write_alias.to_string(), true);
        indices.insert(new_index.clone(), index);

        Ok(RolloverResponse {
            old_index,
            new_index,
        })
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<()> {
        self.record(format!("aliases {}", serde_json::to_string(actions)?));
        if *self.fail_alias_updates.lock().unwrap() {
            return Err(BackendError::Api {
                status: 503,
                message: "cluster unavailable".to_string(),
            });
        }

        let mut indices = self.indices.lock().unwrap();
        // Applied to a copy so a failing action leaves nothing behind
        let mut updated = indices.clone();
        for action in actions {
            match action {
                AliasAction::Add {
                    index,
                    alias,
                    is_write_index,
                } => {
                    if !updated.contains_key(index) {
                        return Err(not_found(index));
                    }
                    if *is_write_index {
                        for other in updated.values_mut() {
                            if let Some(flag) = other.aliases.get_mut(alias) {
                                *flag = false;
                            }
                        }
                    }
                    if let Some(target) = updated.get_mut(index) {
                        target.aliases.insert(alias.clone(), *is_write_index);
                    }
                }
                AliasAction::RemoveIndex { index } => {
                    if updated.remove(index).is_none() {
                        return Err(not_found(index));
                    }
                }
            }
        }
        *indices = updated;
        Ok(())
    }

    async fn list_aliases(&self) -> Result<AliasListing> {
        self.record("list_aliases".to_string());
        Ok(self
            .indices
            .lock()
            .unwrap()
            .iter()
            .map(|(name, index)| {
                let aliases = index
                    .aliases
                    .iter()
                    .map(|(alias, write)| {
                        (
                            alias.clone(),
                            AliasMetadata {
                                is_write_index: Some(*write),
                            },
                        )
                    })
                    .collect();
                (name.clone(), IndexAliases { aliases })
            })
            .collect())
    }

    async fn refresh(&self, target: &str) -> Result<()> {
        self.record(format!("refresh {target}"));
        Ok(())
    }

    async fn bulk_index(&self, index: &str, documents: &[Document]) -> Result<BulkOutcome> {
        self.record(format!("bulk {index} {}", documents.len()));
        if *self.fail_bulk.lock().unwrap() {
            return Err(BackendError::Api {
                status: 503,
                message: "cluster unavailable".to_string(),
            });
        }

        let reject_ids = self.reject_ids.lock().unwrap().clone();
        let mut indices = self.indices.lock().unwrap();
        let name = Self::resolve_write(&indices, index).ok_or_else(|| not_found(index))?;
        let target = indices.get_mut(&name).ok_or_else(|| not_found(&name))?;

        let mut outcome = BulkOutcome::default();
        for document in documents {
            if reject_ids.contains(&document.id) {
                outcome.rejected.push(RejectedDocument {
                    id: document.id.clone(),
                    reason: "mapper_parsing_exception".to_string(),
                });
            } else {
                target
                    .documents
                    .insert(document.id.clone(), document.body.clone());
                outcome.indexed += 1;
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_generation() {
        assert_eq!(next_generation("page-000001").as_deref(), Some("page-000002"));
        assert_eq!(next_generation("api-doc-000099").as_deref(), Some("api-doc-000100"));
        assert_eq!(next_generation("page"), None);
    }

    #[tokio::test]
    async fn test_rollover_moves_write_alias_only() {
        let schema = IndexSchema::new("page", json!({}));
        let backend = MemoryBackend::with_generations(std::slice::from_ref(&schema), 1);

        let response = backend.rollover("page-write", &json!({})).await.unwrap();
        assert_eq!(response.new_index, "page-000002");
        assert_eq!(backend.targets("page-read"), vec!["page-000001"]);
        assert_eq!(backend.write_target("page-write").as_deref(), Some("page-000002"));
    }

    #[tokio::test]
    async fn test_failed_alias_update_is_atomic() {
        let schema = IndexSchema::new("page", json!({}));
        let backend = MemoryBackend::with_generations(std::slice::from_ref(&schema), 1);

        let err = backend
            .update_aliases(&[
                AliasAction::remove_index("page-000001"),
                AliasAction::remove_index("page-000009"),
            ])
            .await
            .unwrap_err();
        assert!(err.is_api_error());
        assert_eq!(backend.index_names(), vec!["page-000001"]);
    }
}
