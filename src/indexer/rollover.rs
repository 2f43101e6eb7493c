//! Zero-downtime index rollover
//!
//! Each entity type is served through a read alias and a write alias. A
//! rollover creates a new generation and moves only the write alias onto it,
//! so queries keep hitting the previous generation while the new one fills up.
//! Committing moves the read alias over and deletes the previous generation;
//! rolling back moves the write alias back and deletes the new one. Both are
//! single `_aliases` requests, which the backend applies atomically.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::backend::{AliasAction, AliasListing, IndexSchema, SearchBackend};
use crate::error::{Error, Result};

/// Old and new generation of one entity type during a rollover
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexGeneration {
    /// Entity type
    pub entity_type: String,
    /// Alias queries go through
    pub read_alias: String,
    /// Alias documents are written through
    pub write_alias: String,
    /// Generation serving reads until commit
    pub old_index: String,
    /// Generation receiving writes
    pub new_index: String,
}

/// Entry point for rollovers against one backend
#[derive(Clone)]
pub struct IndexRollover {
    backend: Arc<dyn SearchBackend>,
}

impl IndexRollover {
    /// Create a rollover driver
    #[must_use]
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self { backend }
    }

    /// Create the first generation of every entity type no alias points to yet.
    ///
    /// Returns the names of the created indexes.
    pub async fn ensure_initialized(&self, schemas: &[IndexSchema]) -> Result<Vec<String>> {
        info!("Creating missing indexes (if any)");
        let listing = self
            .backend
            .list_aliases()
            .await
            .map_err(|e| Error::rollover("Failed to create missing indexes", e))?;

        let mut created = Vec::new();
        for schema in schemas {
            if !aliased(&listing, schema).all().is_empty() {
                continue;
            }

            let name = schema.generation_name(1);
            let mut body = schema.index_body();
            let mut aliases = serde_json::Map::new();
            aliases.insert(schema.read_alias(), json!({ "is_write_index": false }));
            aliases.insert(schema.write_alias(), json!({ "is_write_index": true }));
            body["aliases"] = Value::Object(aliases);
            self.backend
                .create_index(&name, &body)
                .await
                .map_err(|e| Error::rollover(format!("Failed to create index {name}"), e))?;
            created.push(name);
        }
        Ok(created)
    }

    /// Roll every entity type over to a new generation.
    ///
    /// Either every type is rolled over or none is: types already rolled over
    /// are rolled back before a failure is returned.
    pub async fn start(&self, schemas: &[IndexSchema]) -> Result<RolloverAttempt> {
        info!("Starting index rollover");

        let mut generations = Vec::with_capacity(schemas.len());
        for schema in schemas {
            let write_alias = schema.write_alias();
            let mut body = schema.index_body();
            // Keeps the read alias off the new generation
            body["aliases"] = Value::Object(serde_json::Map::new());

            match self.backend.rollover(&write_alias, &body).await {
                Ok(response) => generations.push(IndexGeneration {
                    entity_type: schema.entity_type.clone(),
                    read_alias: schema.read_alias(),
                    write_alias,
                    old_index: response.old_index,
                    new_index: response.new_index,
                }),
                Err(e) => {
                    if !generations.is_empty() {
                        if let Err(rollback_err) = self
                            .backend
                            .update_aliases(&rollback_actions(&generations))
                            .await
                        {
                            error!(
                                "Failed to roll back partially started rollover: {}",
                                rollback_err
                            );
                        }
                    }
                    return Err(Error::rollover("Failed to start rollover", e));
                }
            }
        }

        Ok(RolloverAttempt {
            backend: self.backend.clone(),
            generations,
            done: false,
        })
    }

    /// Repair aliases left inconsistent by a process killed mid-rollover.
    ///
    /// Returns `false`, without touching the backend, when every entity type
    /// already has its aliases on a single generation.
    pub async fn recover(&self, schemas: &[IndexSchema]) -> Result<bool> {
        let listing = self
            .backend
            .list_aliases()
            .await
            .map_err(|e| Error::rollover("Failed to recover aliases", e))?;

        let mut actions = Vec::new();
        let mut recovered = Vec::new();
        for schema in schemas {
            let targets = aliased(&listing, schema);
            if !targets.is_inconsistent() {
                continue;
            }

            let all = targets.all();
            // The oldest read generation should still be complete; failing
            // that, keep the oldest one and hope for the best
            let Some(keep) = targets.read.first().or_else(|| all.first()).cloned() else {
                continue;
            };

            actions.push(AliasAction::add(&keep, schema.write_alias(), true));
            actions.push(AliasAction::add(&keep, schema.read_alias(), false));
            actions.extend(
                all.into_iter()
                    .filter(|name| *name != keep)
                    .map(AliasAction::remove_index),
            );
            recovered.push(schema.entity_type.clone());
        }

        if recovered.is_empty() {
            return Ok(false);
        }

        info!("Recovering index aliases for {:?}", recovered);
        self.backend.update_aliases(&actions).await.map_err(|e| {
            Error::rollover(format!("Failed to recover index aliases for {recovered:?}"), e)
        })?;
        Ok(true)
    }
}

/// Indexes an entity type's aliases currently point to
#[derive(Debug, Default)]
struct AliasTargets {
    read: BTreeSet<String>,
    write: BTreeSet<String>,
}

impl AliasTargets {
    fn all(&self) -> BTreeSet<String> {
        self.read.union(&self.write).cloned().collect()
    }

    fn is_inconsistent(&self) -> bool {
        let all = self.all();
        all.len() > 1 || (!all.is_empty() && self.read != self.write)
    }
}

fn aliased(listing: &AliasListing, schema: &IndexSchema) -> AliasTargets {
    let read_alias = schema.read_alias();
    let write_alias = schema.write_alias();

    let mut targets = AliasTargets::default();
    for (index, aliases) in listing {
        for (alias, metadata) in &aliases.aliases {
            if *alias == read_alias {
                targets.read.insert(index.clone());
            } else if *alias == write_alias && metadata.is_write_index != Some(false) {
                // A generation demoted by a rollover keeps the alias as non-write
                targets.write.insert(index.clone());
            }
        }
    }
    targets
}

fn commit_actions(generations: &[IndexGeneration]) -> Vec<AliasAction> {
    generations
        .iter()
        .flat_map(|g| {
            [
                AliasAction::add(&g.new_index, &g.read_alias, false),
                AliasAction::remove_index(&g.old_index),
            ]
        })
        .collect()
}

fn rollback_actions(generations: &[IndexGeneration]) -> Vec<AliasAction> {
    generations
        .iter()
        .flat_map(|g| {
            [
                AliasAction::add(&g.old_index, &g.write_alias, true),
                AliasAction::remove_index(&g.new_index),
            ]
        })
        .collect()
}

/// A started rollover.
///
/// Must end with [`commit`](Self::commit), [`rollback`](Self::rollback) or
/// [`close`](Self::close). Dropping an unfinished attempt rolls it back in the
/// background.
pub struct RolloverAttempt {
    backend: Arc<dyn SearchBackend>,
    generations: Vec<IndexGeneration>,
    done: bool,
}

impl std::fmt::Debug for RolloverAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RolloverAttempt")
            .field("generations", &self.generations)
            .field("done", &self.done)
            .finish()
    }
}

impl RolloverAttempt {
    /// Generations involved, one per entity type
    #[must_use]
    pub fn generations(&self) -> &[IndexGeneration] {
        &self.generations
    }

    /// Write alias of `entity_type`, if it takes part in this rollover
    #[must_use]
    pub fn write_alias(&self, entity_type: &str) -> Option<&str> {
        self.generations
            .iter()
            .find(|g| g.entity_type == entity_type)
            .map(|g| g.write_alias.as_str())
    }

    /// Whether the attempt was committed or rolled back
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Make everything written so far searchable
    pub async fn refresh(&self) -> Result<()> {
        info!("Refreshing indexes...");
        for generation in &self.generations {
            self.backend
                .refresh(&generation.write_alias)
                .await
                .map_err(|e| {
                    Error::rollover(format!("Failed to refresh {}", generation.write_alias), e)
                })?;
        }
        Ok(())
    }

    /// Point read aliases at the new generations and delete the old ones
    pub async fn commit(&mut self) -> Result<()> {
        info!("Committing index rollover");
        self.backend
            .update_aliases(&commit_actions(&self.generations))
            .await
            .map_err(|e| Error::rollover("Failed to commit rollover", e))?;
        self.done = true;
        Ok(())
    }

    /// Point write aliases back at the old generations and delete the new ones
    pub async fn rollback(&mut self) -> Result<()> {
        info!("Rolling back index rollover");
        self.backend
            .update_aliases(&rollback_actions(&self.generations))
            .await
            .map_err(|e| Error::rollover("Failed to rollback rollover", e))?;
        self.done = true;
        Ok(())
    }

    /// Finish the attempt, rolling back unless it was committed
    pub async fn close(mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.rollback().await
    }
}

impl Drop for RolloverAttempt {
    fn drop(&mut self) {
        if self.done || self.generations.is_empty() {
            return;
        }

        let actions = rollback_actions(&self.generations);
        let backend = self.backend.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Rollover dropped before completion, rolling back in the background");
                handle.spawn(async move {
                    if let Err(e) = backend.update_aliases(&actions).await {
                        error!("Background rollback failed: {}", e);
                    }
                });
            }
            Err(_) => {
                error!("Rollover dropped outside a runtime; aliases are left for recovery");
            }
        }
    }
}
