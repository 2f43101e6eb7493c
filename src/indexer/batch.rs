//! Batched, concurrent document writes against the current write generation

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::backend::{self, BulkOutcome, Document, SearchBackend};
use crate::error::{Error, Result};
use crate::reporting::{FailureCollector, Stage};

/// Receives the documents a content pipeline produces
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Queue a document for indexing
    async fn push(&self, document: Document) -> Result<()>;
}

type BulkTask = (String, backend::Result<BulkOutcome>);

struct Pending {
    batches: HashMap<String, Vec<Document>>,
    tasks: JoinSet<BulkTask>,
    indexed: usize,
}

/// Groups documents per entity type into bulk requests of `batch_size`,
/// running at most `parallelism` requests at once.
///
/// Rejected documents are recorded as indexing warnings; a failed request
/// fails the writer.
pub struct BatchWriter<'a> {
    backend: Arc<dyn SearchBackend>,
    targets: HashMap<String, String>,
    batch_size: usize,
    workers: Arc<Semaphore>,
    failures: &'a dyn FailureCollector,
    pending: Mutex<Pending>,
}

impl<'a> BatchWriter<'a> {
    /// Create a writer sending each entity type to the index in `targets`
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        targets: HashMap<String, String>,
        batch_size: usize,
        parallelism: usize,
        failures: &'a dyn FailureCollector,
    ) -> Self {
        Self {
            backend,
            targets,
            batch_size: batch_size.max(1),
            workers: Arc::new(Semaphore::new(parallelism.max(1))),
            failures,
            pending: Mutex::new(Pending {
                batches: HashMap::new(),
                tasks: JoinSet::new(),
                indexed: 0,
            }),
        }
    }

    /// Flush what is left, wait for every request and return the number of
    /// documents indexed
    pub async fn finish(self) -> Result<usize> {
        let mut pending = self.pending.into_inner();

        let leftovers: Vec<(String, Vec<Document>)> = pending.batches.drain().collect();
        for (entity_type, batch) in leftovers {
            if !batch.is_empty() {
                let permit = Self::worker(&self.workers).await?;
                Self::spawn_batch(
                    &self.backend,
                    permit,
                    &mut pending.tasks,
                    &self.targets,
                    &entity_type,
                    batch,
                )?;
            }
        }

        while let Some(joined) = pending.tasks.join_next().await {
            let indexed = match Self::settle(joined, self.failures) {
                Ok(indexed) => indexed,
                Err(e) => {
                    pending.tasks.abort_all();
                    while pending.tasks.join_next().await.is_some() {}
                    return Err(e);
                }
            };
            pending.indexed += indexed;
        }

        info!("Indexed {} documents.", pending.indexed);
        Ok(pending.indexed)
    }

    /// Waits while `parallelism` requests are in flight
    async fn worker(workers: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit> {
        workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Join(e.to_string()))
    }

    fn spawn_batch(
        backend: &Arc<dyn SearchBackend>,
        permit: OwnedSemaphorePermit,
        tasks: &mut JoinSet<BulkTask>,
        targets: &HashMap<String, String>,
        entity_type: &str,
        batch: Vec<Document>,
    ) -> Result<()> {
        let target = targets
            .get(entity_type)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no index for entity type '{entity_type}'")))?;
        let backend = backend.clone();

        tasks.spawn(async move {
            let _permit = permit;
            let result = backend.bulk_index(&target, &batch).await;
            (target, result)
        });
        Ok(())
    }

    fn settle(
        joined: std::result::Result<BulkTask, tokio::task::JoinError>,
        failures: &dyn FailureCollector,
    ) -> Result<usize> {
        let (target, result) = joined.map_err(|e| Error::Join(e.to_string()))?;
        let outcome = result.map_err(|e| Error::rollover(format!("Failed to write to {target}"), e))?;

        for rejected in &outcome.rejected {
            failures.warning(
                Stage::Indexing,
                &format!("Failed to index document {}: {}", rejected.id, rejected.reason),
            );
        }
        debug!("Wrote {} documents to {}", outcome.indexed, target);
        Ok(outcome.indexed)
    }
}

#[async_trait]
impl<'a> DocumentSink for BatchWriter<'a> {
    async fn push(&self, document: Document) -> Result<()> {
        if !self.targets.contains_key(&document.entity_type) {
            self.failures.warning(
                Stage::Indexing,
                &format!(
                    "Skipping document {}: no index for entity type '{}'",
                    document.id, document.entity_type
                ),
            );
            return Ok(());
        }

        let mut pending = self.pending.lock().await;

        // Surface failed requests early instead of after the whole run
        while let Some(joined) = pending.tasks.try_join_next() {
            let indexed = Self::settle(joined, self.failures)?;
            pending.indexed += indexed;
        }

        let entity_type = document.entity_type.clone();
        let batch = pending.batches.entry(entity_type.clone()).or_default();
        batch.push(document);
        if batch.len() < self.batch_size {
            return Ok(());
        }

        let batch = std::mem::take(batch);
        debug!("Queueing {} {} documents", batch.len(), entity_type);
        let permit = Self::worker(&self.workers).await?;
        Self::spawn_batch(
            &self.backend,
            permit,
            &mut pending.tasks,
            &self.targets,
            &entity_type,
            batch,
        )?;
        Ok(())
    }
}
