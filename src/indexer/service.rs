//! Reindex orchestration
//!
//! One attempt creates missing indexes, rolls every entity type over to a new
//! generation, fetches the sources, runs the content pipeline into the new
//! generation and commits. Critical attempts are retried after a delay.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::backend::{ElasticsearchBackend, ElasticsearchConfig, IndexSchema, SearchBackend};
use crate::clock::Clock;
use crate::config::{Config, IndexingConfig, RetryConfig};
use crate::error::Result;
use crate::fetching::{self, ContentFetcher, GitResolver, SourceSpec};
use crate::pipeline::{ContentPipeline, RawPagesPipeline};
use crate::reporting::{self, FailureCollector, Stage, Status, StatusReporter};

use super::batch::BatchWriter;
use super::rollover::{IndexRollover, RolloverAttempt};
use super::state::{IndexingAttempt, IndexingState};

/// Runs reindex attempts against one backend
pub struct IndexingService {
    state: IndexingState,
    rollover: IndexRollover,
    backend: Arc<dyn SearchBackend>,
    fetcher: Arc<ContentFetcher>,
    pipeline: Arc<dyn ContentPipeline>,
    sources: Vec<SourceSpec>,
    batch_size: usize,
    parallelism: usize,
    retry: RetryConfig,
}

impl IndexingService {
    /// Assemble a service from its collaborators
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        fetcher: Arc<ContentFetcher>,
        pipeline: Arc<dyn ContentPipeline>,
        reporter: Arc<dyn StatusReporter>,
        sources: Vec<SourceSpec>,
        config: &IndexingConfig,
    ) -> Self {
        let parallelism = if config.parallelism == 0 {
            num_cpus::get()
        } else {
            config.parallelism
        };

        Self {
            state: IndexingState::new(reporter),
            rollover: IndexRollover::new(backend.clone()),
            backend,
            fetcher,
            pipeline,
            sources,
            batch_size: config.batch_size,
            parallelism,
            retry: config.retry,
        }
    }

    /// Build the production service: Elasticsearch, git sources, raw pages
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let backend = ElasticsearchBackend::new(ElasticsearchConfig::from(&config.backend))?;
        fetching::set_transport_timeouts(
            config.fetching.connect_timeout(),
            config.fetching.read_timeout(),
        )?;
        let mut resolver = GitResolver::new(config.fetching.local_inspection);
        if let Some(dir) = &config.fetching.work_dir {
            resolver = resolver.with_work_dir(dir);
        }
        let fetcher = ContentFetcher::new(
            Arc::new(resolver),
            config.fetching.parallelism,
            config.fetching.timeout(),
            config.fetching.cache_repositories,
        );
        let reporter = reporting::create_reporter(&config.reporting, clock)?;

        Ok(Self::new(
            Arc::new(backend),
            Arc::new(fetcher),
            Arc::new(RawPagesPipeline::default()),
            reporter,
            config.source_specs()?,
            &config.indexing,
        ))
    }

    /// The in-progress flag shared by every trigger
    #[must_use]
    pub fn state(&self) -> &IndexingState {
        &self.state
    }

    /// Schemas of the entity types being indexed
    #[must_use]
    pub fn schemas(&self) -> Vec<IndexSchema> {
        self.pipeline.schemas()
    }

    /// Reindex in the foreground, retrying critical attempts
    pub async fn reindex(&self) -> Result<Status> {
        let attempt = self.state.try_start()?;
        Ok(self.run_attempts(attempt).await)
    }

    /// Claim the in-progress flag now and reindex in the background.
    ///
    /// Fails with [`crate::Error::AlreadyInProgress`] if an attempt is running.
    pub fn start_reindex(self: &Arc<Self>) -> Result<JoinHandle<Status>> {
        let attempt = self.state.try_start()?;
        let service = Arc::clone(self);
        Ok(tokio::spawn(async move { service.run_attempts(attempt).await }))
    }

    /// Repair aliases left inconsistent by an interrupted rollover
    pub async fn recover(&self) -> Result<bool> {
        self.rollover.recover(&self.schemas()).await
    }

    /// Release fetched repositories
    pub async fn shutdown(&self) {
        self.fetcher.shutdown().await;
    }

    async fn run_attempts(&self, first: IndexingAttempt) -> Status {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = first;
        let mut number = 1;

        loop {
            info!("Starting indexing attempt {}/{}", number, max_attempts);
            attempt.report_started().await;
            self.index_all(&attempt).await;

            let sequence = attempt.sequence();

            let critical = attempt.status() == Status::Critical;
            let retrying = critical && number < max_attempts;

            let (status, closed) = if retrying {
                attempt.warning(Stage::Indexing, "Indexing will be tried again later.");
                let closed = attempt
                    .close_with(|status| {
                        if status == Status::Critical {
                            Status::Unstable
                        } else {
                            status
                        }
                    })
                    .await;
                (Status::Unstable, closed)
            } else {
                if critical && max_attempts > 1 {
                    attempt.critical(
                        Stage::Indexing,
                        &format!("Tried {max_attempts} time(s), aborting"),
                    );
                }
                let status = attempt.status();
                (status, attempt.close().await)
            };
            if let Err(e) = closed {
                error!("Failed to report indexing status: {}", e);
            }

            if !retrying {
                return status;
            }

            info!("Retrying indexing in {}s", self.retry.delay_secs);
            tokio::time::sleep(self.retry.delay()).await;

            attempt = match self.state.try_restart(sequence) {
                Some(attempt) => attempt,
                None => {
                    info!("Another indexing attempt ran during the retry delay, dropping the retry");
                    return status;
                }
            };
            number += 1;
        }
    }

    async fn index_all(&self, attempt: &IndexingAttempt) {
        let schemas = self.schemas();

        if let Err(e) = self.rollover.ensure_initialized(&schemas).await {
            attempt.critical_with(Stage::Indexing, "Failed to create missing indexes", &e);
            return;
        }

        let mut rollover = match self.rollover.start(&schemas).await {
            Ok(rollover) => rollover,
            Err(e) => {
                attempt.critical_with(Stage::Indexing, "Failed to index data", &e);
                return;
            }
        };

        let outcome = match self.write_generation(&rollover, attempt).await {
            Ok(indexed) => rollover.commit().await.map(|()| indexed),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(indexed) => info!("Indexing finished with {} documents", indexed),
            Err(e) => attempt.critical_with(Stage::Indexing, "Failed to index data", &e),
        }

        if let Err(e) = rollover.close().await {
            attempt.critical_with(Stage::Indexing, "Failed to roll back the new generation", &e);
        }
    }

    async fn write_generation(
        &self,
        rollover: &RolloverAttempt,
        attempt: &IndexingAttempt,
    ) -> Result<usize> {
        let content = self.fetcher.fetch_all(&self.sources).await?;

        let targets: HashMap<String, String> = rollover
            .generations()
            .iter()
            .map(|generation| (generation.entity_type.clone(), generation.write_alias.clone()))
            .collect();
        let writer = BatchWriter::new(
            self.backend.clone(),
            targets,
            self.batch_size,
            self.parallelism,
            attempt,
        );

        self.pipeline.run(&content, &writer, attempt).await?;
        let indexed = writer.finish().await?;
        rollover.refresh().await?;
        Ok(indexed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::Error;
    use crate::backend::memory::MemoryBackend;
    use crate::fetching::BranchSet;
    use crate::fetching::repository::fixtures::site;
    use crate::reporting::{FailuresByLevel, Level};

    #[derive(Default)]
    struct RecordingReporter {
        reports: Mutex<Vec<(Status, FailuresByLevel)>>,
        started: AtomicUsize,
    }

    #[async_trait]
    impl StatusReporter for RecordingReporter {
        async fn attempt_started(&self) -> reporting::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn report(&self, status: Status, failures: &FailuresByLevel) -> reporting::Result<()> {
            self.reports.lock().unwrap().push((status, failures.clone()));
            Ok(())
        }
    }

    impl RecordingReporter {
        fn statuses(&self) -> Vec<Status> {
            self.reports.lock().unwrap().iter().map(|r| r.0).collect()
        }

        fn details(&self, report: usize, level: Level) -> Vec<String> {
            self.reports.lock().unwrap()[report]
                .1
                .get(&level)
                .map(|failures| failures.iter().map(|f| f.details.clone()).collect())
                .unwrap_or_default()
        }
    }

    struct Fixture {
        _site: tempfile::TempDir,
        backend: Arc<MemoryBackend>,
        reporter: Arc<RecordingReporter>,
        service: Arc<IndexingService>,
    }

    fn fixture(max_attempts: u32, delay_secs: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        site(
            dir.path(),
            &[
                ("index.html", "Home"),
                ("a.html", "A"),
                ("b.html", "B"),
            ],
        );
        let uri = dir.path().to_string_lossy().into_owned();
        fixture_at(dir, uri, max_attempts, delay_secs)
    }

    fn fixture_at(dir: tempfile::TempDir, uri: String, max_attempts: u32, delay_secs: u64) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let reporter = Arc::new(RecordingReporter::default());
        let fetcher = ContentFetcher::new(
            Arc::new(GitResolver::new(true)),
            2,
            Duration::from_secs(30),
            true,
        );
        let config = IndexingConfig {
            batch_size: 2,
            parallelism: 2,
            retry: RetryConfig {
                max_attempts,
                delay_secs,
            },
            ..Default::default()
        };

        let service = IndexingService::new(
            backend.clone(),
            Arc::new(fetcher),
            Arc::new(RawPagesPipeline::default()),
            reporter.clone(),
            vec![SourceSpec::primary(uri, BranchSet::default())],
            &config,
        );

        Fixture {
            _site: dir,
            backend,
            reporter,
            service: Arc::new(service),
        }
    }

    #[tokio::test]
    async fn test_reindex_fills_new_generation() {
        let f = fixture(3, 0);

        assert_eq!(f.service.reindex().await.unwrap(), Status::Success);
        assert_eq!(f.backend.targets("page-read"), vec!["page-000002"]);
        assert_eq!(f.backend.write_target("page-write").as_deref(), Some("page-000002"));
        assert_eq!(f.backend.index_names(), vec!["page-000002"]);
        assert_eq!(
            f.backend.document_ids("page-000002"),
            vec!["en:a.html", "en:b.html", "en:index.html"]
        );
        assert_eq!(f.reporter.statuses(), vec![Status::Success]);
        assert!(!f.service.state().is_in_progress());

        // Each run moves to the next generation
        f.service.reindex().await.unwrap();
        assert_eq!(f.backend.index_names(), vec!["page-000003"]);
    }

    #[tokio::test]
    async fn test_reindex_rejected_while_in_progress() {
        let f = fixture(1, 0);

        let running = f.service.state().try_start().unwrap();
        assert!(matches!(f.service.reindex().await, Err(Error::AlreadyInProgress)));
        assert!(matches!(f.service.start_reindex(), Err(Error::AlreadyInProgress)));
        running.close().await.unwrap();

        let handle = f.service.start_reindex().unwrap();
        assert_eq!(handle.await.unwrap(), Status::Success);
    }

    #[tokio::test]
    async fn test_failed_attempts_are_retried_then_abort() {
        let f = fixture(2, 0);
        f.service.reindex().await.unwrap();
        *f.backend.fail_bulk.lock().unwrap() = true;

        assert_eq!(f.service.reindex().await.unwrap(), Status::Critical);

        assert_eq!(
            f.reporter.statuses(),
            vec![Status::Success, Status::Unstable, Status::Critical]
        );
        assert!(
            f.reporter
                .details(1, Level::Warning)
                .contains(&"Indexing will be tried again later.".to_string())
        );
        let last = f.reporter.details(2, Level::Critical);
        assert!(last.contains(&"Failed to index data".to_string()));
        assert!(last.contains(&"Tried 2 time(s), aborting".to_string()));

        // The generation from the successful run keeps serving
        assert_eq!(f.backend.targets("page-read"), vec!["page-000002"]);
        assert_eq!(f.backend.write_target("page-write").as_deref(), Some("page-000002"));
        assert_eq!(f.backend.index_names(), vec!["page-000002"]);
    }

    #[tokio::test]
    async fn test_single_attempt_reports_critical_without_abort_message() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing").to_string_lossy().into_owned();
        let f = fixture_at(dir, missing, 1, 0);

        assert_eq!(f.service.reindex().await.unwrap(), Status::Critical);
        assert_eq!(
            f.reporter.details(0, Level::Critical),
            vec!["Failed to index data".to_string()]
        );
        // The generation created for the failed attempt is gone again
        assert_eq!(f.backend.index_names(), vec!["page-000001"]);
        assert_eq!(f.backend.targets("page-read"), vec!["page-000001"]);
    }

    #[tokio::test]
    async fn test_missing_indexes_failure_is_critical() {
        let f = fixture(1, 0);
        // Unaliased leftover blocking creation of the first generation
        f.backend.force_index("page-000001", &[]);

        assert_eq!(f.service.reindex().await.unwrap(), Status::Critical);
        assert_eq!(
            f.reporter.details(0, Level::Critical),
            vec!["Failed to create missing indexes".to_string()]
        );
        assert_eq!(f.backend.count_requests("rollover"), 0);
        assert_eq!(f.backend.count_requests("bulk"), 0);
    }

    #[tokio::test]
    async fn test_retry_dropped_when_another_attempt_started() {
        let f = fixture(3, 1);
        *f.backend.fail_bulk.lock().unwrap() = true;

        let handle = f.service.start_reindex().unwrap();

        let mut held = None;
        for _ in 0..500 {
            if let Ok(attempt) = f.service.state().try_start() {
                held = Some(attempt);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let held = held.unwrap();

        assert_eq!(handle.await.unwrap(), Status::Unstable);
        assert_eq!(f.reporter.statuses(), vec![Status::Unstable]);
        held.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_dropped_after_manual_success() {
        let f = fixture(3, 1);
        f.service.reindex().await.unwrap();
        *f.backend.fail_bulk.lock().unwrap() = true;

        let handle = f.service.start_reindex().unwrap();
        for _ in 0..500 {
            if f.reporter.statuses().len() == 2 && !f.service.state().is_in_progress() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.reporter.statuses(), vec![Status::Success, Status::Unstable]);

        // A manual trigger succeeds while the retry waits
        *f.backend.fail_bulk.lock().unwrap() = false;
        assert_eq!(f.service.reindex().await.unwrap(), Status::Success);

        assert_eq!(handle.await.unwrap(), Status::Unstable);
        assert_eq!(
            f.reporter.statuses(),
            vec![Status::Success, Status::Unstable, Status::Success]
        );
        assert_eq!(f.backend.index_names().len(), 1);
        assert!(!f.service.state().is_in_progress());
    }

    #[tokio::test]
    async fn test_each_attempt_marks_start() {
        let f = fixture(2, 0);
        f.service.reindex().await.unwrap();
        *f.backend.fail_bulk.lock().unwrap() = true;
        f.service.reindex().await.unwrap();

        assert_eq!(f.reporter.started.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recover_repairs_interrupted_rollover() {
        let f = fixture(1, 0);
        f.service.reindex().await.unwrap();
        f.backend.force_index("page-000003", &[("page-write", true)]);

        assert!(f.service.recover().await.unwrap());
        assert_eq!(f.backend.index_names(), vec!["page-000002"]);
        assert!(!f.service.recover().await.unwrap());
    }
}
