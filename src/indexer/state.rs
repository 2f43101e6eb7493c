//! Indexing attempt state
//!
//! A process runs at most one reindex at a time. [`IndexingState::try_start`]
//! claims the in-progress flag and hands out an [`IndexingAttempt`], which
//! collects failures until it is closed and reported.
//!
//! Attempts are numbered as they start, so a retry waiting out its delay can
//! tell whether another trigger ran in the meantime.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::reporting::{Failure, FailureCollector, FailuresByLevel, Level, Status, StatusReporter};

/// Process-wide reindex exclusion plus the reporter attempts end with
#[derive(Clone)]
pub struct IndexingState {
    in_progress: Arc<AtomicBool>,
    started: Arc<AtomicU64>,
    reporter: Arc<dyn StatusReporter>,
}

impl IndexingState {
    /// Create an idle state
    #[must_use]
    pub fn new(reporter: Arc<dyn StatusReporter>) -> Self {
        Self {
            in_progress: Arc::new(AtomicBool::new(false)),
            started: Arc::new(AtomicU64::new(0)),
            reporter,
        }
    }

    /// Whether an attempt is running
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Start an attempt, or fail immediately if one is running
    pub fn try_start(&self) -> Result<IndexingAttempt> {
        let guard = InProgressGuard::acquire(&self.in_progress).ok_or(Error::AlreadyInProgress)?;
        Ok(self.attempt(guard))
    }

    /// Start a retry of attempt number `previous`.
    ///
    /// Returns `None` if an attempt is running, or if any attempt started
    /// after `previous` did.
    pub fn try_restart(&self, previous: u64) -> Option<IndexingAttempt> {
        let guard = InProgressGuard::acquire(&self.in_progress)?;
        if self.started.load(Ordering::Acquire) != previous {
            return None;
        }
        Some(self.attempt(guard))
    }

    // Called with the flag held, so numbering follows the order attempts ran in
    fn attempt(&self, guard: InProgressGuard) -> IndexingAttempt {
        let sequence = self.started.fetch_add(1, Ordering::AcqRel) + 1;
        IndexingAttempt {
            failures: Mutex::new(FailuresByLevel::new()),
            reporter: self.reporter.clone(),
            sequence,
            guard: Some(guard),
        }
    }
}

/// Holds the in-progress flag; releases it when dropped
#[derive(Debug)]
struct InProgressGuard(Arc<AtomicBool>);

impl InProgressGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One reindex attempt in progress
pub struct IndexingAttempt {
    failures: Mutex<FailuresByLevel>,
    reporter: Arc<dyn StatusReporter>,
    sequence: u64,
    guard: Option<InProgressGuard>,
}

impl IndexingAttempt {
    /// Number of this attempt, counting from 1 for the process
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Let the reporter show the attempt as running; failures are only logged
    pub async fn report_started(&self) {
        if let Err(e) = self.reporter.attempt_started().await {
            warn!("Failed to report indexing start: {}", e);
        }
    }

    /// Failures recorded so far
    #[must_use]
    pub fn failures(&self) -> FailuresByLevel {
        self.lock().clone()
    }

    /// Status the failures recorded so far amount to
    #[must_use]
    pub fn status(&self) -> Status {
        Status::from_failures(&self.lock())
    }

    /// End the attempt and report its status
    pub async fn close(self) -> crate::reporting::Result<Status> {
        self.close_with(|status| status).await
    }

    /// End the attempt, reporting `map` applied to its status.
    ///
    /// The in-progress flag is released once the report is done, whether or
    /// not it succeeded.
    pub async fn close_with(
        mut self,
        map: impl FnOnce(Status) -> Status,
    ) -> crate::reporting::Result<Status> {
        let _guard = self.guard.take();
        let failures = mem::take(&mut *self.lock());
        let status = map(Status::from_failures(&failures));

        info!("Indexing attempt finished with status {}", status);
        self.reporter.report(status, &failures).await?;
        Ok(status)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FailuresByLevel> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FailureCollector for IndexingAttempt {
    fn collect(&self, failure: Failure) {
        match failure.level {
            Level::Critical => error!("{}", failure),
            Level::Warning => warn!("{}", failure),
        }
        self.lock().entry(failure.level).or_default().push(failure);
    }
}

impl Drop for IndexingAttempt {
    fn drop(&mut self) {
        // Closed attempts gave their guard away
        let Some(guard) = self.guard.take() else {
            return;
        };

        let failures = mem::take(&mut *self.lock());
        let status = Status::from_failures(&failures);
        let reporter = self.reporter.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Indexing attempt dropped without being closed, reporting in the background");
                handle.spawn(async move {
                    let _guard = guard;
                    if let Err(e) = reporter.report(status, &failures).await {
                        error!("Failed to report indexing status: {}", e);
                    }
                });
            }
            Err(_) => {
                error!("Indexing attempt dropped outside a runtime with status {}", status);
            }
        }
    }
}
