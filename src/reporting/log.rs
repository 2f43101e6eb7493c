//! Reporter writing the status summary to the application log

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::failure::{FailuresByLevel, Status};
use super::renderer::{status_details, status_summary};
use super::{Result, StatusReporter};
use crate::clock::Clock;

const SUMMARY_TITLE: &str = "Indexing status";

/// Logs a grouped summary at a level matching the status
pub struct LogStatusReporter {
    clock: Arc<dyn Clock>,
}

impl LogStatusReporter {
    /// Create a log reporter
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Text that [`StatusReporter::report`] logs, or `None` when there is nothing to say
    #[must_use]
    pub fn render(&self, status: Status, failures: &FailuresByLevel) -> Option<String> {
        if failures.values().all(Vec::is_empty) {
            return None;
        }

        let mut summary = status_summary(self.clock.now(), status, SUMMARY_TITLE);
        status_details(&mut summary, failures, false);
        Some(summary)
    }
}

#[async_trait]
impl StatusReporter for LogStatusReporter {
    async fn report(&self, status: Status, failures: &FailuresByLevel) -> Result<()> {
        let Some(summary) = self.render(status, failures) else {
            return Ok(());
        };

        match status {
            Status::Success => info!("{}", summary),
            Status::Warning | Status::Unstable => warn!("{}", summary),
            Status::Critical => error!("{}", summary),
        }
        Ok(())
    }
}
