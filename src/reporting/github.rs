//! Reporter maintaining a long-lived tracking issue
//!
//! Every report refreshes the status marker in the issue title and the
//! automatic section of its description. Comments are only posted for
//! `Critical` outcomes, and for `Warning` outcomes that differ from what was
//! already said within the repeat window. The issue is closed while indexing
//! works and reopened when it fails for good. While an attempt runs, only
//! the title changes, to an in-progress marker.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use super::failure::{FailuresByLevel, Status};
use super::renderer::{
    REPORT_HEADER, in_progress_summary, insert_message_in_description, status_report,
    status_summary, truncate_for_max_length,
};
use super::{Result, StatusReporter};
use crate::clock::Clock;
use crate::providers::{IssueState, IssueTracker};

/// Publishes reports to an issue tracker
pub struct IssueStatusReporter {
    tracker: Arc<dyn IssueTracker>,
    clock: Arc<dyn Clock>,
    warning_repeat_delay: Duration,
}

impl IssueStatusReporter {
    /// Create a reporter; identical warning reports are not repeated within
    /// `warning_repeat_delay`
    #[must_use]
    pub fn new(
        tracker: Arc<dyn IssueTracker>,
        clock: Arc<dyn Clock>,
        warning_repeat_delay: Duration,
    ) -> Self {
        Self {
            tracker,
            clock,
            warning_repeat_delay,
        }
    }

    async fn already_reported_recently(&self, comment: &str) -> Result<bool> {
        let since = self
            .clock
            .now()
            .checked_sub_signed(self.warning_repeat_delay)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let comments = self.tracker.list_comments_since(since).await?;

        Ok(comments
            .iter()
            .filter(|c| c.created_at >= since && c.body.starts_with(REPORT_HEADER))
            .any(|c| c.body == comment))
    }
}

#[async_trait]
impl StatusReporter for IssueStatusReporter {
    async fn report(&self, status: Status, failures: &FailuresByLevel) -> Result<()> {
        info!("Reporting indexing status {} to the tracking issue", status);

        let issue = self.tracker.get_issue().await?;
        self.tracker
            .update_title(&status_summary(self.clock.now(), status, &issue.title))
            .await?;

        let report = status_report(status, failures, true);

        // Description first, so comment notifications point at an up-to-date issue
        self.tracker
            .update_body(&insert_message_in_description(issue.body.as_deref(), &report))
            .await?;

        let comment = truncate_for_max_length(&report, 0);
        match status {
            Status::Success | Status::Unstable => {}
            Status::Warning => {
                if self.already_reported_recently(&comment).await? {
                    info!("Skipping the issue comment as the same report was posted recently");
                } else {
                    self.tracker.post_comment(&comment).await?;
                }
            }
            Status::Critical => self.tracker.post_comment(&comment).await?,
        }

        match (status, issue.state) {
            (Status::Success | Status::Warning, IssueState::Open) => {
                info!("Closing the tracking issue as indexing succeeded");
                self.tracker.set_state(IssueState::Closed).await?;
            }
            (Status::Critical, IssueState::Closed) => {
                info!("Reopening the tracking issue due to critical failures");
                self.tracker.set_state(IssueState::Open).await?;
            }
            (Status::Unstable, _) => {
                info!("Leaving the tracking issue as it is pending retry");
            }
            _ => {}
        }

        Ok(())
    }

    async fn attempt_started(&self) -> Result<()> {
        let issue = self.tracker.get_issue().await?;
        self.tracker
            .update_title(&in_progress_summary(self.clock.now(), &issue.title))
            .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeTracker;
    use super::*;
    use crate::clock::ManualClock;
    use crate::reporting::failure::{Failure, Level, Stage};

    struct Fixture {
        clock: Arc<ManualClock>,
        tracker: Arc<FakeTracker>,
        reporter: IssueStatusReporter,
    }

    fn fixture(state: IssueState) -> Fixture {
        let clock = Arc::new(ManualClock::at("2024-05-01T10:00:00Z"));
        let tracker = Arc::new(FakeTracker::new(clock.clone(), "Docs indexing", state));
        let reporter = IssueStatusReporter::new(tracker.clone(), clock.clone(), Duration::days(1));
        Fixture {
            clock,
            tracker,
            reporter,
        }
    }

    fn warnings() -> FailuresByLevel {
        let mut failures = FailuresByLevel::new();
        failures.insert(
            Level::Warning,
            vec![Failure::new(Level::Warning, Stage::Parsing, "ja: page is not UTF-8")],
        );
        failures
    }

    fn critical() -> FailuresByLevel {
        let mut failures = warnings();
        failures.insert(
            Level::Critical,
            vec![Failure::new(Level::Critical, Stage::Indexing, "rollover failed")],
        );
        failures
    }

    #[tokio::test]
    async fn test_success_updates_title_and_closes() {
        let f = fixture(IssueState::Open);
        f.reporter.report(Status::Success, &FailuresByLevel::new()).await.unwrap();

        let issue = f.tracker.issue();
        assert_eq!(issue.title, "Docs indexing: Success (updated 2024-05-01T10:00:00Z)");
        assert_eq!(issue.state, IssueState::Closed);
        assert!(issue.body.unwrap().contains("> ## Indexing status: Success"));
        assert!(f.tracker.comment_bodies().is_empty());
    }

    #[tokio::test]
    async fn test_critical_comments_and_reopens() {
        let f = fixture(IssueState::Closed);
        f.reporter.report(Status::Critical, &critical()).await.unwrap();
        f.reporter.report(Status::Critical, &critical()).await.unwrap();

        let comments = f.tracker.comment_bodies();
        assert_eq!(comments.len(), 2);
        assert!(comments[0].starts_with("## Indexing status: Critical\n\n### CRITICAL\n"));
        assert_eq!(f.tracker.issue().state, IssueState::Open);
    }

    #[tokio::test]
    async fn test_unstable_leaves_issue_untouched() {
        let f = fixture(IssueState::Closed);
        f.reporter.report(Status::Unstable, &critical()).await.unwrap();

        let issue = f.tracker.issue();
        assert_eq!(issue.state, IssueState::Closed);
        assert!(issue.title.contains(": Unstable (updated"));
        assert!(f.tracker.comment_bodies().is_empty());
    }

    #[tokio::test]
    async fn test_attempt_start_only_marks_title() {
        let f = fixture(IssueState::Closed);
        let before = f.tracker.issue();

        f.reporter.attempt_started().await.unwrap();

        let issue = f.tracker.issue();
        assert_eq!(issue.title, "Docs indexing: InProgress (updated 2024-05-01T10:00:00Z)");
        assert_eq!(issue.state, IssueState::Closed);
        assert_eq!(issue.body, before.body);
        assert!(f.tracker.comment_bodies().is_empty());

        f.clock.advance(Duration::minutes(5));
        f.reporter.report(Status::Success, &FailuresByLevel::new()).await.unwrap();
        assert_eq!(
            f.tracker.issue().title,
            "Docs indexing: Success (updated 2024-05-01T10:05:00Z)"
        );
    }

    #[tokio::test]
    async fn test_repeat_window_beyond_calendar_range() {
        let clock = Arc::new(ManualClock::at("2024-05-01T10:00:00Z"));
        let tracker = Arc::new(FakeTracker::new(clock.clone(), "Docs indexing", IssueState::Open));
        let window = Duration::try_seconds(i64::MAX / 1000).unwrap();
        let reporter = IssueStatusReporter::new(tracker.clone(), clock.clone(), window);

        reporter.report(Status::Warning, &warnings()).await.unwrap();
        clock.advance(Duration::days(365));
        reporter.report(Status::Warning, &warnings()).await.unwrap();
        assert_eq!(tracker.comment_bodies().len(), 1);
    }

    #[tokio::test]
    async fn test_identical_warnings_are_deduplicated_within_window() {
        let f = fixture(IssueState::Open);

        f.reporter.report(Status::Warning, &warnings()).await.unwrap();
        f.clock.advance(Duration::hours(2));
        f.reporter.report(Status::Warning, &warnings()).await.unwrap();
        assert_eq!(f.tracker.comment_bodies().len(), 1);

        f.clock.advance(Duration::days(1) + Duration::minutes(1));
        f.reporter.report(Status::Warning, &warnings()).await.unwrap();
        assert_eq!(f.tracker.comment_bodies().len(), 2);
        assert_eq!(f.tracker.issue().state, IssueState::Closed);
    }

    #[tokio::test]
    async fn test_different_warning_is_posted() {
        let f = fixture(IssueState::Closed);
        f.reporter.report(Status::Warning, &warnings()).await.unwrap();

        let mut other = warnings();
        other
            .entry(Level::Warning)
            .or_default()
            .push(Failure::new(Level::Warning, Stage::Translation, "fr: missing source"));
        f.reporter.report(Status::Warning, &other).await.unwrap();

        assert_eq!(f.tracker.comment_bodies().len(), 2);
    }

    #[tokio::test]
    async fn test_description_keeps_manual_text() {
        let f = fixture(IssueState::Open);
        f.tracker.issue.lock().unwrap().body = Some("Maintained by the docs team.".to_string());

        f.reporter.report(Status::Warning, &warnings()).await.unwrap();
        f.reporter.report(Status::Success, &FailuresByLevel::new()).await.unwrap();

        let body = f.tracker.issue().body.unwrap();
        assert!(body.starts_with("Maintained by the docs team.\n<!-- Automatic message start -->"));
        assert!(body.contains("> ## Indexing status: Success"));
        assert!(!body.contains("Warning"));
        assert_eq!(body.matches("<!-- Automatic message start -->").count(), 1);
    }

    #[tokio::test]
    async fn test_tracker_errors_propagate() {
        let f = fixture(IssueState::Open);
        *f.tracker.fail.lock().unwrap() = true;

        let err = f.reporter.report(Status::Critical, &critical()).await.unwrap_err();
        assert!(err.to_string().contains("bad token"));
    }
}
