//! Failures collected during an indexing attempt and the status derived from them

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

/// How serious a failure is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Level {
    /// Prevents the attempt from producing a usable index
    Critical,
    /// The index is usable but incomplete or incorrect
    Warning,
}

impl Level {
    /// Upper-case name used in reports
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::Warning => "WARNING",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Reading or extracting content
    Parsing,
    /// Matching localized content with its source
    Translation,
    /// Talking to the search backend
    Indexing,
}

impl Stage {
    /// Every stage, in report order
    pub const ALL: [Stage; 3] = [Stage::Parsing, Stage::Translation, Stage::Indexing];

    /// Upper-case name used in reports
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parsing => "PARSING",
            Self::Translation => "TRANSLATION",
            Self::Indexing => "INDEXING",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rendered form of the error behind a failure
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailureCause {
    /// The error's own message
    pub summary: String,
    /// Messages of the errors that caused it, outermost first
    pub chain: Vec<String>,
}

impl FailureCause {
    /// Capture an error and its source chain
    #[must_use]
    pub fn from_error(error: &(dyn StdError + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        Self {
            summary: error.to_string(),
            chain,
        }
    }
}

/// One recorded failure
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Failure {
    /// Severity
    pub level: Level,
    /// Stage it happened in
    pub stage: Stage,
    /// Human-readable description
    pub details: String,
    /// Underlying error, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
}

impl Failure {
    /// Create a failure without a cause
    pub fn new(level: Level, stage: Stage, details: impl Into<String>) -> Self {
        Self {
            level,
            stage,
            details: details.into(),
            cause: None,
        }
    }

    /// Attach the error that caused this failure
    #[must_use]
    pub fn with_cause(mut self, error: &(dyn StdError + 'static)) -> Self {
        self.cause = Some(FailureCause::from_error(error));
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage, self.details)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause.summary)?;
        }
        Ok(())
    }
}

/// Failures of one attempt, grouped by level (critical first)
pub type FailuresByLevel = BTreeMap<Level, Vec<Failure>>;

/// Outcome of an indexing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// No failures
    Success,
    /// Only warnings
    Warning,
    /// Critical failures, but another attempt is scheduled
    Unstable,
    /// Critical failures and no retry left
    Critical,
}

impl Status {
    /// Status implied by a set of failures; never `Unstable`
    #[must_use]
    pub fn from_failures(failures: &FailuresByLevel) -> Self {
        let has = |level: Level| failures.get(&level).is_some_and(|list| !list.is_empty());

        if has(Level::Critical) {
            Self::Critical
        } else if has(Level::Warning) {
            Self::Warning
        } else {
            Self::Success
        }
    }

    /// Capitalized name used in reports
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Warning => "Warning",
            Self::Unstable => "Unstable",
            Self::Critical => "Critical",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for failures found while indexing.
///
/// Implementations must be safe to call from concurrent workers.
pub trait FailureCollector: Send + Sync {
    /// Record a failure
    fn collect(&self, failure: Failure);

    /// Record a warning
    fn warning(&self, stage: Stage, details: &str) {
        self.collect(Failure::new(Level::Warning, stage, details));
    }

    /// Record a warning caused by `error`
    fn warning_with(&self, stage: Stage, details: &str, error: &(dyn StdError + 'static)) {
        self.collect(Failure::new(Level::Warning, stage, details).with_cause(error));
    }

    /// Record a critical failure
    fn critical(&self, stage: Stage, details: &str) {
        self.collect(Failure::new(Level::Critical, stage, details));
    }

    /// Record a critical failure caused by `error`
    fn critical_with(&self, stage: Stage, details: &str, error: &(dyn StdError + 'static)) {
        self.collect(Failure::new(Level::Critical, stage, details).with_cause(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failures(list: &[Failure]) -> FailuresByLevel {
        let mut map = FailuresByLevel::new();
        for failure in list {
            map.entry(failure.level).or_default().push(failure.clone());
        }
        map
    }

    #[test]
    fn test_status_success_when_empty() {
        assert_eq!(Status::from_failures(&FailuresByLevel::new()), Status::Success);

        let mut with_empty_lists = FailuresByLevel::new();
        with_empty_lists.insert(Level::Critical, Vec::new());
        with_empty_lists.insert(Level::Warning, Vec::new());
        assert_eq!(Status::from_failures(&with_empty_lists), Status::Success);
    }

    #[test]
    fn test_status_warning() {
        let map = failures(&[Failure::new(Level::Warning, Stage::Parsing, "bad page")]);
        assert_eq!(Status::from_failures(&map), Status::Warning);
    }

    #[test]
    fn test_status_critical_wins_regardless_of_order() {
        let a = Failure::new(Level::Warning, Stage::Parsing, "a");
        let b = Failure::new(Level::Critical, Stage::Indexing, "b");
        let c = Failure::new(Level::Warning, Stage::Indexing, "c");

        let forward = failures(&[a.clone(), b.clone(), c.clone()]);
        let backward = failures(&[c, b, a]);
        assert_eq!(Status::from_failures(&forward), Status::Critical);
        assert_eq!(Status::from_failures(&backward), Status::Critical);
    }

    #[test]
    fn test_levels_sort_critical_first() {
        let mut levels = vec![Level::Warning, Level::Critical];
        levels.sort();
        assert_eq!(levels, vec![Level::Critical, Level::Warning]);
    }

    #[test]
    fn test_failure_ordering() {
        let mut list = vec![
            Failure::new(Level::Warning, Stage::Indexing, "a"),
            Failure::new(Level::Warning, Stage::Parsing, "z"),
            Failure::new(Level::Warning, Stage::Parsing, "b"),
        ];
        list.sort();
        let details: Vec<&str> = list.iter().map(|f| f.details.as_str()).collect();
        assert_eq!(details, vec!["b", "z", "a"]);
    }

    #[test]
    fn test_cause_captures_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("outer")]
        struct Outer(#[source] std::io::Error);

        let err = Outer(std::io::Error::other("inner"));
        let cause = FailureCause::from_error(&err);
        assert_eq!(cause.summary, "outer");
        assert_eq!(cause.chain, vec!["inner".to_string()]);
    }

    #[test]
    fn test_failure_display() {
        let io = std::io::Error::other("disk full");
        let failure = Failure::new(Level::Critical, Stage::Indexing, "write failed").with_cause(&io);
        assert_eq!(failure.to_string(), "[INDEXING] write failed: disk full");
    }

    #[test]
    fn test_status_names() {
        assert_eq!(Status::Unstable.to_string(), "Unstable");
        assert_eq!(Level::Critical.to_string(), "CRITICAL");
        assert_eq!(Stage::Translation.to_string(), "TRANSLATION");
    }
}
