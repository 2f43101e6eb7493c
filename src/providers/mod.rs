//! Issue tracker providers.
//!
//! Status reports are published to a single long-lived issue. The
//! [`IssueTracker`] trait is the seam; [`GitHubIssueTracker`] talks to the
//! GitHub REST API.

pub mod base;
pub mod error;
pub mod github;

pub use base::{
    BaseProvider, Issue, IssueComment, IssueState, IssueTracker, ProviderConfig, RateLimiter,
};
pub use error::{ProviderError, Result};
pub use github::GitHubIssueTracker;
