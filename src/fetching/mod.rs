//! Content fetching
//!
//! Brings the primary documentation repository and every localized repository
//! onto local disk, in parallel and under a deadline, and keeps the resulting
//! handles cached between reindex attempts.

pub mod archive;
pub mod error;
pub mod fetcher;
pub mod repository;
pub mod source;

pub use error::{FetchError, Result};
pub use fetcher::{
    Cancellation, ContentFetcher, FetchedContent, FetchedSource, GitResolver, SourceResolver,
};
pub use repository::{LocalizedSources, RepositoryHandle, Surface, TreeRef, set_transport_timeouts};
pub use source::{BranchSet, SourceKey, SourceLocation, SourceSpec};
