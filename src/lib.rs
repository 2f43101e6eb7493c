#![allow(
    clippy::collapsible_if,
    clippy::field_reassign_with_default,
    clippy::uninlined_format_args
)]
//! docsearch - zero-downtime reindexing for multi-locale documentation search
//!
//! This crate provides:
//! - **fetching**: parallel, cached fetching of the primary and localized git repositories
//! - **backend**: the Elasticsearch/OpenSearch client and index naming rules
//! - **indexer**: alias-based rollovers, the single-attempt guard and the retrying service
//! - **reporting**: failure collection and status reports to the log or a GitHub issue
//! - **server**: the administrative `/reindex` endpoint
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use docsearch::clock::SystemClock;
//! use docsearch::indexer::IndexingService;
//! use docsearch::Config;
//!
//! # async fn run() -> docsearch::Result<()> {
//! let config = Config::from_env()?;
//! let service = IndexingService::from_config(&config, Arc::new(SystemClock))?;
//!
//! let status = service.reindex().await?;
//! println!("Reindexing finished: {status}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod clock;
pub mod fetching;
pub mod indexer;
pub mod pipeline;
pub mod providers;
pub mod reporting;
pub mod server;

pub mod commands;
pub mod config;
pub mod error;

// Re-export the types most callers need
pub use indexer::{IndexingService, IndexingState};
pub use reporting::{Stage, Status, StatusReporter};

pub use config::Config;
pub use error::{Error, Result};
