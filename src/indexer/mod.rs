//! Reindexing
//!
//! Coordinates one reindex attempt at a time:
//! - exclusion and failure collection ([`IndexingState`])
//! - alias-based generation swaps ([`IndexRollover`])
//! - batched document writes ([`BatchWriter`])
//! - orchestration with retries ([`IndexingService`])

pub mod batch;
pub mod rollover;
pub mod service;
pub mod state;

pub use batch::{BatchWriter, DocumentSink};
pub use rollover::{IndexGeneration, IndexRollover, RolloverAttempt};
pub use service::IndexingService;
pub use state::{IndexingAttempt, IndexingState};
