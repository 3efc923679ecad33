//! Batched, transactional, metered writes
//!
//! See [`BulkWriter`]. A bulk call returns a [`BulkWriteResult`] even when
//! items fail; it returns an error only when a whole batch could not be
//! attempted or committed.

mod metrics;
mod orchestrator;
mod result;

pub use metrics::BulkOperationMetrics;
pub use orchestrator::{BulkWriter, EntityInput};
pub use result::{BulkItemError, BulkWriteError, BulkWriteResult};
