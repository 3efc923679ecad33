use thiserror::Error;

use super::metrics::BulkOperationMetrics;
use crate::config::ConfigError;
use crate::error::CatalogError;

/// One item that could not be written.
#[derive(Debug)]
pub struct BulkItemError {
    /// Position in the caller's input.
    pub index: usize,
    pub batch_index: usize,
    pub error: CatalogError,
}

/// Outcome of a bulk call whose batches all completed.
#[derive(Debug)]
pub struct BulkWriteResult {
    pub success_count: usize,
    pub failure_count: usize,
    /// In input order.
    pub errors: Vec<BulkItemError>,
    pub metrics: BulkOperationMetrics,
}

impl BulkWriteResult {
    pub fn is_complete_success(&self) -> bool {
        self.failure_count == 0
    }

    /// Input positions of the failed items.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.errors.iter().map(|e| e.index).collect()
    }
}

/// Failures that stop a bulk call. Per-item failures never do.
#[derive(Debug, Error)]
pub enum BulkWriteError {
    #[error("invalid bulk configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The batch's unit of work could not be opened or committed. Batches
    /// before `batch_index` are committed; nothing from this one is visible.
    #[error("batch {batch_index} aborted: {source}")]
    BatchAborted {
        batch_index: usize,
        #[source]
        source: CatalogError,
    },
}

impl BulkWriteError {
    /// Whether the whole call may be retried as is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidConfig(_) => false,
            Self::BatchAborted { source, .. } => source.is_retryable(),
        }
    }
}
