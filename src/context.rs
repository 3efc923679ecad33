//! Explicit per-call operation context
//!
//! Every public resolution and bulk call takes an [`OperationContext`]
//! instead of reading correlation data from ambient state, so independent
//! calls can run concurrently without sharing anything.

use tracing::{info_span, Span};
use uuid::Uuid;

/// Correlation id plus the tracing span that carries it.
#[derive(Debug, Clone)]
pub struct OperationContext {
    correlation_id: Uuid,
    operation: String,
    span: Span,
}

impl OperationContext {
    /// Start a new root context with a fresh correlation id.
    pub fn new(operation: impl Into<String>) -> Self {
        Self::with_correlation_id(Uuid::new_v4(), operation)
    }

    /// Continue a correlation id handed in by the caller (an ingestion job id, say).
    pub fn with_correlation_id(correlation_id: Uuid, operation: impl Into<String>) -> Self {
        let operation = operation.into();
        let span = info_span!(
            "catalog_operation",
            correlation_id = %correlation_id,
            operation = %operation,
        );
        Self {
            correlation_id,
            operation,
            span,
        }
    }

    /// A nested context sharing the correlation id; its span is a child of ours.
    pub fn child(&self, operation: impl Into<String>) -> Self {
        let operation = operation.into();
        let span = info_span!(
            parent: &self.span,
            "catalog_operation",
            correlation_id = %self.correlation_id,
            operation = %operation,
        );
        Self {
            correlation_id: self.correlation_id,
            operation,
            span,
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
