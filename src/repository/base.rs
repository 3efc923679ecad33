//! Shared accessor plumbing
//!
//! Accessors are composed from a [`Record`] description and the
//! [`TranslateExt`] helpers rather than inherited from a generic repository:
//! each one is "typed store calls + kind-specific validation".

use uuid::Uuid;

use crate::error::{translate, CatalogError, CatalogResult, ErrorContext, Operation};
use crate::models::{Connection, Entity, Mention};
use crate::store::StoreResult;

/// A stored record kind: its name in errors and its primary-key column.
pub trait Record {
    const RECORD: &'static str;
    const PRIMARY_KEY: &'static str;
}

impl Record for Entity {
    const RECORD: &'static str = "entity";
    const PRIMARY_KEY: &'static str = "entity_id";
}

impl Record for Connection {
    const RECORD: &'static str = "connection";
    const PRIMARY_KEY: &'static str = "connection_id";
}

impl Record for Mention {
    const RECORD: &'static str = "mention";
    const PRIMARY_KEY: &'static str = "mention_id";
}

/// Error context for an operation on record kind `R`.
pub fn context<R: Record>(operation: Operation) -> ErrorContext {
    ErrorContext::new(R::RECORD, operation)
}

/// Error context keyed by primary key.
pub fn by_id<R: Record>(operation: Operation, id: Uuid) -> ErrorContext {
    ErrorContext::new(R::RECORD, operation).with_key(format!("{}={id}", R::PRIMARY_KEY))
}

/// Not-found error for a primary-key lookup that came back empty.
pub fn not_found<R: Record>(id: Uuid) -> CatalogError {
    CatalogError::EntityNotFound {
        record: R::RECORD,
        key: format!("{}={id}", R::PRIMARY_KEY),
    }
}

/// Translate store failures at the accessor boundary.
pub trait TranslateExt<T> {
    fn in_context(self, ctx: ErrorContext) -> CatalogResult<T>;
}

impl<T> TranslateExt<T> for StoreResult<T> {
    fn in_context(self, ctx: ErrorContext) -> CatalogResult<T> {
        self.map_err(|failure| translate(failure, &ctx))
    }
}
