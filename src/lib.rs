//! Food catalog ingestion core
//!
//! Maintains a unified catalog of restaurants, dishes/categories and scoped
//! attributes fed by high-volume social-media mentions. The crate provides:
//!
//! - typed accessors over entities and restaurant↔dish connections
//!   ([`repository`]),
//! - the contextual resolution engine that decides whether a dish entity is a
//!   menu item, a category or both, and which scoped attribute a word means
//!   ([`resolution`]),
//! - a batched, transactional, metered bulk writer with per-item failure
//!   capture ([`bulk`]),
//! - the translation of store failures into a closed error taxonomy
//!   ([`error`]).
//!
//! Persistence goes through the [`store::CatalogStore`] port. An in-memory
//! backend is always available; the Postgres backend lives behind the
//! `database` feature.

pub mod bulk;
pub mod config;
pub mod context;
pub mod error;
pub mod ingest;
pub mod models;
pub mod normalize;
pub mod repository;
pub mod resolution;
pub mod store;
pub mod telemetry;

pub use bulk::{BulkOperationMetrics, BulkWriteError, BulkWriteResult, BulkWriter, EntityInput};
pub use config::{BulkOperationConfig, CatalogConfig, ConfigError};
pub use context::OperationContext;
pub use error::{CatalogError, CatalogResult, ValidationError};
pub use ingest::{IngestionBatch, IngestionError, IngestionReport, IngestionRun};
pub use models::{
    ActivityLevel, Connection, ConnectionFields, ConnectionFilter, ConnectionMetrics, Entity,
    EntityFields, EntityType, Mention, MentionSource, NewMention,
};
pub use repository::{ConnectionRepository, EntityRepository};
pub use resolution::{AttributeScope, ContextualResolver};
pub use store::memory::MemoryStore;
pub use store::{CatalogOps, CatalogStore, StoreTransaction};
