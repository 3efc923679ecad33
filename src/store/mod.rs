//! Persistence port for the catalog
//!
//! The ingestion core operates exclusively through these traits, so the
//! backend is pluggable: [`memory::MemoryStore`] in-process and for tests,
//! `postgres::PgCatalogStore` (feature `database`) in production.
//!
//! [`CatalogOps`] is the per-kind operation set. It is implemented both by
//! stores and by the transaction handles they hand out from
//! [`CatalogStore::begin`], so accessors are written once and run against
//! either.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    Connection, ConnectionFilter, ConnectionPatch, Entity, EntityFields, EntityQuery, Mention,
    MentionFilter, NewConnection, NewEntity, NewMention,
};

pub mod failure;
pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use failure::{FailureCode, StoreFailure, StoreResult};

/// Constraint names shared by every backend and by error translation.
pub mod constraints {
    pub const ENTITY_NAME_TYPE: &str = "entities_name_type_key";
    pub const ENTITY_ATTRIBUTE_NAME_CI: &str = "entities_attribute_name_ci_key";
    pub const ENTITY_GOOGLE_PLACE_ID: &str = "entities_google_place_id_key";
    pub const CONNECTION_PAIR: &str = "connections_restaurant_dish_key";
    pub const CONNECTION_RESTAURANT_FK: &str = "connections_restaurant_id_fkey";
    pub const CONNECTION_DISH_FK: &str = "connections_dish_or_category_id_fkey";
    pub const CONNECTION_CATEGORIES_FK: &str = "connections_categories_fkey";
    pub const CONNECTION_DISH_ATTRIBUTES_FK: &str = "connections_dish_attributes_fkey";
    pub const MENTION_SOURCE: &str = "mentions_connection_source_key";
    pub const MENTION_CONNECTION_FK: &str = "mentions_connection_id_fkey";
}

/// Per-kind operations available on a store or inside a transaction.
#[async_trait]
pub trait CatalogOps: Send + Sync {
    // ── Entities ──

    async fn create_entity(&self, draft: &NewEntity) -> StoreResult<Entity>;
    /// Insert many rows in one statement. With `skip_duplicates`, rows that
    /// collide on a unique key are skipped. Returns the number inserted.
    async fn create_entities(&self, drafts: &[NewEntity], skip_duplicates: bool)
        -> StoreResult<u64>;
    /// Insert, or merge into the row with the same `(type, name)`.
    async fn upsert_entity(&self, draft: &NewEntity) -> StoreResult<Entity>;
    async fn find_entity(&self, entity_id: Uuid) -> StoreResult<Option<Entity>>;
    async fn find_entities(&self, query: &EntityQuery) -> StoreResult<Vec<Entity>>;
    async fn update_entity(&self, entity_id: Uuid, fields: &EntityFields) -> StoreResult<Entity>;
    /// Delete an entity; its connections and their mentions cascade.
    async fn delete_entity(&self, entity_id: Uuid) -> StoreResult<()>;
    async fn count_entities(&self, query: &EntityQuery) -> StoreResult<u64>;

    // ── Connections ──

    async fn create_connection(&self, draft: &NewConnection) -> StoreResult<Connection>;
    async fn create_connections(
        &self,
        drafts: &[NewConnection],
        skip_duplicates: bool,
    ) -> StoreResult<u64>;
    /// Insert, or merge monotonically into the row for the same pair.
    async fn upsert_connection(&self, draft: &NewConnection) -> StoreResult<Connection>;
    async fn find_connection(&self, connection_id: Uuid) -> StoreResult<Option<Connection>>;
    async fn find_connections(&self, filter: &ConnectionFilter) -> StoreResult<Vec<Connection>>;
    /// Overwrite fields verbatim. Metrics may decrease through this path.
    async fn update_connection(
        &self,
        connection_id: Uuid,
        patch: &ConnectionPatch,
    ) -> StoreResult<Connection>;
    async fn count_connections(&self, filter: &ConnectionFilter) -> StoreResult<u64>;

    // ── Mentions (append-only) ──

    async fn create_mention(&self, draft: &NewMention) -> StoreResult<Mention>;
    async fn create_mentions(&self, drafts: &[NewMention], skip_duplicates: bool)
        -> StoreResult<u64>;
    async fn find_mentions(&self, filter: &MentionFilter) -> StoreResult<Vec<Mention>>;
    async fn count_mentions(&self, filter: &MentionFilter) -> StoreResult<u64>;
}

/// A transaction-scoped handle. Dropping it without committing rolls back.
#[async_trait]
pub trait StoreTransaction: CatalogOps {
    /// The handle as a plain operation set.
    fn as_ops(&self) -> &dyn CatalogOps;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// A transactional store.
#[async_trait]
pub trait CatalogStore: CatalogOps {
    /// Open a transaction. The handle is exclusively owned by its caller.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;
}
