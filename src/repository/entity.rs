//! Entity Store Accessor
//!
//! Typed create/read/update/delete for the four entity kinds. Per-kind field
//! rules are enforced before any store call; a request that fails them never
//! reaches the store.

use tracing::debug;
use uuid::Uuid;

use super::base::{by_id, context, not_found, Record, TranslateExt};
use crate::error::{CatalogResult, Operation, ValidationError};
use crate::models::{Entity, EntityCursor, EntityFields, EntityQuery, EntityType};
use crate::normalize::clean_name;
use crate::store::CatalogOps;

/// Entity accessor over any store or transaction handle.
pub struct EntityRepository<'a, S: CatalogOps + ?Sized> {
    store: &'a S,
}

impl<'a, S: CatalogOps + ?Sized> EntityRepository<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Validate `fields` for `kind` and insert a new entity.
    pub async fn create_typed(&self, kind: EntityType, fields: EntityFields) -> CatalogResult<Entity> {
        let draft = fields.into_new_entity(kind)?;
        debug!(kind = %kind, name = %draft.name, "Creating entity");
        let key = draft.natural_key();
        self.store
            .create_entity(&draft)
            .await
            .in_context(context::<Entity>(Operation::Create).with_key(key))
    }

    /// Validate and insert, or merge into the entity with the same `(type, name)`.
    pub async fn upsert_typed(&self, kind: EntityType, fields: EntityFields) -> CatalogResult<Entity> {
        let draft = fields.into_new_entity(kind)?;
        let key = draft.natural_key();
        self.store
            .upsert_entity(&draft)
            .await
            .in_context(context::<Entity>(Operation::Upsert).with_key(key))
    }

    pub async fn find_by_id(&self, entity_id: Uuid) -> CatalogResult<Option<Entity>> {
        self.store
            .find_entity(entity_id)
            .await
            .in_context(by_id::<Entity>(Operation::Read, entity_id))
    }

    /// Like [`Self::find_by_id`], but absence is an error.
    pub async fn get(&self, entity_id: Uuid) -> CatalogResult<Entity> {
        self.find_by_id(entity_id)
            .await?
            .ok_or_else(|| not_found::<Entity>(entity_id))
    }

    pub async fn find_by_type(&self, kind: EntityType, limit: Option<i64>) -> CatalogResult<Vec<Entity>> {
        let mut query = EntityQuery::of_kind(kind);
        query.limit = limit;
        self.find_many(&query).await
    }

    /// One keyset page of `kind`: up to `limit` rows past `after`, ordered
    /// by `(name, entity_id)`. Stable under concurrent inserts.
    pub async fn find_page(
        &self,
        kind: EntityType,
        limit: i64,
        after: Option<EntityCursor>,
    ) -> CatalogResult<Vec<Entity>> {
        self.find_many(&EntityQuery::of_kind(kind).after(after).limit(limit))
            .await
    }

    /// Case-insensitive substring on the name or exact alias match,
    /// optionally restricted to one kind.
    pub async fn find_by_name_or_alias(
        &self,
        term: &str,
        kind: Option<EntityType>,
    ) -> CatalogResult<Vec<Entity>> {
        let term = clean_name(term);
        if term.is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "term",
                reason: "must not be blank".to_string(),
            }
            .into());
        }
        self.find_many(&EntityQuery::default().kind_opt(kind).name_or_alias(term))
            .await
    }

    /// Case-insensitive exact name match within one kind.
    pub async fn find_by_name_ignore_case(
        &self,
        name: &str,
        kind: EntityType,
    ) -> CatalogResult<Vec<Entity>> {
        self.find_many(&EntityQuery::of_kind(kind).named_ignore_case(name))
            .await
    }

    pub async fn find_many(&self, query: &EntityQuery) -> CatalogResult<Vec<Entity>> {
        self.store
            .find_entities(query)
            .await
            .in_context(context::<Entity>(Operation::Read))
    }

    pub async fn count_by_type(&self, kind: EntityType) -> CatalogResult<u64> {
        self.store
            .count_entities(&EntityQuery::of_kind(kind))
            .await
            .in_context(context::<Entity>(Operation::Count))
    }

    /// Apply a partial update.
    ///
    /// With `expected_kind`, the field set is checked against that kind
    /// before touching the store, and the stored row must be of that kind.
    /// Without it, the field set is checked against the stored kind.
    pub async fn update_typed(
        &self,
        entity_id: Uuid,
        fields: EntityFields,
        expected_kind: Option<EntityType>,
    ) -> CatalogResult<Entity> {
        if let Some(kind) = expected_kind {
            fields.validate_patch(kind)?;
        }

        let current = self.get(entity_id).await?;
        match expected_kind {
            Some(expected) if current.entity_type != expected => {
                return Err(ValidationError::KindMismatch {
                    entity_id,
                    expected,
                    actual: current.entity_type,
                }
                .into());
            }
            Some(_) => {}
            None => fields.validate_patch(current.entity_type)?,
        }

        let fields = fields.normalized();
        debug!(entity_id = %entity_id, kind = %current.entity_type, "Updating entity");
        self.store
            .update_entity(entity_id, &fields)
            .await
            .in_context(by_id::<Entity>(Operation::Update, entity_id))
    }

    /// Delete an entity together with its connections and their mentions.
    pub async fn delete(&self, entity_id: Uuid) -> CatalogResult<()> {
        debug!(entity_id = %entity_id, "Deleting {}", Entity::RECORD);
        self.store
            .delete_entity(entity_id)
            .await
            .in_context(by_id::<Entity>(Operation::Delete, entity_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CatalogError;
    use crate::store::memory::MemoryStore;
    use strum::IntoEnumIterator;

    fn restaurant(name: &str) -> EntityFields {
        EntityFields::named(name)
            .with_address("1100 S Lamar Blvd")
            .with_coordinates(30.25, -97.76)
    }

    #[tokio::test]
    async fn test_missing_name_never_reaches_store() {
        let store = MemoryStore::new();
        let repo = EntityRepository::new(&store);
        for kind in EntityType::iter() {
            let err = repo
                .create_typed(kind, EntityFields::default())
                .await
                .unwrap_err();
            assert!(err.is_validation(), "{kind}: {err}");
        }
        assert_eq!(store.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_restaurant_location_round_trips() {
        let store = MemoryStore::new();
        let repo = EntityRepository::new(&store);
        let created = repo
            .create_typed(EntityType::Restaurant, restaurant("Uchi"))
            .await
            .unwrap();
        let loaded = repo.get(created.entity_id).await.unwrap();
        assert_eq!(loaded.latitude, Some(30.25));
        assert_eq!(loaded.longitude, Some(-97.76));
        assert_eq!(loaded.address.as_deref(), Some("1100 S Lamar Blvd"));
    }

    #[tokio::test]
    async fn test_duplicate_create_is_already_exists() {
        let store = MemoryStore::new();
        let repo = EntityRepository::new(&store);
        repo.create_typed(EntityType::DishOrCategory, EntityFields::named("Queso"))
            .await
            .unwrap();
        let err = repo
            .create_typed(EntityType::DishOrCategory, EntityFields::named("Queso"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::EntityAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_find_by_name_or_alias_orders_by_name() {
        let store = MemoryStore::new();
        let repo = EntityRepository::new(&store);
        for name in ["Ramen Tatsu-Ya", "Baked Ramen", "Pho"] {
            repo.create_typed(EntityType::DishOrCategory, EntityFields::named(name))
                .await
                .unwrap();
        }
        repo.create_typed(
            EntityType::DishOrCategory,
            EntityFields::named("Tonkotsu").with_aliases(["ramen"]),
        )
        .await
        .unwrap();

        let found = repo.find_by_name_or_alias("RAMEN", None).await.unwrap();
        let names: Vec<_> = found.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Baked Ramen", "Ramen Tatsu-Ya"]);

        let by_alias = repo
            .find_by_name_or_alias("ramen", Some(EntityType::DishOrCategory))
            .await
            .unwrap();
        assert_eq!(by_alias.len(), 3);
    }

    #[tokio::test]
    async fn test_name_search_folds_compatibility_characters() {
        let store = MemoryStore::new();
        let repo = EntityRepository::new(&store);
        repo.create_typed(EntityType::DishOrCategory, EntityFields::named("Ｋｏｒｅａｎ  ＢＢＱ"))
            .await
            .unwrap();

        assert_eq!(repo.find_by_name_or_alias("korean bbq", None).await.unwrap().len(), 1);
        assert_eq!(
            repo.find_by_name_ignore_case("KOREAN BBQ", EntityType::DishOrCategory)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_keyset_pages_survive_inserts_between_pages() {
        let store = MemoryStore::new();
        let repo = EntityRepository::new(&store);
        for name in ["Bao", "Curry", "Dumplings", "Empanadas"] {
            repo.create_typed(EntityType::DishOrCategory, EntityFields::named(name))
                .await
                .unwrap();
        }

        let first = repo
            .find_page(EntityType::DishOrCategory, 2, None)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        repo.create_typed(EntityType::DishOrCategory, EntityFields::named("Arepas"))
            .await
            .unwrap();

        let cursor = first.last().map(EntityCursor::after);
        let second = repo
            .find_page(EntityType::DishOrCategory, 2, cursor)
            .await
            .unwrap();
        let names: Vec<_> = first.iter().chain(&second).map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Bao", "Curry", "Dumplings", "Empanadas"]);
    }

    #[tokio::test]
    async fn test_update_with_foreign_fields_is_rejected_before_store() {
        let store = MemoryStore::new();
        let repo = EntityRepository::new(&store);
        let attr = repo
            .create_typed(EntityType::DishAttribute, EntityFields::named("Spicy"))
            .await
            .unwrap();
        store.reset_calls();

        let err = repo
            .update_typed(
                attr.entity_id,
                EntityFields::default().with_address("somewhere"),
                Some(EntityType::DishAttribute),
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(store.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_update_checks_stored_kind() {
        let store = MemoryStore::new();
        let repo = EntityRepository::new(&store);
        let dish = repo
            .create_typed(EntityType::DishOrCategory, EntityFields::named("Brisket"))
            .await
            .unwrap();

        let err = repo
            .update_typed(
                dish.entity_id,
                EntityFields::named("Moist Brisket"),
                Some(EntityType::Restaurant),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Validation(ValidationError::KindMismatch { .. })
        ));

        // Inferred kind: a dish cannot take restaurant fields.
        let err = repo
            .update_typed(dish.entity_id, EntityFields::default().with_quality_score(4.5), None)
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let renamed = repo
            .update_typed(dish.entity_id, EntityFields::named("  Moist   Brisket "), None)
            .await
            .unwrap();
        assert_eq!(renamed.name, "Moist Brisket");
    }

    #[tokio::test]
    async fn test_update_missing_entity_is_not_found() {
        let store = MemoryStore::new();
        let repo = EntityRepository::new(&store);
        let err = repo
            .update_typed(Uuid::new_v4(), EntityFields::named("x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::EntityNotFound { .. }));
    }

    #[tokio::test]
    async fn test_upsert_merges_by_natural_key() {
        let store = MemoryStore::new();
        let repo = EntityRepository::new(&store);
        let first = repo
            .upsert_typed(EntityType::Restaurant, restaurant("Suerte").with_aliases(["Suerte ATX"]))
            .await
            .unwrap();
        let second = repo
            .upsert_typed(
                EntityType::Restaurant,
                EntityFields::named("Suerte")
                    .with_address("1800 E 6th St")
                    .with_aliases(["suerte atx", "Suerte Austin"]),
            )
            .await
            .unwrap();
        assert_eq!(first.entity_id, second.entity_id);
        assert_eq!(second.aliases, vec!["Suerte ATX", "Suerte Austin"]);
        assert_eq!(second.address.as_deref(), Some("1800 E 6th St"));
        assert_eq!(store.entity_count().await, 1);
    }

    #[tokio::test]
    async fn test_delete_then_get_is_not_found() {
        let store = MemoryStore::new();
        let repo = EntityRepository::new(&store);
        let e = repo
            .create_typed(EntityType::RestaurantAttribute, EntityFields::named("Patio"))
            .await
            .unwrap();
        repo.delete(e.entity_id).await.unwrap();
        assert!(repo.find_by_id(e.entity_id).await.unwrap().is_none());
        assert!(matches!(
            repo.delete(e.entity_id).await.unwrap_err(),
            CatalogError::EntityNotFound { .. }
        ));
    }
}
