//! Contextual Resolution Engine
//!
//! A `dish_or_category` entity can be sold as a dish at one restaurant and
//! referenced as a category by others. Attributes are scoped: "Italian" as a
//! dish attribute and "Italian" as a restaurant attribute are two entities.
//! This module answers which role an entity plays and creates or reuses
//! scoped attributes without producing duplicates.

mod types;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::OperationContext;
use crate::error::{CatalogResult, ValidationError};
use crate::models::{ConnectionFilter, Entity, EntityCursor, EntityFields, EntityType};
use crate::normalize::{clean_name, fold_name};
use crate::repository::{ConnectionRepository, EntityRepository};
use crate::store::CatalogOps;

pub use types::{AttributeScope, CategoryContext, DualPurposeEntity, MenuItemContext};

/// Page size for the dual-purpose scan.
pub const DEFAULT_DUAL_PURPOSE_PAGE_SIZE: i64 = 500;

/// Resolution service over a shared store.
pub struct ContextualResolver<S: CatalogOps + ?Sized> {
    store: Arc<S>,
    page_size: i64,
}

impl<S: CatalogOps + ?Sized> Clone for ContextualResolver<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            page_size: self.page_size,
        }
    }
}

impl<S: CatalogOps + ?Sized> ContextualResolver<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            page_size: DEFAULT_DUAL_PURPOSE_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn entities(&self) -> EntityRepository<'_, S> {
        EntityRepository::new(&*self.store)
    }

    fn connections(&self) -> ConnectionRepository<'_, S> {
        ConnectionRepository::new(&*self.store)
    }

    /// Load `entity_id` and require it to be a `dish_or_category`.
    ///
    /// `Ok(None)` when the id does not exist; a validation error when it
    /// exists with another kind.
    async fn dish_or_category(&self, entity_id: Uuid) -> CatalogResult<Option<Entity>> {
        let Some(entity) = self.entities().find_by_id(entity_id).await? else {
            return Ok(None);
        };
        if !entity.is(EntityType::DishOrCategory) {
            return Err(ValidationError::KindMismatch {
                entity_id,
                expected: EntityType::DishOrCategory,
                actual: entity.entity_type,
            }
            .into());
        }
        Ok(Some(entity))
    }

    /// The entity as a menu item of `restaurant_id`, if it is sold there.
    #[instrument(skip(self, ctx), fields(correlation_id = %ctx.correlation_id()))]
    pub async fn get_entity_in_menu_context(
        &self,
        ctx: &OperationContext,
        dish_id: Uuid,
        restaurant_id: Uuid,
    ) -> CatalogResult<Option<MenuItemContext>> {
        let Some(entity) = self.dish_or_category(dish_id).await? else {
            debug!("Dish entity not found");
            return Ok(None);
        };
        let filter = ConnectionFilter::new()
            .restaurant(restaurant_id)
            .dish(dish_id)
            .menu_items()
            .limit(1);
        let connection = self.connections().find_many(&filter).await?.into_iter().next();
        Ok(connection.map(|connection| MenuItemContext { entity, connection }))
    }

    /// The entity as a category, with the number of connections listing it.
    #[instrument(skip(self, ctx), fields(correlation_id = %ctx.correlation_id()))]
    pub async fn get_entity_in_category_context(
        &self,
        ctx: &OperationContext,
        entity_id: Uuid,
    ) -> CatalogResult<Option<CategoryContext>> {
        let Some(entity) = self.dish_or_category(entity_id).await? else {
            return Ok(None);
        };
        let category_usage = self
            .connections()
            .count_by_category_membership(entity_id)
            .await?;
        Ok(Some(CategoryContext {
            entity,
            category_usage,
        }))
    }

    /// Scan every `dish_or_category` entity and keep those used both as a
    /// menu item and as a category.
    ///
    /// Costs two count queries per entity; meant for periodic jobs.
    #[instrument(skip(self, ctx), fields(correlation_id = %ctx.correlation_id()))]
    pub async fn find_dual_purpose_entities(
        &self,
        ctx: &OperationContext,
    ) -> CatalogResult<Vec<DualPurposeEntity>> {
        let entities = self.entities();
        let connections = self.connections();
        let mut found = Vec::new();
        let mut scanned = 0usize;
        let mut cursor = None;

        loop {
            let page = entities
                .find_page(EntityType::DishOrCategory, self.page_size, cursor.take())
                .await?;
            let page_len = page.len();
            scanned += page_len;
            cursor = page.last().map(EntityCursor::after);

            for entity in page {
                let id = entity.entity_id;
                let (menu_item_usage, category_usage) = tokio::try_join!(
                    connections.count_by_menu_item_usage(None, Some(id)),
                    connections.count_by_category_membership(id),
                )?;
                if menu_item_usage > 0 && category_usage > 0 {
                    found.push(DualPurposeEntity {
                        entity,
                        menu_item_usage,
                        category_usage,
                    });
                }
            }

            if (page_len as i64) < self.page_size {
                break;
            }
        }

        info!(scanned, dual_purpose = found.len(), "Dual-purpose scan complete");
        Ok(found)
    }

    /// Case-insensitive exact-name lookup restricted to the scope's kind.
    #[instrument(skip(self, ctx), fields(correlation_id = %ctx.correlation_id()))]
    pub async fn resolve_attributes_by_scope(
        &self,
        ctx: &OperationContext,
        name: &str,
        scope: AttributeScope,
    ) -> CatalogResult<Vec<Entity>> {
        self.lookup_attribute(name, scope).await
    }

    async fn lookup_attribute(&self, name: &str, scope: AttributeScope) -> CatalogResult<Vec<Entity>> {
        let name = clean_name(name);
        if name.is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "name",
                reason: "attribute name must not be blank".to_string(),
            }
            .into());
        }
        self.entities()
            .find_by_name_ignore_case(&name, scope.entity_type())
            .await
    }

    /// Reuse the scoped attribute named `name`, or create it with `aliases`.
    ///
    /// A concurrent caller may create the same attribute between our lookup
    /// and insert. The resulting unique violation is answered with one more
    /// lookup; only if that also comes back empty is the conflict returned.
    #[instrument(skip(self, ctx, aliases), fields(correlation_id = %ctx.correlation_id()))]
    pub async fn create_or_resolve_contextual_attribute(
        &self,
        ctx: &OperationContext,
        name: &str,
        scope: AttributeScope,
        aliases: &[String],
    ) -> CatalogResult<Entity> {
        if let Some(existing) = self.lookup_attribute(name, scope).await?.into_iter().next() {
            debug!(entity_id = %existing.entity_id, "Reusing scoped attribute");
            return Ok(existing);
        }

        let fields = EntityFields::named(name).with_aliases(aliases.iter().cloned());
        match self.entities().create_typed(scope.entity_type(), fields).await {
            Ok(created) => {
                debug!(entity_id = %created.entity_id, "Created scoped attribute");
                Ok(created)
            }
            Err(err) if err.is_conflict() => {
                warn!(error = %err, "Attribute created concurrently, resolving instead");
                self.lookup_attribute(name, scope)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Create-or-resolve each distinct name, in input order.
    ///
    /// Names are de-duplicated case-insensitively and blanks are skipped.
    #[instrument(skip(self, ctx, names), fields(correlation_id = %ctx.correlation_id(), count = names.len()))]
    pub async fn resolve_attribute_names(
        &self,
        ctx: &OperationContext,
        names: &[String],
        scope: AttributeScope,
    ) -> CatalogResult<Vec<Entity>> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for name in names {
            let key = fold_name(name);
            if key.is_empty() || !seen.insert(key) {
                continue;
            }
            resolved.push(
                self.create_or_resolve_contextual_attribute(ctx, name, scope, &[])
                    .await?,
            );
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CatalogError;
    use crate::models::ConnectionFields;
    use crate::store::memory::{ops, MemoryStore};
    use crate::store::{CatalogOps, StoreFailure};

    fn resolver() -> (Arc<MemoryStore>, ContextualResolver<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), ContextualResolver::new(store))
    }

    async fn restaurant(store: &MemoryStore, name: &str) -> Uuid {
        EntityRepository::new(store)
            .create_typed(
                EntityType::Restaurant,
                EntityFields::named(name).with_address("S Congress Ave"),
            )
            .await
            .unwrap()
            .entity_id
    }

    async fn dish(store: &MemoryStore, name: &str) -> Uuid {
        EntityRepository::new(store)
            .create_typed(EntityType::DishOrCategory, EntityFields::named(name))
            .await
            .unwrap()
            .entity_id
    }

    #[tokio::test]
    async fn test_menu_context_absent_connection_is_none() {
        let (store, resolver) = resolver();
        let ctx = OperationContext::new("test");
        let d = dish(&store, "Migas").await;
        let r = restaurant(&store, "Veracruz").await;
        assert!(resolver
            .get_entity_in_menu_context(&ctx, d, r)
            .await
            .unwrap()
            .is_none());

        // Unknown ids are also a plain miss.
        assert!(resolver
            .get_entity_in_menu_context(&ctx, Uuid::new_v4(), r)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_menu_context_finds_menu_connection() {
        let (store, resolver) = resolver();
        let ctx = OperationContext::new("test");
        let d = dish(&store, "Migas").await;
        let r = restaurant(&store, "Veracruz").await;
        ConnectionRepository::new(&*store)
            .upsert_by_pair(r, d, ConnectionFields::menu_item())
            .await
            .unwrap();

        let found = resolver
            .get_entity_in_menu_context(&ctx, d, r)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.entity.entity_id, d);
        assert!(found.connection.is_menu_item);
    }

    #[tokio::test]
    async fn test_wrong_kind_is_validation_error() {
        let (store, resolver) = resolver();
        let ctx = OperationContext::new("test");
        let r = restaurant(&store, "Odd Duck").await;
        let err = resolver
            .get_entity_in_category_context(&ctx, r)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Validation(ValidationError::KindMismatch { .. })
        ));
        assert!(resolver
            .get_entity_in_menu_context(&ctx, r, r)
            .await
            .unwrap_err()
            .is_validation());
    }

    #[tokio::test]
    async fn test_category_context_counts_membership() {
        let (store, resolver) = resolver();
        let ctx = OperationContext::new("test");
        let noodles = dish(&store, "Noodles").await;
        let pho = dish(&store, "Pho").await;
        let r1 = restaurant(&store, "Pho Thai Son").await;
        let r2 = restaurant(&store, "Lucky Robot").await;
        let connections = ConnectionRepository::new(&*store);
        for r in [r1, r2] {
            connections
                .upsert_by_pair(r, pho, ConnectionFields::menu_item().with_categories(vec![noodles]))
                .await
                .unwrap();
        }

        let ctx_result = resolver
            .get_entity_in_category_context(&ctx, noodles)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx_result.category_usage, 2);
        assert!(resolver
            .get_entity_in_category_context(&ctx, Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_dual_purpose_requires_both_usages() {
        let (store, resolver) = resolver();
        let resolver = resolver.with_page_size(1);
        let ctx = OperationContext::new("test");
        let tacos = dish(&store, "Tacos").await;
        let al_pastor = dish(&store, "Al Pastor Taco").await;
        let breakfast = dish(&store, "Breakfast").await;
        let r1 = restaurant(&store, "Torchy's").await;
        let r2 = restaurant(&store, "Valentina's").await;
        let connections = ConnectionRepository::new(&*store);

        // Tacos: sold at r1 and used as a category at r2.
        connections
            .upsert_by_pair(r1, tacos, ConnectionFields::menu_item())
            .await
            .unwrap();
        connections
            .upsert_by_pair(r2, al_pastor, ConnectionFields::menu_item().with_categories(vec![tacos]))
            .await
            .unwrap();
        // Breakfast: category only.
        connections
            .upsert_by_pair(r1, al_pastor, ConnectionFields::menu_item().with_categories(vec![breakfast]))
            .await
            .unwrap();

        let dual = resolver.find_dual_purpose_entities(&ctx).await.unwrap();
        assert_eq!(dual.len(), 1);
        assert_eq!(dual[0].entity.entity_id, tacos);
        assert_eq!(dual[0].menu_item_usage, 1);
        assert_eq!(dual[0].category_usage, 1);
    }

    #[tokio::test]
    async fn test_same_word_in_two_scopes_is_two_entities() {
        let (_store, resolver) = resolver();
        let ctx = OperationContext::new("test");
        let dish_attr = resolver
            .create_or_resolve_contextual_attribute(&ctx, "Italian", AttributeScope::Dish, &[])
            .await
            .unwrap();
        let restaurant_attr = resolver
            .create_or_resolve_contextual_attribute(&ctx, "Italian", AttributeScope::Restaurant, &[])
            .await
            .unwrap();
        assert_ne!(dish_attr.entity_id, restaurant_attr.entity_id);

        let as_dish = resolver
            .resolve_attributes_by_scope(&ctx, "italian", AttributeScope::Dish)
            .await
            .unwrap();
        let as_restaurant = resolver
            .resolve_attributes_by_scope(&ctx, "ITALIAN", AttributeScope::Restaurant)
            .await
            .unwrap();
        assert_eq!(as_dish.len(), 1);
        assert_eq!(as_restaurant.len(), 1);
        assert_ne!(as_dish[0].entity_id, as_restaurant[0].entity_id);
    }

    #[tokio::test]
    async fn test_create_then_reuse_attribute() {
        let (store, resolver) = resolver();
        let ctx = OperationContext::new("test");
        let aliases = vec!["Hot".to_string()];
        let first = resolver
            .create_or_resolve_contextual_attribute(&ctx, "Spicy", AttributeScope::Dish, &aliases)
            .await
            .unwrap();
        assert_eq!(first.entity_type, EntityType::DishAttribute);
        assert_eq!(first.aliases, aliases);

        let second = resolver
            .create_or_resolve_contextual_attribute(&ctx, "Spicy", AttributeScope::Dish, &aliases)
            .await
            .unwrap();
        assert_eq!(first.entity_id, second.entity_id);
        assert_eq!(store.entity_count().await, 1);
        assert_eq!(store.call_count(ops::ENTITY_CREATE), 1);
    }

    #[tokio::test]
    async fn test_create_race_recovers_by_lookup() {
        let (store, resolver) = resolver();
        let ctx = OperationContext::new("test");
        let racer = EntityFields::named("spicy")
            .into_new_entity(EntityType::DishAttribute)
            .unwrap();
        store.stage_concurrent_insert(racer);

        let resolved = resolver
            .create_or_resolve_contextual_attribute(&ctx, "Spicy", AttributeScope::Dish, &[])
            .await
            .unwrap();
        assert_eq!(resolved.name, "spicy");
        assert_eq!(store.entity_count().await, 1);
    }

    #[tokio::test]
    async fn test_non_conflict_failure_is_not_retried() {
        let (store, resolver) = resolver();
        let ctx = OperationContext::new("test");
        store.fail_next(ops::ENTITY_CREATE, StoreFailure::transient("connection reset"));
        let err = resolver
            .create_or_resolve_contextual_attribute(&ctx, "Smoky", AttributeScope::Dish, &[])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.call_count(ops::ENTITY_FIND_MANY), 1);
    }

    #[tokio::test]
    async fn test_resolve_attribute_names_dedupes_in_order() {
        let (store, resolver) = resolver();
        let ctx = OperationContext::new("test");
        let names: Vec<String> = ["Patio", "patio ", "", "Dog Friendly", "PATIO"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let resolved = resolver
            .resolve_attribute_names(&ctx, &names, AttributeScope::Restaurant)
            .await
            .unwrap();
        let got: Vec<_> = resolved.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(got, vec!["Patio", "Dog Friendly"]);
        assert_eq!(
            store
                .count_entities(&crate::models::EntityQuery::of_kind(
                    EntityType::RestaurantAttribute
                ))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_blank_attribute_name_is_rejected() {
        let (store, resolver) = resolver();
        let ctx = OperationContext::new("test");
        let err = resolver
            .resolve_attributes_by_scope(&ctx, "   ", AttributeScope::Dish)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(store.total_calls(), 0);
    }
}
