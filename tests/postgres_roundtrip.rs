//! Postgres backend round-trip tests
//!
//! Requires: DATABASE_URL environment variable and `database` feature.
//! Run with `cargo test --features database -- --ignored`.

#![cfg(feature = "database")]

use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;

use food_catalog::bulk::EntityInput;
use food_catalog::config::DatabaseConfig;
use food_catalog::store::postgres::PgCatalogStore;
use food_catalog::{
    AttributeScope, BulkOperationConfig, BulkWriter, CatalogError, ConnectionFields,
    ConnectionMetrics, ConnectionRepository, ContextualResolver, EntityFields, EntityRepository,
    EntityType, OperationContext,
};

async fn store() -> Result<Arc<PgCatalogStore>> {
    let pool = DatabaseConfig::from_env().connect().await?;
    let store = PgCatalogStore::new(pool);
    store.migrate().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(Arc::new(store))
}

fn unique(base: &str) -> String {
    format!("{base} {}", &Uuid::new_v4().to_string()[..8])
}

#[tokio::test]
#[ignore]
async fn test_restaurant_location_round_trips() -> Result<()> {
    let store = store().await?;
    let repo = EntityRepository::new(&*store);

    let created = repo
        .create_typed(
            EntityType::Restaurant,
            EntityFields::named(unique("Suerte"))
                .with_address("1800 E 6th St")
                .with_coordinates(30.2622, -97.7219),
        )
        .await?;
    let loaded = repo.get(created.entity_id).await?;

    assert_eq!(loaded.address.as_deref(), Some("1800 E 6th St"));
    assert_eq!(loaded.latitude, Some(30.2622));
    assert_eq!(loaded.longitude, Some(-97.7219));

    repo.delete(created.entity_id).await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_connection_upsert_is_monotone() -> Result<()> {
    let store = store().await?;
    let entities = EntityRepository::new(&*store);
    let connections = ConnectionRepository::new(&*store);

    let restaurant = entities
        .create_typed(
            EntityType::Restaurant,
            EntityFields::named(unique("Nixta")).with_address("2512 E 12th St"),
        )
        .await?;
    let dish = entities
        .create_typed(EntityType::DishOrCategory, EntityFields::named(unique("Duck Carnitas")))
        .await?;

    connections
        .upsert_by_pair(
            restaurant.entity_id,
            dish.entity_id,
            ConnectionFields::menu_item().with_metrics(ConnectionMetrics {
                mention_count: 9,
                ..ConnectionMetrics::default()
            }),
        )
        .await?;
    let merged = connections
        .upsert_by_pair(
            restaurant.entity_id,
            dish.entity_id,
            ConnectionFields::default().with_metrics(ConnectionMetrics {
                mention_count: 2,
                total_upvotes: 50,
                ..ConnectionMetrics::default()
            }),
        )
        .await?;

    assert!(merged.is_menu_item);
    assert_eq!(merged.metrics.mention_count, 9);
    assert_eq!(merged.metrics.total_upvotes, 50);

    entities.delete(restaurant.entity_id).await?;
    assert!(connections.find_by_id(merged.connection_id).await?.is_none());
    entities.delete(dish.entity_id).await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_attribute_name_is_unique_ignoring_case() -> Result<()> {
    let store = store().await?;
    let resolver = ContextualResolver::new(store.clone());
    let ctx = OperationContext::new("attribute_roundtrip");
    let name = unique("Smoky");

    let first = resolver
        .create_or_resolve_contextual_attribute(&ctx, &name, AttributeScope::Dish, &[])
        .await?;
    let again = resolver
        .create_or_resolve_contextual_attribute(&ctx, &name.to_uppercase(), AttributeScope::Dish, &[])
        .await?;
    assert_eq!(first.entity_id, again.entity_id);

    let err = EntityRepository::new(&*store)
        .create_typed(EntityType::DishAttribute, EntityFields::named(name.to_lowercase()))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    EntityRepository::new(&*store).delete(first.entity_id).await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_bulk_foreign_key_failure_is_isolated() -> Result<()> {
    let store = store().await?;
    let entities = EntityRepository::new(&*store);
    let restaurant = entities
        .create_typed(
            EntityType::Restaurant,
            EntityFields::named(unique("Dai Due")).with_address("2406 Manor Rd"),
        )
        .await?;

    let writer = BulkWriter::new(store.clone());
    let ctx = OperationContext::new("bulk_roundtrip");
    let dishes = writer
        .bulk_create_entities(
            &ctx,
            &[
                EntityInput::new(EntityType::DishOrCategory, EntityFields::named(unique("Boudin"))),
                EntityInput::new(EntityType::DishOrCategory, EntityFields::named(unique("Wild Boar"))),
            ],
            None,
        )
        .await?;
    assert_eq!(dishes.success_count, 2);

    let dish = entities
        .find_by_type(EntityType::DishOrCategory, None)
        .await?
        .into_iter()
        .find(|e| e.name.starts_with("Boudin"))
        .ok_or_else(|| anyhow::anyhow!("dish not stored"))?;

    let result = writer
        .bulk_create_connections(
            &ctx,
            &[
                ConnectionFields::menu_item().for_pair(restaurant.entity_id, Uuid::new_v4()),
                ConnectionFields::menu_item().for_pair(restaurant.entity_id, dish.entity_id),
            ],
            Some(&BulkOperationConfig::default().with_batch_size(10)),
        )
        .await?;

    assert_eq!(result.success_count, 1);
    assert_eq!(result.failed_indices(), vec![0]);
    assert!(matches!(
        result.errors[0].error,
        CatalogError::ForeignKeyViolation { .. }
    ));

    entities.delete(restaurant.entity_id).await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_name_search_folds_like_the_memory_store() -> Result<()> {
    let store = store().await?;
    let repo = EntityRepository::new(&*store);
    let tag = &Uuid::new_v4().to_string()[..8];
    let dish = repo
        .create_typed(
            EntityType::DishOrCategory,
            EntityFields::named(format!("Ｋｏｒｅａｎ  ＢＢＱ {tag}")),
        )
        .await?;

    let found = repo
        .find_by_name_or_alias(&format!("korean bbq {tag}"), None)
        .await?;
    assert_eq!(found.len(), 1);
    let exact = repo
        .find_by_name_ignore_case(&format!("KOREAN BBQ {tag}"), EntityType::DishOrCategory)
        .await?;
    assert_eq!(exact.len(), 1);

    repo.delete(dish.entity_id).await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_connection_kinds_and_quality_score_hold() -> Result<()> {
    let store = store().await?;
    let entities = EntityRepository::new(&*store);
    let connections = ConnectionRepository::new(&*store);
    let restaurant = entities
        .create_typed(
            EntityType::Restaurant,
            EntityFields::named(unique("Loro")).with_address("2115 S Lamar Blvd"),
        )
        .await?;
    let dish = entities
        .create_typed(EntityType::DishOrCategory, EntityFields::named(unique("Brisket Rice")))
        .await?;

    let err = connections
        .upsert_by_pair(dish.entity_id, restaurant.entity_id, ConnectionFields::menu_item())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CatalogError::ForeignKeyViolation { ref references, .. } if references == "restaurant"
    ));
    let err = connections
        .upsert_by_pair(
            restaurant.entity_id,
            dish.entity_id,
            ConnectionFields::menu_item().with_categories(vec![restaurant.entity_id]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CatalogError::ForeignKeyViolation { ref field, .. } if field == "categories"
    ));

    connections
        .upsert_by_pair(
            restaurant.entity_id,
            dish.entity_id,
            ConnectionFields::menu_item().with_metrics(ConnectionMetrics {
                mention_count: 5,
                recent_mention_count: 5,
                dish_quality_score: 4.5,
                last_mentioned_at: Some(chrono::Utc::now()),
                ..ConnectionMetrics::default()
            }),
        )
        .await?;
    let again = connections
        .upsert_by_pair(restaurant.entity_id, dish.entity_id, ConnectionFields::default())
        .await?;
    assert_eq!(again.metrics.dish_quality_score, 4.5);
    assert_eq!(again.metrics.recent_mention_count, 5);

    entities.delete(restaurant.entity_id).await?;
    entities.delete(dish.entity_id).await?;
    Ok(())
}
