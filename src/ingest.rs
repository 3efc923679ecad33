//! End-to-end ingestion run
//!
//! Takes one batch of extracted records keyed by names and writes it through
//! the accessors, the resolver and the bulk writer:
//!
//! 1. resolve restaurant- and dish-scoped attribute names,
//! 2. upsert restaurants and dishes (concurrently),
//! 3. upsert restaurant↔dish connections,
//! 4. append mentions,
//! 5. refresh metrics of every connection that received mentions.
//!
//! References to names that exist neither in the batch nor in the catalog
//! are reported, not fatal.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::bulk::{BulkWriteError, BulkWriteResult, BulkWriter, EntityInput};
use crate::config::CatalogConfig;
use crate::context::OperationContext;
use crate::error::CatalogError;
use crate::models::{
    ConnectionFields, EntityFields, EntityType, MentionSource, NewConnection, NewMention,
};
use crate::normalize::fold_name;
use crate::repository::{ConnectionRepository, EntityRepository};
use crate::resolution::{AttributeScope, ContextualResolver};
use crate::store::CatalogStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestaurantRecord {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub google_place_id: Option<String>,
    /// Restaurant-scoped attribute names ("Patio", "Italian").
    #[serde(default)]
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DishRecord {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// A restaurant↔dish relation as extracted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub restaurant: String,
    pub dish: String,
    #[serde(default)]
    pub is_menu_item: bool,
    /// Names of `dish_or_category` entities this dish is filed under.
    #[serde(default)]
    pub categories: Vec<String>,
    /// Dish-scoped attribute names ("Spicy", "Italian").
    #[serde(default)]
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionRecord {
    pub restaurant: String,
    pub dish: String,
    pub source_type: MentionSource,
    pub source_id: String,
    pub source_url: String,
    pub subreddit: String,
    pub content_excerpt: String,
    pub author: Option<String>,
    pub upvotes: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionBatch {
    #[serde(default)]
    pub restaurants: Vec<RestaurantRecord>,
    #[serde(default)]
    pub dishes: Vec<DishRecord>,
    #[serde(default)]
    pub links: Vec<LinkRecord>,
    #[serde(default)]
    pub mentions: Vec<MentionRecord>,
}

/// A name that matched nothing; the record that used it was left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedReference {
    /// `"link"` or `"mention"`.
    pub record: &'static str,
    /// Position in the batch's `links` or `mentions`.
    pub index: usize,
    pub name: String,
    pub expected: EntityType,
}

#[derive(Debug)]
pub struct IngestionReport {
    pub restaurants: BulkWriteResult,
    pub dishes: BulkWriteResult,
    pub connections: BulkWriteResult,
    pub mentions: BulkWriteResult,
    pub unresolved: Vec<UnresolvedReference>,
    pub refreshed_connections: usize,
}

impl IngestionReport {
    pub fn failure_count(&self) -> usize {
        self.restaurants.failure_count
            + self.dishes.failure_count
            + self.connections.failure_count
            + self.mentions.failure_count
    }
}

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error(transparent)]
    Bulk(#[from] BulkWriteError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Folded name → entity id, per kind.
#[derive(Default)]
struct NameIndex {
    ids: HashMap<(EntityType, String), Uuid>,
}

impl NameIndex {
    fn get(&self, kind: EntityType, name: &str) -> Option<Uuid> {
        self.ids.get(&(kind, fold_name(name))).copied()
    }
}

/// Runs [`IngestionBatch`]es against one store.
pub struct IngestionRun<S: CatalogStore> {
    store: Arc<S>,
    writer: BulkWriter<S>,
    resolver: ContextualResolver<S>,
}

impl<S: CatalogStore> IngestionRun<S> {
    pub fn new(store: Arc<S>, config: &CatalogConfig) -> Self {
        Self {
            writer: BulkWriter::new(store.clone()).with_defaults(config.bulk.clone()),
            resolver: ContextualResolver::new(store.clone())
                .with_page_size(config.dual_purpose_page_size),
            store,
        }
    }

    pub async fn run(
        &self,
        ctx: &OperationContext,
        batch: &IngestionBatch,
    ) -> Result<IngestionReport, IngestionError> {
        let span = ctx.span().clone();
        async move {
            info!(
                restaurants = batch.restaurants.len(),
                dishes = batch.dishes.len(),
                links = batch.links.len(),
                mentions = batch.mentions.len(),
                "Starting ingestion run"
            );

            let mut index = self.resolve_attributes(ctx, batch).await?;

            let restaurant_inputs: Vec<EntityInput> = batch
                .restaurants
                .iter()
                .map(|r| restaurant_input(r, &index))
                .collect();
            let dish_inputs: Vec<EntityInput> = batch
                .dishes
                .iter()
                .map(|d| {
                    EntityInput::new(
                        EntityType::DishOrCategory,
                        EntityFields::named(&d.name).with_aliases(d.aliases.iter().cloned()),
                    )
                })
                .collect();

            let restaurant_ctx = ctx.child("ingest.restaurants");
            let dish_ctx = ctx.child("ingest.dishes");
            let (restaurants, dishes) = tokio::try_join!(
                self.writer
                    .bulk_upsert_entities(&restaurant_ctx, &restaurant_inputs, None),
                self.writer.bulk_upsert_entities(&dish_ctx, &dish_inputs, None),
            )?;

            self.index_referenced_names(batch, &mut index).await?;
            let mut unresolved = Vec::new();

            let links = build_connections(batch, &index, &mut unresolved);
            let connections = self
                .writer
                .bulk_upsert_connections(&ctx.child("ingest.connections"), &links, None)
                .await?;

            let (mentions, touched) = self.build_mentions(batch, &index, &mut unresolved).await?;
            let mention_result = self
                .writer
                .bulk_create_mentions(&ctx.child("ingest.mentions"), &mentions, None)
                .await?;

            let connection_repo = ConnectionRepository::new(&*self.store);
            let now = Utc::now();
            for connection_id in &touched {
                connection_repo.refresh_metrics(*connection_id, now).await?;
            }

            if !unresolved.is_empty() {
                warn!(count = unresolved.len(), "Ingestion batch had unresolved references");
            }
            info!(
                connections = connections.success_count,
                mentions = mention_result.success_count,
                refreshed = touched.len(),
                "Ingestion run completed"
            );

            Ok::<_, IngestionError>(IngestionReport {
                restaurants,
                dishes,
                connections,
                mentions: mention_result,
                unresolved,
                refreshed_connections: touched.len(),
            })
        }
        .instrument(span)
        .await
    }

    /// Create or reuse every attribute named in the batch.
    async fn resolve_attributes(
        &self,
        ctx: &OperationContext,
        batch: &IngestionBatch,
    ) -> Result<NameIndex, IngestionError> {
        let restaurant_names: Vec<String> = batch
            .restaurants
            .iter()
            .flat_map(|r| r.attributes.iter().cloned())
            .collect();
        let dish_names: Vec<String> = batch
            .links
            .iter()
            .flat_map(|l| l.attributes.iter().cloned())
            .collect();

        let attr_ctx = ctx.child("ingest.attributes");
        let (restaurant_attrs, dish_attrs) = tokio::try_join!(
            self.resolver
                .resolve_attribute_names(&attr_ctx, &restaurant_names, AttributeScope::Restaurant),
            self.resolver
                .resolve_attribute_names(&attr_ctx, &dish_names, AttributeScope::Dish),
        )?;

        let mut index = NameIndex::default();
        for entity in restaurant_attrs.into_iter().chain(dish_attrs) {
            index
                .ids
                .insert((entity.entity_type, fold_name(&entity.name)), entity.entity_id);
        }
        Ok(index)
    }

    /// Look up the ids of every restaurant and dish name the batch refers to.
    async fn index_referenced_names(
        &self,
        batch: &IngestionBatch,
        index: &mut NameIndex,
    ) -> Result<(), CatalogError> {
        let mut wanted: HashSet<(EntityType, String)> = HashSet::new();
        let mut want = |kind: EntityType, name: &str| {
            let key = fold_name(name);
            if !key.is_empty() {
                wanted.insert((kind, key));
            }
        };
        for link in &batch.links {
            want(EntityType::Restaurant, &link.restaurant);
            want(EntityType::DishOrCategory, &link.dish);
            for category in &link.categories {
                want(EntityType::DishOrCategory, category);
            }
        }
        for mention in &batch.mentions {
            want(EntityType::Restaurant, &mention.restaurant);
            want(EntityType::DishOrCategory, &mention.dish);
        }

        let entities = EntityRepository::new(&*self.store);
        for (kind, name) in wanted {
            if let Some(entity) = entities
                .find_by_name_ignore_case(&name, kind)
                .await?
                .into_iter()
                .next()
            {
                index.ids.insert((kind, name), entity.entity_id);
            }
        }
        Ok(())
    }

    /// Drafts for mentions whose pair has a connection, plus the set of
    /// connections that receive them.
    async fn build_mentions(
        &self,
        batch: &IngestionBatch,
        index: &NameIndex,
        unresolved: &mut Vec<UnresolvedReference>,
    ) -> Result<(Vec<NewMention>, BTreeSet<Uuid>), CatalogError> {
        let connections = ConnectionRepository::new(&*self.store);
        let mut pairs: HashMap<(Uuid, Uuid), Option<Uuid>> = HashMap::new();
        let mut drafts = Vec::new();
        let mut touched = BTreeSet::new();

        for (i, m) in batch.mentions.iter().enumerate() {
            let restaurant_id =
                lookup(index, "mention", i, EntityType::Restaurant, &m.restaurant, unresolved);
            let dish_id =
                lookup(index, "mention", i, EntityType::DishOrCategory, &m.dish, unresolved);
            let (Some(restaurant_id), Some(dish_id)) = (restaurant_id, dish_id) else {
                continue;
            };

            let connection_id = match pairs.get(&(restaurant_id, dish_id)) {
                Some(found) => *found,
                None => {
                    let found = connections
                        .find_by_pair(restaurant_id, dish_id)
                        .await?
                        .map(|c| c.connection_id);
                    pairs.insert((restaurant_id, dish_id), found);
                    found
                }
            };
            let Some(connection_id) = connection_id else {
                unresolved.push(UnresolvedReference {
                    record: "mention",
                    index: i,
                    name: format!("{} / {}", m.restaurant, m.dish),
                    expected: EntityType::DishOrCategory,
                });
                continue;
            };

            touched.insert(connection_id);
            drafts.push(NewMention {
                connection_id,
                source_type: m.source_type,
                source_id: m.source_id.clone(),
                source_url: m.source_url.clone(),
                subreddit: m.subreddit.clone(),
                content_excerpt: m.content_excerpt.clone(),
                author: m.author.clone(),
                upvotes: m.upvotes,
                created_at: m.created_at,
            });
        }
        Ok((drafts, touched))
    }
}

fn restaurant_input(record: &RestaurantRecord, index: &NameIndex) -> EntityInput {
    let mut fields = EntityFields::named(&record.name).with_aliases(record.aliases.iter().cloned());
    if let Some(address) = &record.address {
        fields = fields.with_address(address);
    }
    if let (Some(lat), Some(lon)) = (record.latitude, record.longitude) {
        fields = fields.with_coordinates(lat, lon);
    }
    if let Some(place_id) = &record.google_place_id {
        fields = fields.with_google_place_id(place_id);
    }
    let attributes: Vec<Uuid> = record
        .attributes
        .iter()
        .filter_map(|name| index.get(EntityType::RestaurantAttribute, name))
        .collect();
    if !attributes.is_empty() {
        fields = fields.with_restaurant_attributes(attributes);
    }
    EntityInput::new(EntityType::Restaurant, fields)
}

fn build_connections(
    batch: &IngestionBatch,
    index: &NameIndex,
    unresolved: &mut Vec<UnresolvedReference>,
) -> Vec<NewConnection> {
    let mut drafts = Vec::with_capacity(batch.links.len());
    for (i, link) in batch.links.iter().enumerate() {
        let restaurant_id =
            lookup(index, "link", i, EntityType::Restaurant, &link.restaurant, unresolved);
        let dish_id = lookup(index, "link", i, EntityType::DishOrCategory, &link.dish, unresolved);
        let (Some(restaurant_id), Some(dish_id)) = (restaurant_id, dish_id) else {
            continue;
        };
        let categories = link
            .categories
            .iter()
            .filter_map(|name| {
                lookup(index, "link", i, EntityType::DishOrCategory, name, unresolved)
            })
            .collect();
        let dish_attributes = link
            .attributes
            .iter()
            .filter_map(|name| index.get(EntityType::DishAttribute, name))
            .collect();

        let fields = ConnectionFields {
            is_menu_item: link.is_menu_item,
            ..ConnectionFields::default()
        }
        .with_categories(categories)
        .with_dish_attributes(dish_attributes);
        drafts.push(fields.for_pair(restaurant_id, dish_id));
    }
    drafts
}

fn lookup(
    index: &NameIndex,
    record: &'static str,
    position: usize,
    kind: EntityType,
    name: &str,
    unresolved: &mut Vec<UnresolvedReference>,
) -> Option<Uuid> {
    let found = index.get(kind, name);
    if found.is_none() {
        unresolved.push(UnresolvedReference {
            record,
            index: position,
            name: name.to_string(),
            expected: kind,
        });
    }
    found
}
