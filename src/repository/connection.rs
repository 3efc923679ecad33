//! Connection Store Accessor
//!
//! Pair-keyed upserts plus the two usage counters the resolution engine is
//! built on: category membership and menu-item usage.

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::base::{by_id, context, not_found, TranslateExt};
use crate::error::{CatalogResult, Operation, ValidationError};
use crate::models::{
    Connection, ConnectionFields, ConnectionFilter, ConnectionMetrics, ConnectionPatch, Mention,
    MentionFilter, NewConnection,
};
use crate::store::CatalogOps;

pub struct ConnectionRepository<'a, S: CatalogOps + ?Sized> {
    store: &'a S,
}

impl<'a, S: CatalogOps + ?Sized> ConnectionRepository<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Create the connection for a pair, or merge into the existing one.
    ///
    /// Merging never decreases cumulative metrics and never clears
    /// `is_menu_item`; use [`Self::apply_correction`] for that.
    pub async fn upsert_by_pair(
        &self,
        restaurant_id: Uuid,
        dish_or_category_id: Uuid,
        fields: ConnectionFields,
    ) -> CatalogResult<Connection> {
        let draft = fields.for_pair(restaurant_id, dish_or_category_id);
        check_pair(&draft)?;
        let key = draft.pair_key();
        self.store
            .upsert_connection(&draft)
            .await
            .in_context(context::<Connection>(Operation::Upsert).with_key(key))
    }

    pub async fn find_by_id(&self, connection_id: Uuid) -> CatalogResult<Option<Connection>> {
        self.store
            .find_connection(connection_id)
            .await
            .in_context(by_id::<Connection>(Operation::Read, connection_id))
    }

    pub async fn find_by_pair(
        &self,
        restaurant_id: Uuid,
        dish_or_category_id: Uuid,
    ) -> CatalogResult<Option<Connection>> {
        let filter = ConnectionFilter::new()
            .restaurant(restaurant_id)
            .dish(dish_or_category_id)
            .limit(1);
        Ok(self.find_many(&filter).await?.into_iter().next())
    }

    pub async fn find_many(&self, filter: &ConnectionFilter) -> CatalogResult<Vec<Connection>> {
        self.store
            .find_connections(filter)
            .await
            .in_context(context::<Connection>(Operation::Read))
    }

    /// Connections whose `categories` list contains `category_id`.
    pub async fn count_by_category_membership(&self, category_id: Uuid) -> CatalogResult<u64> {
        self.count(&ConnectionFilter::new().in_category(category_id))
            .await
    }

    /// Connections with `is_menu_item` set, optionally narrowed to one
    /// restaurant and/or one dish.
    pub async fn count_by_menu_item_usage(
        &self,
        restaurant_id: Option<Uuid>,
        dish_id: Option<Uuid>,
    ) -> CatalogResult<u64> {
        let filter = ConnectionFilter {
            restaurant_id,
            dish_or_category_id: dish_id,
            ..ConnectionFilter::new().menu_items()
        };
        self.count(&filter).await
    }

    async fn count(&self, filter: &ConnectionFilter) -> CatalogResult<u64> {
        self.store
            .count_connections(filter)
            .await
            .in_context(context::<Connection>(Operation::Count))
    }

    /// Overwrite fields verbatim. The only path that may lower metrics or
    /// clear the menu-item flag.
    pub async fn apply_correction(
        &self,
        connection_id: Uuid,
        patch: ConnectionPatch,
    ) -> CatalogResult<Connection> {
        debug!(connection_id = %connection_id, "Applying connection correction");
        self.store
            .update_connection(connection_id, &patch)
            .await
            .in_context(by_id::<Connection>(Operation::Update, connection_id))
    }

    pub async fn mentions(&self, connection_id: Uuid) -> CatalogResult<Vec<Mention>> {
        self.store
            .find_mentions(&MentionFilter::for_connection(connection_id))
            .await
            .in_context(context::<Mention>(Operation::Read))
    }

    /// Recompute metrics from the stored mentions and merge them in through
    /// the monotone upsert rule. `dish_quality_score` is left as stored.
    pub async fn refresh_metrics(
        &self,
        connection_id: Uuid,
        now: DateTime<Utc>,
    ) -> CatalogResult<Connection> {
        let current = self
            .find_by_id(connection_id)
            .await?
            .ok_or_else(|| not_found::<Connection>(connection_id))?;
        let mentions = self.mentions(connection_id).await?;

        let metrics = ConnectionMetrics::from_mentions(&mentions, now);
        debug!(
            connection_id = %connection_id,
            mention_count = metrics.mention_count,
            activity = %metrics.activity_level,
            "Refreshing connection metrics"
        );

        let draft = ConnectionFields::default()
            .with_metrics(metrics)
            .for_pair(current.restaurant_id, current.dish_or_category_id);
        self.store
            .upsert_connection(&draft)
            .await
            .in_context(by_id::<Connection>(Operation::Upsert, connection_id))
    }
}

/// Pair-level checks that need no store access.
pub(crate) fn check_pair(draft: &NewConnection) -> Result<(), ValidationError> {
    if draft.restaurant_id == draft.dish_or_category_id {
        return Err(ValidationError::InvalidValue {
            field: "dish_or_category_id",
            reason: "must differ from restaurant_id".to_string(),
        });
    }
    if draft.categories.contains(&draft.dish_or_category_id) {
        return Err(ValidationError::InvalidValue {
            field: "categories",
            reason: "a connection cannot list its own dish as a category".to_string(),
        });
    }
    Ok(())
}
