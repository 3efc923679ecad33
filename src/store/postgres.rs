//! Postgres catalog store (feature `database`)
//!
//! All SQL is runtime-checked (`sqlx::query`, not `sqlx::query!`) so builds
//! never need a live database. The schema lives in `migrations/`.
//!
//! Inside a transaction every statement runs under its own savepoint, so a
//! failed statement (a foreign-key violation during a batch, say) does not
//! poison the rest of the transaction.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgConnection};
use sqlx::query::QueryAs;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{CatalogOps, CatalogStore, StoreFailure, StoreResult, StoreTransaction};
use crate::models::{
    ActivityLevel, Connection, ConnectionFilter, ConnectionMetrics, ConnectionPatch, Entity,
    EntityFields, EntityQuery, EntityType, Mention, MentionFilter, MentionSource, NameMatch,
    NewConnection, NewEntity, NewMention, TopMention,
};
use crate::normalize::fold_name;

const ENTITY_COLUMNS: &str = "entity_id, name, type AS entity_type, aliases, \
    restaurant_attributes, restaurant_quality_score, latitude, longitude, address, \
    google_place_id, restaurant_metadata, created_at, updated_at";

const CONNECTION_COLUMNS: &str = "connection_id, restaurant_id, dish_or_category_id, \
    is_menu_item, categories, dish_attributes, mention_count, total_upvotes, \
    source_diversity, recent_mention_count, last_mentioned_at, activity_level, \
    top_mentions, dish_quality_score, created_at, updated_at";

const MENTION_COLUMNS: &str = "mention_id, connection_id, source_type, source_id, \
    source_url, subreddit, content_excerpt, author, upvotes, created_at, processed_at";

// ── Row types ─────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct PgEntityRow {
    entity_id: Uuid,
    name: String,
    entity_type: String,
    aliases: Vec<String>,
    restaurant_attributes: Vec<Uuid>,
    restaurant_quality_score: f64,
    latitude: Option<f64>,
    longitude: Option<f64>,
    address: Option<String>,
    google_place_id: Option<String>,
    restaurant_metadata: Json<Map<String, Value>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PgEntityRow> for Entity {
    type Error = StoreFailure;

    fn try_from(row: PgEntityRow) -> StoreResult<Self> {
        let entity_type = EntityType::from_str(&row.entity_type)
            .map_err(|_| StoreFailure::other(format!("unknown entity type {}", row.entity_type)))?;
        Ok(Entity {
            entity_id: row.entity_id,
            name: row.name,
            entity_type,
            aliases: row.aliases,
            restaurant_attributes: row.restaurant_attributes,
            restaurant_quality_score: row.restaurant_quality_score,
            latitude: row.latitude,
            longitude: row.longitude,
            address: row.address,
            google_place_id: row.google_place_id,
            restaurant_metadata: row.restaurant_metadata.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PgConnectionRow {
    connection_id: Uuid,
    restaurant_id: Uuid,
    dish_or_category_id: Uuid,
    is_menu_item: bool,
    categories: Vec<Uuid>,
    dish_attributes: Vec<Uuid>,
    mention_count: i64,
    total_upvotes: i64,
    source_diversity: i64,
    recent_mention_count: i64,
    last_mentioned_at: Option<DateTime<Utc>>,
    activity_level: String,
    top_mentions: Json<Vec<TopMention>>,
    dish_quality_score: f64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PgConnectionRow> for Connection {
    type Error = StoreFailure;

    fn try_from(row: PgConnectionRow) -> StoreResult<Self> {
        let activity_level = ActivityLevel::from_str(&row.activity_level).map_err(|_| {
            StoreFailure::other(format!("unknown activity level {}", row.activity_level))
        })?;
        Ok(Connection {
            connection_id: row.connection_id,
            restaurant_id: row.restaurant_id,
            dish_or_category_id: row.dish_or_category_id,
            is_menu_item: row.is_menu_item,
            categories: row.categories,
            dish_attributes: row.dish_attributes,
            metrics: ConnectionMetrics {
                mention_count: row.mention_count,
                total_upvotes: row.total_upvotes,
                source_diversity: row.source_diversity,
                recent_mention_count: row.recent_mention_count,
                last_mentioned_at: row.last_mentioned_at,
                activity_level,
                top_mentions: row.top_mentions.0,
                dish_quality_score: row.dish_quality_score,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PgMentionRow {
    mention_id: Uuid,
    connection_id: Uuid,
    source_type: String,
    source_id: String,
    source_url: String,
    subreddit: String,
    content_excerpt: String,
    author: Option<String>,
    upvotes: i64,
    created_at: DateTime<Utc>,
    processed_at: DateTime<Utc>,
}

impl TryFrom<PgMentionRow> for Mention {
    type Error = StoreFailure;

    fn try_from(row: PgMentionRow) -> StoreResult<Self> {
        let source_type = MentionSource::from_str(&row.source_type)
            .map_err(|_| StoreFailure::other(format!("unknown source type {}", row.source_type)))?;
        Ok(Mention {
            mention_id: row.mention_id,
            connection_id: row.connection_id,
            source_type,
            source_id: row.source_id,
            source_url: row.source_url,
            subreddit: row.subreddit,
            content_excerpt: row.content_excerpt,
            author: row.author,
            upvotes: row.upvotes,
            created_at: row.created_at,
            processed_at: row.processed_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreFailure>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// SQL mirror of [`crate::normalize::fold_name`] applied to `name`
/// (NFKC, lowercase, whitespace collapsed). Needs Postgres 13+.
const FOLDED_NAME: &str = "lower(regexp_replace(btrim(normalize(name, NFKC)), '\\s+', ' ', 'g'))";

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

// ── Statements ────────────────────────────────────────────────

mod sql {
    use super::*;

    type EntityQueryAs<'q> = QueryAs<'q, Postgres, PgEntityRow, PgArguments>;
    type ConnectionQueryAs<'q> = QueryAs<'q, Postgres, PgConnectionRow, PgArguments>;

    fn bind_new_entity<'q>(query: EntityQueryAs<'q>, draft: &'q NewEntity) -> EntityQueryAs<'q> {
        query
            .bind(Uuid::new_v4())
            .bind(&draft.name)
            .bind(draft.entity_type.as_str())
            .bind(&draft.aliases)
            .bind(&draft.restaurant_attributes)
            .bind(draft.restaurant_quality_score.unwrap_or(0.0))
            .bind(draft.latitude)
            .bind(draft.longitude)
            .bind(&draft.address)
            .bind(&draft.google_place_id)
            .bind(Json(&draft.restaurant_metadata))
    }

    fn push_entity_filter(qb: &mut QueryBuilder<'_, Postgres>, query: &EntityQuery) {
        qb.push(" WHERE TRUE");
        if let Some(kind) = query.kind {
            qb.push(" AND type = ").push_bind(kind.as_str());
        }
        match &query.name {
            Some(NameMatch::ExactIgnoreCase(name)) => {
                qb.push(format!(" AND {FOLDED_NAME} = "))
                    .push_bind(fold_name(name));
            }
            Some(NameMatch::NameOrAlias(term)) => {
                qb.push(format!(" AND ({FOLDED_NAME} LIKE "))
                    .push_bind(format!("%{}%", escape_like(&fold_name(term))))
                    .push(" OR ")
                    .push_bind(term.clone())
                    .push(" = ANY(aliases))");
            }
            None => {}
        }
        if let Some(cursor) = &query.after {
            qb.push(r#" AND (name COLLATE "C", entity_id) > ("#)
                .push_bind(cursor.name.clone())
                .push(r#" COLLATE "C", "#)
                .push_bind(cursor.entity_id)
                .push(")");
        }
    }

    pub async fn insert_entity(conn: &mut PgConnection, draft: &NewEntity) -> StoreResult<Entity> {
        let statement = format!(
            "INSERT INTO entities (entity_id, name, type, aliases, restaurant_attributes, \
             restaurant_quality_score, latitude, longitude, address, google_place_id, \
             restaurant_metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {ENTITY_COLUMNS}"
        );
        let row = bind_new_entity(sqlx::query_as(&statement), draft)
            .fetch_one(&mut *conn)
            .await?;
        row.try_into()
    }

    pub async fn insert_entities(
        conn: &mut PgConnection,
        drafts: &[NewEntity],
        skip_duplicates: bool,
    ) -> StoreResult<u64> {
        if drafts.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO entities (entity_id, name, type, aliases, restaurant_attributes, \
             restaurant_quality_score, latitude, longitude, address, google_place_id, \
             restaurant_metadata) ",
        );
        qb.push_values(drafts, |mut row, draft| {
            row.push_bind(Uuid::new_v4())
                .push_bind(draft.name.clone())
                .push_bind(draft.entity_type.as_str())
                .push_bind(draft.aliases.clone())
                .push_bind(draft.restaurant_attributes.clone())
                .push_bind(draft.restaurant_quality_score.unwrap_or(0.0))
                .push_bind(draft.latitude)
                .push_bind(draft.longitude)
                .push_bind(draft.address.clone())
                .push_bind(draft.google_place_id.clone())
                .push_bind(Json(draft.restaurant_metadata.clone()));
        });
        if skip_duplicates {
            qb.push(" ON CONFLICT DO NOTHING");
        }
        let done = qb.build().execute(&mut *conn).await?;
        Ok(done.rows_affected())
    }

    pub async fn upsert_entity(conn: &mut PgConnection, draft: &NewEntity) -> StoreResult<Entity> {
        let statement = format!(
            "INSERT INTO entities (entity_id, name, type, aliases, restaurant_attributes, \
             restaurant_quality_score, latitude, longitude, address, google_place_id, \
             restaurant_metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT ON CONSTRAINT entities_name_type_key DO NOTHING \
             RETURNING {ENTITY_COLUMNS}"
        );
        let inserted = bind_new_entity(sqlx::query_as(&statement), draft)
            .fetch_optional(&mut *conn)
            .await?;
        if let Some(row) = inserted {
            return row.try_into();
        }

        let statement =
            format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE type = $1 AND name = $2 FOR UPDATE");
        let row: PgEntityRow = sqlx::query_as(&statement)
            .bind(draft.entity_type.as_str())
            .bind(&draft.name)
            .fetch_one(&mut *conn)
            .await?;
        let mut entity = Entity::try_from(row)?;
        entity.absorb(draft, Utc::now());
        write_entity(conn, &entity).await
    }

    async fn write_entity(conn: &mut PgConnection, entity: &Entity) -> StoreResult<Entity> {
        let statement = format!(
            "UPDATE entities SET name = $2, aliases = $3, restaurant_attributes = $4, \
             restaurant_quality_score = $5, latitude = $6, longitude = $7, address = $8, \
             google_place_id = $9, restaurant_metadata = $10, updated_at = $11 \
             WHERE entity_id = $1 RETURNING {ENTITY_COLUMNS}"
        );
        let row: Option<PgEntityRow> = sqlx::query_as(&statement)
            .bind(entity.entity_id)
            .bind(&entity.name)
            .bind(&entity.aliases)
            .bind(&entity.restaurant_attributes)
            .bind(entity.restaurant_quality_score)
            .bind(entity.latitude)
            .bind(entity.longitude)
            .bind(&entity.address)
            .bind(&entity.google_place_id)
            .bind(Json(&entity.restaurant_metadata))
            .bind(entity.updated_at)
            .fetch_optional(&mut *conn)
            .await?;
        row.ok_or_else(|| StoreFailure::not_found(format!("entity {}", entity.entity_id)))?
            .try_into()
    }

    pub async fn find_entity(conn: &mut PgConnection, entity_id: Uuid) -> StoreResult<Option<Entity>> {
        let statement = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_id = $1");
        let row: Option<PgEntityRow> = sqlx::query_as(&statement)
            .bind(entity_id)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(Entity::try_from).transpose()
    }

    pub async fn find_entities(conn: &mut PgConnection, query: &EntityQuery) -> StoreResult<Vec<Entity>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {ENTITY_COLUMNS} FROM entities"));
        push_entity_filter(&mut qb, query);
        if query.after.is_some() {
            qb.push(r#" ORDER BY name COLLATE "C" ASC, entity_id"#);
        } else {
            qb.push(r#" ORDER BY name COLLATE "C" ASC, restaurant_quality_score DESC, entity_id"#);
        }
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
        let rows = qb.build_query_as::<PgEntityRow>().fetch_all(&mut *conn).await?;
        convert_all(rows)
    }

    pub async fn update_entity(
        conn: &mut PgConnection,
        entity_id: Uuid,
        fields: &EntityFields,
    ) -> StoreResult<Entity> {
        let statement =
            format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_id = $1 FOR UPDATE");
        let row: Option<PgEntityRow> = sqlx::query_as(&statement)
            .bind(entity_id)
            .fetch_optional(&mut *conn)
            .await?;
        let mut entity = row
            .ok_or_else(|| StoreFailure::not_found(format!("entity {entity_id}")))
            .and_then(Entity::try_from)?;
        entity.apply_fields(fields, Utc::now());
        write_entity(conn, &entity).await
    }

    pub async fn delete_entity(conn: &mut PgConnection, entity_id: Uuid) -> StoreResult<()> {
        let done = sqlx::query("DELETE FROM entities WHERE entity_id = $1")
            .bind(entity_id)
            .execute(&mut *conn)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreFailure::not_found(format!("entity {entity_id}")));
        }
        Ok(())
    }

    pub async fn count_entities(conn: &mut PgConnection, query: &EntityQuery) -> StoreResult<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM entities");
        push_entity_filter(&mut qb, query);
        let count = qb.build_query_scalar::<i64>().fetch_one(&mut *conn).await?;
        Ok(count.max(0) as u64)
    }

    // ── Connections ──

    fn bind_new_connection<'q>(
        query: ConnectionQueryAs<'q>,
        draft: &'q NewConnection,
    ) -> ConnectionQueryAs<'q> {
        let m = &draft.metrics;
        query
            .bind(Uuid::new_v4())
            .bind(draft.restaurant_id)
            .bind(draft.dish_or_category_id)
            .bind(draft.is_menu_item)
            .bind(&draft.categories)
            .bind(&draft.dish_attributes)
            .bind(m.mention_count)
            .bind(m.total_upvotes)
            .bind(m.source_diversity)
            .bind(m.recent_mention_count)
            .bind(m.last_mentioned_at)
            .bind(m.activity_level.to_string())
            .bind(Json(&m.top_mentions))
            .bind(m.dish_quality_score)
    }

    const CONNECTION_INSERT: &str = "INSERT INTO connections (connection_id, restaurant_id, \
        dish_or_category_id, is_menu_item, categories, dish_attributes, mention_count, \
        total_upvotes, source_diversity, recent_mention_count, last_mentioned_at, \
        activity_level, top_mentions, dish_quality_score) \
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)";

    fn push_connection_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &ConnectionFilter) {
        qb.push(" WHERE TRUE");
        if let Some(id) = filter.restaurant_id {
            qb.push(" AND restaurant_id = ").push_bind(id);
        }
        if let Some(id) = filter.dish_or_category_id {
            qb.push(" AND dish_or_category_id = ").push_bind(id);
        }
        if let Some(flag) = filter.is_menu_item {
            qb.push(" AND is_menu_item = ").push_bind(flag);
        }
        if let Some(id) = filter.category_contains {
            qb.push(" AND ").push_bind(id).push(" = ANY(categories)");
        }
        if let Some(id) = filter.dish_attribute_contains {
            qb.push(" AND ").push_bind(id).push(" = ANY(dish_attributes)");
        }
        if let Some(level) = filter.activity_level {
            qb.push(" AND activity_level = ").push_bind(level.to_string());
        }
        if let Some(min) = filter.min_mention_count {
            qb.push(" AND mention_count >= ").push_bind(min);
        }
    }

    pub async fn insert_connection(
        conn: &mut PgConnection,
        draft: &NewConnection,
    ) -> StoreResult<Connection> {
        let statement = format!("{CONNECTION_INSERT} RETURNING {CONNECTION_COLUMNS}");
        let row = bind_new_connection(sqlx::query_as(&statement), draft)
            .fetch_one(&mut *conn)
            .await?;
        row.try_into()
    }

    pub async fn insert_connections(
        conn: &mut PgConnection,
        drafts: &[NewConnection],
        skip_duplicates: bool,
    ) -> StoreResult<u64> {
        if drafts.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO connections (connection_id, restaurant_id, dish_or_category_id, \
             is_menu_item, categories, dish_attributes, mention_count, total_upvotes, \
             source_diversity, recent_mention_count, last_mentioned_at, activity_level, \
             top_mentions, dish_quality_score) ",
        );
        qb.push_values(drafts, |mut row, draft| {
            let m = &draft.metrics;
            row.push_bind(Uuid::new_v4())
                .push_bind(draft.restaurant_id)
                .push_bind(draft.dish_or_category_id)
                .push_bind(draft.is_menu_item)
                .push_bind(draft.categories.clone())
                .push_bind(draft.dish_attributes.clone())
                .push_bind(m.mention_count)
                .push_bind(m.total_upvotes)
                .push_bind(m.source_diversity)
                .push_bind(m.recent_mention_count)
                .push_bind(m.last_mentioned_at)
                .push_bind(m.activity_level.to_string())
                .push_bind(Json(m.top_mentions.clone()))
                .push_bind(m.dish_quality_score);
        });
        if skip_duplicates {
            qb.push(" ON CONFLICT DO NOTHING");
        }
        let done = qb.build().execute(&mut *conn).await?;
        Ok(done.rows_affected())
    }

    /// Monotone pair upsert; mirrors [`Connection::absorb`].
    pub async fn upsert_connection(
        conn: &mut PgConnection,
        draft: &NewConnection,
    ) -> StoreResult<Connection> {
        let statement = format!(
            "{CONNECTION_INSERT} \
             ON CONFLICT ON CONSTRAINT connections_restaurant_dish_key DO UPDATE SET \
               is_menu_item = connections.is_menu_item OR EXCLUDED.is_menu_item, \
               categories = connections.categories || ARRAY( \
                 SELECT u.id FROM unnest(EXCLUDED.categories) WITH ORDINALITY AS u(id, ord) \
                 WHERE u.id <> ALL(connections.categories) ORDER BY u.ord), \
               dish_attributes = connections.dish_attributes || ARRAY( \
                 SELECT u.id FROM unnest(EXCLUDED.dish_attributes) WITH ORDINALITY AS u(id, ord) \
                 WHERE u.id <> ALL(connections.dish_attributes) ORDER BY u.ord), \
               mention_count = GREATEST(connections.mention_count, EXCLUDED.mention_count), \
               total_upvotes = GREATEST(connections.total_upvotes, EXCLUDED.total_upvotes), \
               source_diversity = GREATEST(connections.source_diversity, EXCLUDED.source_diversity), \
               last_mentioned_at = GREATEST(connections.last_mentioned_at, EXCLUDED.last_mentioned_at), \
               recent_mention_count = CASE WHEN EXCLUDED.mention_count > 0 \
                 OR EXCLUDED.last_mentioned_at IS NOT NULL \
                 THEN EXCLUDED.recent_mention_count ELSE connections.recent_mention_count END, \
               activity_level = CASE WHEN EXCLUDED.mention_count > 0 \
                 OR EXCLUDED.last_mentioned_at IS NOT NULL \
                 THEN EXCLUDED.activity_level ELSE connections.activity_level END, \
               top_mentions = CASE WHEN jsonb_array_length(EXCLUDED.top_mentions) = 0 \
                 THEN connections.top_mentions ELSE EXCLUDED.top_mentions END, \
               updated_at = now() \
             RETURNING {CONNECTION_COLUMNS}"
        );
        let row = bind_new_connection(sqlx::query_as(&statement), draft)
            .fetch_one(&mut *conn)
            .await?;
        row.try_into()
    }

    pub async fn find_connection(
        conn: &mut PgConnection,
        connection_id: Uuid,
    ) -> StoreResult<Option<Connection>> {
        let statement =
            format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE connection_id = $1");
        let row: Option<PgConnectionRow> = sqlx::query_as(&statement)
            .bind(connection_id)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(Connection::try_from).transpose()
    }

    pub async fn find_connections(
        conn: &mut PgConnection,
        filter: &ConnectionFilter,
    ) -> StoreResult<Vec<Connection>> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT {CONNECTION_COLUMNS} FROM connections"));
        push_connection_filter(&mut qb, filter);
        qb.push(" ORDER BY mention_count DESC, connection_id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
        let rows = qb
            .build_query_as::<PgConnectionRow>()
            .fetch_all(&mut *conn)
            .await?;
        convert_all(rows)
    }

    pub async fn update_connection(
        conn: &mut PgConnection,
        connection_id: Uuid,
        patch: &ConnectionPatch,
    ) -> StoreResult<Connection> {
        let statement = format!(
            "SELECT {CONNECTION_COLUMNS} FROM connections WHERE connection_id = $1 FOR UPDATE"
        );
        let row: Option<PgConnectionRow> = sqlx::query_as(&statement)
            .bind(connection_id)
            .fetch_optional(&mut *conn)
            .await?;
        let mut connection = row
            .ok_or_else(|| StoreFailure::not_found(format!("connection {connection_id}")))
            .and_then(Connection::try_from)?;
        connection.apply_patch(patch, Utc::now());

        let m = &connection.metrics;
        let statement = format!(
            "UPDATE connections SET is_menu_item = $2, categories = $3, dish_attributes = $4, \
             mention_count = $5, total_upvotes = $6, source_diversity = $7, \
             recent_mention_count = $8, last_mentioned_at = $9, activity_level = $10, \
             top_mentions = $11, dish_quality_score = $12, updated_at = $13 \
             WHERE connection_id = $1 RETURNING {CONNECTION_COLUMNS}"
        );
        let row: PgConnectionRow = sqlx::query_as(&statement)
            .bind(connection.connection_id)
            .bind(connection.is_menu_item)
            .bind(&connection.categories)
            .bind(&connection.dish_attributes)
            .bind(m.mention_count)
            .bind(m.total_upvotes)
            .bind(m.source_diversity)
            .bind(m.recent_mention_count)
            .bind(m.last_mentioned_at)
            .bind(m.activity_level.to_string())
            .bind(Json(&m.top_mentions))
            .bind(m.dish_quality_score)
            .bind(connection.updated_at)
            .fetch_one(&mut *conn)
            .await?;
        row.try_into()
    }

    pub async fn count_connections(
        conn: &mut PgConnection,
        filter: &ConnectionFilter,
    ) -> StoreResult<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM connections");
        push_connection_filter(&mut qb, filter);
        let count = qb.build_query_scalar::<i64>().fetch_one(&mut *conn).await?;
        Ok(count.max(0) as u64)
    }

    // ── Mentions ──

    fn push_mention_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &MentionFilter) {
        qb.push(" WHERE TRUE");
        if let Some(id) = filter.connection_id {
            qb.push(" AND connection_id = ").push_bind(id);
        }
        if let Some(since) = filter.since {
            qb.push(" AND created_at >= ").push_bind(since);
        }
    }

    pub async fn insert_mention(conn: &mut PgConnection, draft: &NewMention) -> StoreResult<Mention> {
        let statement = format!(
            "INSERT INTO mentions (mention_id, connection_id, source_type, source_id, \
             source_url, subreddit, content_excerpt, author, upvotes, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING {MENTION_COLUMNS}"
        );
        let row: PgMentionRow = sqlx::query_as(&statement)
            .bind(Uuid::new_v4())
            .bind(draft.connection_id)
            .bind(draft.source_type.to_string())
            .bind(&draft.source_id)
            .bind(&draft.source_url)
            .bind(&draft.subreddit)
            .bind(&draft.content_excerpt)
            .bind(&draft.author)
            .bind(draft.upvotes)
            .bind(draft.created_at)
            .fetch_one(&mut *conn)
            .await?;
        row.try_into()
    }

    pub async fn insert_mentions(
        conn: &mut PgConnection,
        drafts: &[NewMention],
        skip_duplicates: bool,
    ) -> StoreResult<u64> {
        if drafts.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO mentions (mention_id, connection_id, source_type, source_id, \
             source_url, subreddit, content_excerpt, author, upvotes, created_at) ",
        );
        qb.push_values(drafts, |mut row, draft| {
            row.push_bind(Uuid::new_v4())
                .push_bind(draft.connection_id)
                .push_bind(draft.source_type.to_string())
                .push_bind(draft.source_id.clone())
                .push_bind(draft.source_url.clone())
                .push_bind(draft.subreddit.clone())
                .push_bind(draft.content_excerpt.clone())
                .push_bind(draft.author.clone())
                .push_bind(draft.upvotes)
                .push_bind(draft.created_at);
        });
        if skip_duplicates {
            qb.push(" ON CONFLICT DO NOTHING");
        }
        let done = qb.build().execute(&mut *conn).await?;
        Ok(done.rows_affected())
    }

    pub async fn find_mentions(
        conn: &mut PgConnection,
        filter: &MentionFilter,
    ) -> StoreResult<Vec<Mention>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {MENTION_COLUMNS} FROM mentions"));
        push_mention_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, mention_id");
        let rows = qb
            .build_query_as::<PgMentionRow>()
            .fetch_all(&mut *conn)
            .await?;
        convert_all(rows)
    }

    pub async fn count_mentions(conn: &mut PgConnection, filter: &MentionFilter) -> StoreResult<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM mentions");
        push_mention_filter(&mut qb, filter);
        let count = qb.build_query_scalar::<i64>().fetch_one(&mut *conn).await?;
        Ok(count.max(0) as u64)
    }
}

// ── Store and transaction ─────────────────────────────────────

/// Postgres-backed [`CatalogStore`].
#[derive(Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        info!("Applying catalog migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreFailure::other("catalog migration failed").with_cause(e))
    }
}

/// Transaction handed out by [`PgCatalogStore::begin`]. Dropping it without
/// committing rolls back.
pub struct PgTransaction {
    tx: Mutex<Transaction<'static, Postgres>>,
}

/// Run a statement on a pooled connection.
macro_rules! on_pool {
    ($store:expr, |$conn:ident| $body:expr) => {{
        let mut pooled = $store.pool.acquire().await?;
        let $conn: &mut PgConnection = &mut pooled;
        $body.await
    }};
}

/// Run a statement inside the transaction under a savepoint.
macro_rules! in_savepoint {
    ($handle:expr, |$conn:ident| $body:expr) => {{
        let mut guard = $handle.tx.lock().await;
        let mut savepoint = sqlx::Connection::begin(&mut **guard).await?;
        let outcome = {
            let $conn: &mut PgConnection = &mut savepoint;
            $body.await
        };
        match outcome {
            Ok(value) => {
                savepoint.commit().await?;
                Ok(value)
            }
            Err(failure) => {
                debug!(code = %failure.code, "statement failed, rolling back savepoint");
                savepoint.rollback().await?;
                Err(failure)
            }
        }
    }};
}

macro_rules! pg_catalog_ops {
    ($target:ty, $run:ident) => {
        #[async_trait]
        impl CatalogOps for $target {
            async fn create_entity(&self, draft: &NewEntity) -> StoreResult<Entity> {
                $run!(self, |conn| sql::insert_entity(conn, draft))
            }

            async fn create_entities(
                &self,
                drafts: &[NewEntity],
                skip_duplicates: bool,
            ) -> StoreResult<u64> {
                $run!(self, |conn| sql::insert_entities(conn, drafts, skip_duplicates))
            }

            async fn upsert_entity(&self, draft: &NewEntity) -> StoreResult<Entity> {
                $run!(self, |conn| sql::upsert_entity(conn, draft))
            }

            async fn find_entity(&self, entity_id: Uuid) -> StoreResult<Option<Entity>> {
                $run!(self, |conn| sql::find_entity(conn, entity_id))
            }

            async fn find_entities(&self, query: &EntityQuery) -> StoreResult<Vec<Entity>> {
                $run!(self, |conn| sql::find_entities(conn, query))
            }

            async fn update_entity(
                &self,
                entity_id: Uuid,
                fields: &EntityFields,
            ) -> StoreResult<Entity> {
                $run!(self, |conn| sql::update_entity(conn, entity_id, fields))
            }

            async fn delete_entity(&self, entity_id: Uuid) -> StoreResult<()> {
                $run!(self, |conn| sql::delete_entity(conn, entity_id))
            }

            async fn count_entities(&self, query: &EntityQuery) -> StoreResult<u64> {
                $run!(self, |conn| sql::count_entities(conn, query))
            }

            async fn create_connection(&self, draft: &NewConnection) -> StoreResult<Connection> {
                $run!(self, |conn| sql::insert_connection(conn, draft))
            }

            async fn create_connections(
                &self,
                drafts: &[NewConnection],
                skip_duplicates: bool,
            ) -> StoreResult<u64> {
                $run!(self, |conn| sql::insert_connections(conn, drafts, skip_duplicates))
            }

            async fn upsert_connection(&self, draft: &NewConnection) -> StoreResult<Connection> {
                $run!(self, |conn| sql::upsert_connection(conn, draft))
            }

            async fn find_connection(
                &self,
                connection_id: Uuid,
            ) -> StoreResult<Option<Connection>> {
                $run!(self, |conn| sql::find_connection(conn, connection_id))
            }

            async fn find_connections(
                &self,
                filter: &ConnectionFilter,
            ) -> StoreResult<Vec<Connection>> {
                $run!(self, |conn| sql::find_connections(conn, filter))
            }

            async fn update_connection(
                &self,
                connection_id: Uuid,
                patch: &ConnectionPatch,
            ) -> StoreResult<Connection> {
                $run!(self, |conn| sql::update_connection(conn, connection_id, patch))
            }

            async fn count_connections(&self, filter: &ConnectionFilter) -> StoreResult<u64> {
                $run!(self, |conn| sql::count_connections(conn, filter))
            }

            async fn create_mention(&self, draft: &NewMention) -> StoreResult<Mention> {
                $run!(self, |conn| sql::insert_mention(conn, draft))
            }

            async fn create_mentions(
                &self,
                drafts: &[NewMention],
                skip_duplicates: bool,
            ) -> StoreResult<u64> {
                $run!(self, |conn| sql::insert_mentions(conn, drafts, skip_duplicates))
            }

            async fn find_mentions(&self, filter: &MentionFilter) -> StoreResult<Vec<Mention>> {
                $run!(self, |conn| sql::find_mentions(conn, filter))
            }

            async fn count_mentions(&self, filter: &MentionFilter) -> StoreResult<u64> {
                $run!(self, |conn| sql::count_mentions(conn, filter))
            }
        }
    };
}

pg_catalog_ops!(PgCatalogStore, on_pool);
pg_catalog_ops!(PgTransaction, in_savepoint);

#[async_trait]
impl StoreTransaction for PgTransaction {
    fn as_ops(&self) -> &dyn CatalogOps {
        self
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.into_inner().commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.into_inner().rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx: Mutex::new(tx) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like_escapes_wildcards() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }

    #[test]
    fn test_row_with_unknown_type_is_rejected() {
        let now = Utc::now();
        let row = PgEntityRow {
            entity_id: Uuid::new_v4(),
            name: "Odd".to_string(),
            entity_type: "menu".to_string(),
            aliases: vec![],
            restaurant_attributes: vec![],
            restaurant_quality_score: 0.0,
            latitude: None,
            longitude: None,
            address: None,
            google_place_id: None,
            restaurant_metadata: Json(Map::new()),
            created_at: now,
            updated_at: now,
        };
        assert!(Entity::try_from(row).is_err());
    }
}
