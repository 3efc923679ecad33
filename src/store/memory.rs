//! In-memory catalog store
//!
//! Enforces the same unique and foreign-key constraints as the Postgres
//! schema and reports violations with the same constraint names, so error
//! translation behaves identically on both backends.
//!
//! Transactions take exclusive ownership of the state for their lifetime and
//! work on a staged copy that replaces the committed state on commit. While a
//! transaction is open, store-level calls wait for it; never call the store
//! itself from the task holding a transaction.
//!
//! Every call is counted per operation name (see [`ops`]) and one-shot
//! failures can be queued per operation, which is how tests assert "no store
//! call happened" and simulate aborts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::constraints;
use super::{CatalogOps, CatalogStore, FailureCode, StoreFailure, StoreResult, StoreTransaction};
use crate::models::{
    Connection, ConnectionFilter, ConnectionPatch, Entity, EntityFields, EntityQuery, EntityType,
    Mention, MentionFilter, NewConnection, NewEntity, NewMention,
};
use crate::normalize::fold_name;

/// Operation names used for call counting and fault injection.
pub mod ops {
    pub const ENTITY_CREATE: &str = "entities.create";
    pub const ENTITY_CREATE_MANY: &str = "entities.create_many";
    pub const ENTITY_UPSERT: &str = "entities.upsert";
    pub const ENTITY_FIND_UNIQUE: &str = "entities.find_unique";
    pub const ENTITY_FIND_MANY: &str = "entities.find_many";
    pub const ENTITY_UPDATE: &str = "entities.update";
    pub const ENTITY_DELETE: &str = "entities.delete";
    pub const ENTITY_COUNT: &str = "entities.count";
    pub const CONNECTION_CREATE: &str = "connections.create";
    pub const CONNECTION_CREATE_MANY: &str = "connections.create_many";
    pub const CONNECTION_UPSERT: &str = "connections.upsert";
    pub const CONNECTION_FIND_UNIQUE: &str = "connections.find_unique";
    pub const CONNECTION_FIND_MANY: &str = "connections.find_many";
    pub const CONNECTION_UPDATE: &str = "connections.update";
    pub const CONNECTION_COUNT: &str = "connections.count";
    pub const MENTION_CREATE: &str = "mentions.create";
    pub const MENTION_CREATE_MANY: &str = "mentions.create_many";
    pub const MENTION_FIND_MANY: &str = "mentions.find_many";
    pub const MENTION_COUNT: &str = "mentions.count";
    pub const BEGIN: &str = "transaction.begin";
    pub const COMMIT: &str = "transaction.commit";
    pub const ROLLBACK: &str = "transaction.rollback";
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn truncate<T>(mut rows: Vec<T>, limit: Option<i64>) -> Vec<T> {
    if let Some(limit) = limit {
        rows.truncate(limit.max(0) as usize);
    }
    rows
}

// ── State ──

#[derive(Debug, Clone, Default)]
struct CatalogState {
    entities: BTreeMap<Uuid, Entity>,
    connections: BTreeMap<Uuid, Connection>,
    mentions: BTreeMap<Uuid, Mention>,
}

impl CatalogState {
    fn entity_conflict(&self, candidate: &Entity) -> Option<&'static str> {
        self.entities
            .values()
            .filter(|e| e.entity_id != candidate.entity_id)
            .find_map(|e| {
                let same_kind = e.entity_type == candidate.entity_type;
                if same_kind && e.name == candidate.name {
                    Some(constraints::ENTITY_NAME_TYPE)
                } else if same_kind
                    && candidate.entity_type.is_attribute()
                    && fold_name(&e.name) == fold_name(&candidate.name)
                {
                    Some(constraints::ENTITY_ATTRIBUTE_NAME_CI)
                } else if candidate.google_place_id.is_some()
                    && e.google_place_id == candidate.google_place_id
                {
                    Some(constraints::ENTITY_GOOGLE_PLACE_ID)
                } else {
                    None
                }
            })
    }

    fn put_entity(&mut self, entity: Entity) -> StoreResult<Entity> {
        if let Some(constraint) = self.entity_conflict(&entity) {
            return Err(StoreFailure::unique(
                constraint,
                format!(
                    "{} ({}) violates {constraint}",
                    entity.name, entity.entity_type
                ),
            ));
        }
        self.entities.insert(entity.entity_id, entity.clone());
        Ok(entity)
    }

    fn insert_entity(&mut self, draft: &NewEntity, now: DateTime<Utc>) -> StoreResult<Entity> {
        self.put_entity(Entity::from_draft(draft, Uuid::new_v4(), now))
    }

    fn insert_entities(
        &mut self,
        drafts: &[NewEntity],
        skip_duplicates: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        // One statement: either every non-skipped row lands or none does.
        let mut next = self.clone();
        let mut inserted = 0;
        for draft in drafts {
            match next.insert_entity(draft, now) {
                Ok(_) => inserted += 1,
                Err(f) if skip_duplicates && f.code == FailureCode::UniqueViolation => {}
                Err(f) => return Err(f),
            }
        }
        *self = next;
        Ok(inserted)
    }

    fn upsert_entity(&mut self, draft: &NewEntity, now: DateTime<Utc>) -> StoreResult<Entity> {
        let existing = self
            .entities
            .values()
            .find(|e| e.entity_type == draft.entity_type && e.name == draft.name)
            .cloned();
        let Some(mut merged) = existing else {
            return self.insert_entity(draft, now);
        };
        merged.absorb(draft, now);
        self.put_entity(merged)
    }

    fn update_entity(
        &mut self,
        entity_id: Uuid,
        fields: &EntityFields,
        now: DateTime<Utc>,
    ) -> StoreResult<Entity> {
        let mut entity = self
            .entities
            .get(&entity_id)
            .cloned()
            .ok_or_else(|| StoreFailure::not_found(format!("entity {entity_id}")))?;
        entity.apply_fields(fields, now);
        self.put_entity(entity)
    }

    fn delete_entity(&mut self, entity_id: Uuid) -> StoreResult<()> {
        if self.entities.remove(&entity_id).is_none() {
            return Err(StoreFailure::not_found(format!("entity {entity_id}")));
        }
        let dropped: Vec<Uuid> = self
            .connections
            .values()
            .filter(|c| c.restaurant_id == entity_id || c.dish_or_category_id == entity_id)
            .map(|c| c.connection_id)
            .collect();
        for id in &dropped {
            self.connections.remove(id);
        }
        self.mentions
            .retain(|_, m| !dropped.contains(&m.connection_id));
        for connection in self.connections.values_mut() {
            connection.categories.retain(|id| *id != entity_id);
            connection.dish_attributes.retain(|id| *id != entity_id);
        }
        Ok(())
    }

    fn find_entities(&self, query: &EntityQuery) -> Vec<Entity> {
        let mut rows: Vec<Entity> = self
            .entities
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        query.sort(&mut rows);
        truncate(rows, query.limit)
    }

    fn check_connection_refs(&self, draft: &NewConnection) -> StoreResult<()> {
        self.check_connection_kinds(
            draft.restaurant_id,
            draft.dish_or_category_id,
            &draft.categories,
            &draft.dish_attributes,
        )
    }

    /// Every referenced id must exist and be of the kind its slot expects.
    fn check_connection_kinds(
        &self,
        restaurant_id: Uuid,
        dish_or_category_id: Uuid,
        categories: &[Uuid],
        dish_attributes: &[Uuid],
    ) -> StoreResult<()> {
        let mut refs = vec![
            (restaurant_id, EntityType::Restaurant, constraints::CONNECTION_RESTAURANT_FK),
            (dish_or_category_id, EntityType::DishOrCategory, constraints::CONNECTION_DISH_FK),
        ];
        refs.extend(
            categories
                .iter()
                .map(|id| (*id, EntityType::DishOrCategory, constraints::CONNECTION_CATEGORIES_FK)),
        );
        refs.extend(dish_attributes.iter().map(|id| {
            (*id, EntityType::DishAttribute, constraints::CONNECTION_DISH_ATTRIBUTES_FK)
        }));
        for (id, expected, constraint) in refs {
            match self.entities.get(&id) {
                Some(entity) if entity.entity_type == expected => {}
                Some(entity) => {
                    return Err(StoreFailure::foreign_key(
                        constraint,
                        format!("entity {id} is a {}, expected {expected}", entity.entity_type),
                    ))
                }
                None => {
                    return Err(StoreFailure::foreign_key(
                        constraint,
                        format!("{expected} {id} does not exist"),
                    ))
                }
            }
        }
        Ok(())
    }

    fn find_pair(&self, restaurant_id: Uuid, dish_or_category_id: Uuid) -> Option<Uuid> {
        self.connections
            .values()
            .find(|c| c.restaurant_id == restaurant_id && c.dish_or_category_id == dish_or_category_id)
            .map(|c| c.connection_id)
    }

    fn insert_connection(
        &mut self,
        draft: &NewConnection,
        now: DateTime<Utc>,
    ) -> StoreResult<Connection> {
        self.check_connection_refs(draft)?;
        if self
            .find_pair(draft.restaurant_id, draft.dish_or_category_id)
            .is_some()
        {
            return Err(StoreFailure::unique(
                constraints::CONNECTION_PAIR,
                format!("connection {} already exists", draft.pair_key()),
            ));
        }
        let connection = Connection {
            connection_id: Uuid::new_v4(),
            restaurant_id: draft.restaurant_id,
            dish_or_category_id: draft.dish_or_category_id,
            is_menu_item: draft.is_menu_item,
            categories: draft.categories.clone(),
            dish_attributes: draft.dish_attributes.clone(),
            metrics: draft.metrics.clone(),
            created_at: now,
            updated_at: now,
        };
        self.connections
            .insert(connection.connection_id, connection.clone());
        Ok(connection)
    }

    fn insert_connections(
        &mut self,
        drafts: &[NewConnection],
        skip_duplicates: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut next = self.clone();
        let mut inserted = 0;
        for draft in drafts {
            match next.insert_connection(draft, now) {
                Ok(_) => inserted += 1,
                Err(f) if skip_duplicates && f.code == FailureCode::UniqueViolation => {}
                Err(f) => return Err(f),
            }
        }
        *self = next;
        Ok(inserted)
    }

    fn upsert_connection(
        &mut self,
        draft: &NewConnection,
        now: DateTime<Utc>,
    ) -> StoreResult<Connection> {
        self.check_connection_refs(draft)?;
        let existing = self.find_pair(draft.restaurant_id, draft.dish_or_category_id);
        if let Some(existing) = existing.and_then(|id| self.connections.get_mut(&id)) {
            existing.absorb(draft, now);
            return Ok(existing.clone());
        }
        self.insert_connection(draft, now)
    }

    fn update_connection(
        &mut self,
        connection_id: Uuid,
        patch: &ConnectionPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<Connection> {
        let mut connection = self
            .connections
            .get(&connection_id)
            .cloned()
            .ok_or_else(|| StoreFailure::not_found(format!("connection {connection_id}")))?;
        connection.apply_patch(patch, now);
        self.check_connection_kinds(
            connection.restaurant_id,
            connection.dish_or_category_id,
            &connection.categories,
            &connection.dish_attributes,
        )?;
        self.connections.insert(connection_id, connection.clone());
        Ok(connection)
    }

    fn find_connections(&self, filter: &ConnectionFilter) -> Vec<Connection> {
        let mut rows: Vec<Connection> = self
            .connections
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        ConnectionFilter::sort(&mut rows);
        truncate(rows, filter.limit)
    }

    fn insert_mention(&mut self, draft: &NewMention, now: DateTime<Utc>) -> StoreResult<Mention> {
        if !self.connections.contains_key(&draft.connection_id) {
            return Err(StoreFailure::foreign_key(
                constraints::MENTION_CONNECTION_FK,
                format!("connection {} does not exist", draft.connection_id),
            ));
        }
        let duplicate = self.mentions.values().any(|m| {
            m.connection_id == draft.connection_id
                && m.source_type == draft.source_type
                && m.source_id == draft.source_id
        });
        if duplicate {
            return Err(StoreFailure::unique(
                constraints::MENTION_SOURCE,
                format!("mention {} already recorded", draft.source_key()),
            ));
        }
        let mention = Mention {
            mention_id: Uuid::new_v4(),
            connection_id: draft.connection_id,
            source_type: draft.source_type,
            source_id: draft.source_id.clone(),
            source_url: draft.source_url.clone(),
            subreddit: draft.subreddit.clone(),
            content_excerpt: draft.content_excerpt.clone(),
            author: draft.author.clone(),
            upvotes: draft.upvotes,
            created_at: draft.created_at,
            processed_at: now,
        };
        self.mentions.insert(mention.mention_id, mention.clone());
        Ok(mention)
    }

    fn insert_mentions(
        &mut self,
        drafts: &[NewMention],
        skip_duplicates: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut next = self.clone();
        let mut inserted = 0;
        for draft in drafts {
            match next.insert_mention(draft, now) {
                Ok(_) => inserted += 1,
                Err(f) if skip_duplicates && f.code == FailureCode::UniqueViolation => {}
                Err(f) => return Err(f),
            }
        }
        *self = next;
        Ok(inserted)
    }

    fn find_mentions(&self, filter: &MentionFilter) -> Vec<Mention> {
        let mut rows: Vec<Mention> = self
            .mentions
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.mention_id.cmp(&b.mention_id))
        });
        rows
    }
}

// ── Instrumentation ──

#[derive(Default)]
struct Probes {
    calls: StdMutex<HashMap<&'static str, usize>>,
    /// Per operation, the outcome of each upcoming call; `None` lets it pass.
    faults: StdMutex<HashMap<&'static str, VecDeque<Option<StoreFailure>>>>,
    racers: StdMutex<VecDeque<NewEntity>>,
}

impl Probes {
    fn enter(&self, op: &'static str) -> StoreResult<()> {
        *lock(&self.calls).entry(op).or_insert(0) += 1;
        match lock(&self.faults).get_mut(op).and_then(VecDeque::pop_front) {
            Some(Some(failure)) => Err(failure),
            _ => Ok(()),
        }
    }

    fn take_racer(&self) -> Option<NewEntity> {
        lock(&self.racers).pop_front()
    }
}

// ── Store ──

/// In-memory [`CatalogStore`]. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<CatalogState>>,
    probes: Arc<Probes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls made to `op` (see [`ops`]), inside or outside
    /// transactions.
    pub fn call_count(&self, op: &str) -> usize {
        lock(&self.probes.calls).get(op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.probes.calls).values().sum()
    }

    pub fn reset_calls(&self) {
        lock(&self.probes.calls).clear();
    }

    /// Fail the next call to `op` with `failure`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, op: &'static str, failure: StoreFailure) {
        self.fail_after(op, 0, failure);
    }

    /// Let `passes` more calls to `op` through, then fail the one after.
    pub fn fail_after(&self, op: &'static str, passes: usize, failure: StoreFailure) {
        let mut faults = lock(&self.probes.faults);
        let queue = faults.entry(op).or_default();
        queue.extend(std::iter::repeat_with(|| None).take(passes));
        queue.push_back(Some(failure));
    }

    /// Make the next transaction commit abort.
    pub fn fail_next_commit(&self) {
        self.fail_next(ops::COMMIT, StoreFailure::other("commit aborted"));
    }

    /// Let `passes` commits succeed, then abort the next one.
    pub fn fail_commit_after(&self, passes: usize) {
        self.fail_after(ops::COMMIT, passes, StoreFailure::other("commit aborted"));
    }

    /// Insert `draft` right before the next `create_entity` call, as if a
    /// concurrent writer got there first.
    pub fn stage_concurrent_insert(&self, draft: NewEntity) {
        lock(&self.probes.racers).push_back(draft);
    }

    pub async fn entity_count(&self) -> usize {
        self.state.lock().await.entities.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn mention_count(&self) -> usize {
        self.state.lock().await.mentions.len()
    }

    async fn with_state<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut CatalogState) -> R + Send,
    {
        let mut state = self.state.lock().await;
        f(&mut state)
    }
}

/// Transaction handle handed out by [`MemoryStore::begin`].
pub struct MemoryTransaction {
    committed: OwnedMutexGuard<CatalogState>,
    staged: StdMutex<CatalogState>,
    probes: Arc<Probes>,
}

impl MemoryTransaction {
    async fn with_state<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut CatalogState) -> R + Send,
    {
        f(&mut lock(&self.staged))
    }
}

macro_rules! memory_catalog_ops {
    ($target:ty) => {
        #[async_trait]
        impl CatalogOps for $target {
            async fn create_entity(&self, draft: &NewEntity) -> StoreResult<Entity> {
                self.probes.enter(ops::ENTITY_CREATE)?;
                let racer = self.probes.take_racer();
                self.with_state(|s| {
                    if let Some(racer) = racer {
                        // The racer may itself conflict; it only needs to exist.
                        let _ = s.insert_entity(&racer, Utc::now());
                    }
                    s.insert_entity(draft, Utc::now())
                })
                .await
            }

            async fn create_entities(
                &self,
                drafts: &[NewEntity],
                skip_duplicates: bool,
            ) -> StoreResult<u64> {
                self.probes.enter(ops::ENTITY_CREATE_MANY)?;
                self.with_state(|s| s.insert_entities(drafts, skip_duplicates, Utc::now()))
                    .await
            }

            async fn upsert_entity(&self, draft: &NewEntity) -> StoreResult<Entity> {
                self.probes.enter(ops::ENTITY_UPSERT)?;
                self.with_state(|s| s.upsert_entity(draft, Utc::now()))
                    .await
            }

            async fn find_entity(&self, entity_id: Uuid) -> StoreResult<Option<Entity>> {
                self.probes.enter(ops::ENTITY_FIND_UNIQUE)?;
                self.with_state(|s| Ok(s.entities.get(&entity_id).cloned()))
                    .await
            }

            async fn find_entities(&self, query: &EntityQuery) -> StoreResult<Vec<Entity>> {
                self.probes.enter(ops::ENTITY_FIND_MANY)?;
                self.with_state(|s| Ok(s.find_entities(query))).await
            }

            async fn update_entity(
                &self,
                entity_id: Uuid,
                fields: &EntityFields,
            ) -> StoreResult<Entity> {
                self.probes.enter(ops::ENTITY_UPDATE)?;
                self.with_state(|s| s.update_entity(entity_id, fields, Utc::now()))
                    .await
            }

            async fn delete_entity(&self, entity_id: Uuid) -> StoreResult<()> {
                self.probes.enter(ops::ENTITY_DELETE)?;
                self.with_state(|s| s.delete_entity(entity_id)).await
            }

            async fn count_entities(&self, query: &EntityQuery) -> StoreResult<u64> {
                self.probes.enter(ops::ENTITY_COUNT)?;
                let unpaged = EntityQuery {
                    limit: None,
                    ..query.clone()
                };
                self.with_state(|s| Ok(s.find_entities(&unpaged).len() as u64))
                    .await
            }

            async fn create_connection(&self, draft: &NewConnection) -> StoreResult<Connection> {
                self.probes.enter(ops::CONNECTION_CREATE)?;
                self.with_state(|s| s.insert_connection(draft, Utc::now()))
                    .await
            }

            async fn create_connections(
                &self,
                drafts: &[NewConnection],
                skip_duplicates: bool,
            ) -> StoreResult<u64> {
                self.probes.enter(ops::CONNECTION_CREATE_MANY)?;
                self.with_state(|s| s.insert_connections(drafts, skip_duplicates, Utc::now()))
                    .await
            }

            async fn upsert_connection(&self, draft: &NewConnection) -> StoreResult<Connection> {
                self.probes.enter(ops::CONNECTION_UPSERT)?;
                self.with_state(|s| s.upsert_connection(draft, Utc::now()))
                    .await
            }

            async fn find_connection(
                &self,
                connection_id: Uuid,
            ) -> StoreResult<Option<Connection>> {
                self.probes.enter(ops::CONNECTION_FIND_UNIQUE)?;
                self.with_state(|s| Ok(s.connections.get(&connection_id).cloned()))
                    .await
            }

            async fn find_connections(
                &self,
                filter: &ConnectionFilter,
            ) -> StoreResult<Vec<Connection>> {
                self.probes.enter(ops::CONNECTION_FIND_MANY)?;
                self.with_state(|s| Ok(s.find_connections(filter))).await
            }

            async fn update_connection(
                &self,
                connection_id: Uuid,
                patch: &ConnectionPatch,
            ) -> StoreResult<Connection> {
                self.probes.enter(ops::CONNECTION_UPDATE)?;
                self.with_state(|s| s.update_connection(connection_id, patch, Utc::now()))
                    .await
            }

            async fn count_connections(&self, filter: &ConnectionFilter) -> StoreResult<u64> {
                self.probes.enter(ops::CONNECTION_COUNT)?;
                let unlimited = ConnectionFilter {
                    limit: None,
                    ..filter.clone()
                };
                self.with_state(|s| Ok(s.find_connections(&unlimited).len() as u64))
                    .await
            }

            async fn create_mention(&self, draft: &NewMention) -> StoreResult<Mention> {
                self.probes.enter(ops::MENTION_CREATE)?;
                self.with_state(|s| s.insert_mention(draft, Utc::now()))
                    .await
            }

            async fn create_mentions(
                &self,
                drafts: &[NewMention],
                skip_duplicates: bool,
            ) -> StoreResult<u64> {
                self.probes.enter(ops::MENTION_CREATE_MANY)?;
                self.with_state(|s| s.insert_mentions(drafts, skip_duplicates, Utc::now()))
                    .await
            }

            async fn find_mentions(&self, filter: &MentionFilter) -> StoreResult<Vec<Mention>> {
                self.probes.enter(ops::MENTION_FIND_MANY)?;
                self.with_state(|s| Ok(s.find_mentions(filter))).await
            }

            async fn count_mentions(&self, filter: &MentionFilter) -> StoreResult<u64> {
                self.probes.enter(ops::MENTION_COUNT)?;
                self.with_state(|s| Ok(s.find_mentions(filter).len() as u64))
                    .await
            }
        }
    };
}

memory_catalog_ops!(MemoryStore);
memory_catalog_ops!(MemoryTransaction);

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn as_ops(&self) -> &dyn CatalogOps {
        self
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        // A failed commit drops the handle, discarding the staged state.
        self.probes.enter(ops::COMMIT)?;
        let MemoryTransaction {
            mut committed,
            staged,
            ..
        } = *self;
        *committed = staged.into_inner().unwrap_or_else(PoisonError::into_inner);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.probes.enter(ops::ROLLBACK)?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        self.probes.enter(ops::BEGIN)?;
        let committed = self.state.clone().lock_owned().await;
        let staged = StdMutex::new(committed.clone());
        Ok(Box::new(MemoryTransaction {
            committed,
            staged,
            probes: self.probes.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionFields, EntityType, MentionSource};

    fn draft(kind: EntityType, name: &str) -> NewEntity {
        let fields = EntityFields::named(name);
        let fields = if kind == EntityType::Restaurant {
            fields.with_address("1 Congress Ave")
        } else {
            fields
        };
        fields.into_new_entity(kind).unwrap()
    }

    #[tokio::test]
    async fn test_name_type_uniqueness() {
        let store = MemoryStore::new();
        store
            .create_entity(&draft(EntityType::DishOrCategory, "Brisket"))
            .await
            .unwrap();
        let err = store
            .create_entity(&draft(EntityType::DishOrCategory, "Brisket"))
            .await
            .unwrap_err();
        assert_eq!(err.code, FailureCode::UniqueViolation);
        assert_eq!(
            err.constraint.as_deref(),
            Some(constraints::ENTITY_NAME_TYPE)
        );

        // Same name, other kind is a different entity.
        store
            .create_entity(&draft(EntityType::DishAttribute, "Brisket"))
            .await
            .unwrap();
        assert_eq!(store.entity_count().await, 2);
    }

    #[tokio::test]
    async fn test_attribute_names_are_unique_ignoring_case() {
        let store = MemoryStore::new();
        store
            .create_entity(&draft(EntityType::DishAttribute, "Spicy"))
            .await
            .unwrap();
        let err = store
            .create_entity(&draft(EntityType::DishAttribute, "SPICY"))
            .await
            .unwrap_err();
        assert_eq!(
            err.constraint.as_deref(),
            Some(constraints::ENTITY_ATTRIBUTE_NAME_CI)
        );
    }

    #[tokio::test]
    async fn test_create_many_skips_duplicates() {
        let store = MemoryStore::new();
        let drafts = vec![
            draft(EntityType::DishOrCategory, "Tacos"),
            draft(EntityType::DishOrCategory, "Tacos"),
            draft(EntityType::DishOrCategory, "Queso"),
        ];
        let inserted = store.create_entities(&drafts, true).await.unwrap();
        assert_eq!(inserted, 2);

        let err = store.create_entities(&drafts, false).await.unwrap_err();
        assert_eq!(err.code, FailureCode::UniqueViolation);
        assert_eq!(store.entity_count().await, 2);
    }

    #[tokio::test]
    async fn test_create_many_is_all_or_nothing_on_foreign_key() {
        let store = MemoryStore::new();
        let r = store
            .create_entity(&draft(EntityType::Restaurant, "Franklin"))
            .await
            .unwrap();
        let d = store
            .create_entity(&draft(EntityType::DishOrCategory, "Brisket"))
            .await
            .unwrap();
        let drafts = vec![
            ConnectionFields::menu_item().for_pair(r.entity_id, d.entity_id),
            ConnectionFields::menu_item().for_pair(Uuid::new_v4(), d.entity_id),
        ];
        let err = store.create_connections(&drafts, true).await.unwrap_err();
        assert_eq!(err.code, FailureCode::ForeignKeyViolation);
        assert_eq!(store.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_cascades_connections_and_mentions() {
        let store = MemoryStore::new();
        let r = store
            .create_entity(&draft(EntityType::Restaurant, "Veracruz"))
            .await
            .unwrap();
        let d = store
            .create_entity(&draft(EntityType::DishOrCategory, "Migas Taco"))
            .await
            .unwrap();
        let c = store
            .create_connection(&ConnectionFields::menu_item().for_pair(r.entity_id, d.entity_id))
            .await
            .unwrap();
        store
            .create_mention(&NewMention {
                connection_id: c.connection_id,
                source_type: MentionSource::Comment,
                source_id: "c1".to_string(),
                source_url: "https://reddit.com/c1".to_string(),
                subreddit: "austinfood".to_string(),
                content_excerpt: "so good".to_string(),
                author: None,
                upvotes: 5,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        store.delete_entity(d.entity_id).await.unwrap();
        assert_eq!(store.connection_count().await, 0);
        assert_eq!(store.mention_count().await, 0);

        let err = store.delete_entity(d.entity_id).await.unwrap_err();
        assert_eq!(err.code, FailureCode::RecordNotFound);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let store = MemoryStore::new();
        let tx = store.begin().await.unwrap();
        tx.create_entity(&draft(EntityType::DishOrCategory, "Kolache"))
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.entity_count().await, 0);

        let tx = store.begin().await.unwrap();
        tx.create_entity(&draft(EntityType::DishOrCategory, "Kolache"))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.entity_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_commit_discards_staged_writes() {
        let store = MemoryStore::new();
        store.fail_next_commit();
        let tx = store.begin().await.unwrap();
        tx.create_entity(&draft(EntityType::DishOrCategory, "Kolache"))
            .await
            .unwrap();
        assert!(tx.commit().await.is_err());
        assert_eq!(store.entity_count().await, 0);
    }

    #[tokio::test]
    async fn test_calls_are_counted_and_faults_consumed_once() {
        let store = MemoryStore::new();
        store.fail_next(ops::ENTITY_FIND_MANY, StoreFailure::transient("timeout"));
        let query = EntityQuery::of_kind(EntityType::Restaurant);
        assert!(store.find_entities(&query).await.is_err());
        assert!(store.find_entities(&query).await.is_ok());
        assert_eq!(store.call_count(ops::ENTITY_FIND_MANY), 2);
        assert_eq!(store.total_calls(), 2);
    }
}
