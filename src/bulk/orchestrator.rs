//! Bulk Write Orchestrator
//!
//! Inputs are cut into consecutive batches of `batch_size`. Each batch is
//! validated item by item, then written inside its own transaction (when
//! enabled) and committed before the next batch starts.
//!
//! Create calls issue one skip-duplicates insert per batch. If that statement
//! fails, the batch is replayed one item at a time so only the offending
//! items are reported. Upsert calls write one item at a time. Transient store
//! failures are retried per statement; anything that stops a batch's
//! transaction from opening or committing is returned as
//! [`BulkWriteError::BatchAborted`].

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info, info_span, warn, Instrument};

use super::metrics::{BatchTally, MetricsCollector};
use super::result::{BulkItemError, BulkWriteError, BulkWriteResult};
use crate::config::BulkOperationConfig;
use crate::context::OperationContext;
use crate::error::{translate, CatalogError, CatalogResult, ErrorContext, Operation, ValidationError};
use crate::models::{EntityFields, EntityType, NewConnection, NewEntity, NewMention};
use crate::repository::connection::check_pair;
use crate::store::{CatalogOps, CatalogStore, StoreResult};

/// An entity to write, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityInput {
    pub entity_type: EntityType,
    pub fields: EntityFields,
}

impl EntityInput {
    pub fn new(entity_type: EntityType, fields: EntityFields) -> Self {
        Self {
            entity_type,
            fields,
        }
    }
}

type InsertMany<D> = for<'a> fn(&'a dyn CatalogOps, &'a [D]) -> BoxFuture<'a, StoreResult<u64>>;
type UpsertOne<D> = for<'a> fn(&'a dyn CatalogOps, &'a D) -> BoxFuture<'a, StoreResult<()>>;

enum WriteMode<D> {
    InsertSkipping(InsertMany<D>),
    UpsertEach(UpsertOne<D>),
}

/// How one record kind is validated and written.
struct WritePlan<T, D> {
    record: &'static str,
    prepare: fn(&T) -> Result<D, ValidationError>,
    key: fn(&D) -> String,
    mode: WriteMode<D>,
}

impl<T, D> WritePlan<T, D> {
    fn item_context(&self, draft: &D) -> ErrorContext {
        let operation = match self.mode {
            WriteMode::InsertSkipping(_) => Operation::Create,
            WriteMode::UpsertEach(_) => Operation::Upsert,
        };
        ErrorContext::new(self.record, operation).with_key((self.key)(draft))
    }
}

// ── Per-kind plans ──

fn prepare_entity(input: &EntityInput) -> Result<NewEntity, ValidationError> {
    input.fields.clone().into_new_entity(input.entity_type)
}

fn prepare_connection(draft: &NewConnection) -> Result<NewConnection, ValidationError> {
    check_pair(draft)?;
    Ok(draft.clone())
}

fn prepare_mention(draft: &NewMention) -> Result<NewMention, ValidationError> {
    draft.validate()?;
    Ok(draft.clone())
}

fn insert_entities<'a>(ops: &'a dyn CatalogOps, drafts: &'a [NewEntity]) -> BoxFuture<'a, StoreResult<u64>> {
    ops.create_entities(drafts, true)
}

fn insert_connections<'a>(
    ops: &'a dyn CatalogOps,
    drafts: &'a [NewConnection],
) -> BoxFuture<'a, StoreResult<u64>> {
    ops.create_connections(drafts, true)
}

fn insert_mentions<'a>(ops: &'a dyn CatalogOps, drafts: &'a [NewMention]) -> BoxFuture<'a, StoreResult<u64>> {
    ops.create_mentions(drafts, true)
}

fn upsert_entity<'a>(ops: &'a dyn CatalogOps, draft: &'a NewEntity) -> BoxFuture<'a, StoreResult<()>> {
    Box::pin(async move { ops.upsert_entity(draft).await.map(|_| ()) })
}

fn upsert_connection<'a>(
    ops: &'a dyn CatalogOps,
    draft: &'a NewConnection,
) -> BoxFuture<'a, StoreResult<()>> {
    Box::pin(async move { ops.upsert_connection(draft).await.map(|_| ()) })
}

const ENTITY_CREATE: WritePlan<EntityInput, NewEntity> = WritePlan {
    record: "entity",
    prepare: prepare_entity,
    key: NewEntity::natural_key,
    mode: WriteMode::InsertSkipping(insert_entities),
};

const ENTITY_UPSERT: WritePlan<EntityInput, NewEntity> = WritePlan {
    record: "entity",
    prepare: prepare_entity,
    key: NewEntity::natural_key,
    mode: WriteMode::UpsertEach(upsert_entity),
};

const CONNECTION_CREATE: WritePlan<NewConnection, NewConnection> = WritePlan {
    record: "connection",
    prepare: prepare_connection,
    key: NewConnection::pair_key,
    mode: WriteMode::InsertSkipping(insert_connections),
};

const CONNECTION_UPSERT: WritePlan<NewConnection, NewConnection> = WritePlan {
    record: "connection",
    prepare: prepare_connection,
    key: NewConnection::pair_key,
    mode: WriteMode::UpsertEach(upsert_connection),
};

const MENTION_CREATE: WritePlan<NewMention, NewMention> = WritePlan {
    record: "mention",
    prepare: prepare_mention,
    key: NewMention::source_key,
    mode: WriteMode::InsertSkipping(insert_mentions),
};

/// Outcome of one batch, folded into the call's result once it commits.
#[derive(Default)]
struct BatchOutcome {
    tally: BatchTally,
    errors: Vec<BulkItemError>,
}

impl BatchOutcome {
    fn fail(&mut self, index: usize, batch_index: usize, error: CatalogError) {
        self.tally.failed += 1;
        self.errors.push(BulkItemError {
            index,
            batch_index,
            error,
        });
    }
}

/// Batched writer over a [`CatalogStore`].
pub struct BulkWriter<S: CatalogStore> {
    store: Arc<S>,
    defaults: BulkOperationConfig,
}

impl<S: CatalogStore> Clone for BulkWriter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            defaults: self.defaults.clone(),
        }
    }
}

impl<S: CatalogStore> BulkWriter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            defaults: BulkOperationConfig::default(),
        }
    }

    /// Configuration used when a call passes `None`.
    pub fn with_defaults(mut self, defaults: BulkOperationConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> &BulkOperationConfig {
        &self.defaults
    }

    /// Insert entities, skipping any whose natural key already exists.
    pub async fn bulk_create_entities(
        &self,
        ctx: &OperationContext,
        items: &[EntityInput],
        config: Option<&BulkOperationConfig>,
    ) -> Result<BulkWriteResult, BulkWriteError> {
        self.run(ctx, "bulk_create_entities", &ENTITY_CREATE, items, config)
            .await
    }

    /// Insert or merge entities one at a time.
    pub async fn bulk_upsert_entities(
        &self,
        ctx: &OperationContext,
        items: &[EntityInput],
        config: Option<&BulkOperationConfig>,
    ) -> Result<BulkWriteResult, BulkWriteError> {
        self.run(ctx, "bulk_upsert_entities", &ENTITY_UPSERT, items, config)
            .await
    }

    /// Insert connections, skipping pairs that already have one.
    pub async fn bulk_create_connections(
        &self,
        ctx: &OperationContext,
        items: &[NewConnection],
        config: Option<&BulkOperationConfig>,
    ) -> Result<BulkWriteResult, BulkWriteError> {
        self.run(ctx, "bulk_create_connections", &CONNECTION_CREATE, items, config)
            .await
    }

    /// Insert connections or merge them monotonically into existing pairs.
    pub async fn bulk_upsert_connections(
        &self,
        ctx: &OperationContext,
        items: &[NewConnection],
        config: Option<&BulkOperationConfig>,
    ) -> Result<BulkWriteResult, BulkWriteError> {
        self.run(ctx, "bulk_upsert_connections", &CONNECTION_UPSERT, items, config)
            .await
    }

    /// Append mentions. A mention already recorded for the same connection
    /// and source is skipped.
    pub async fn bulk_create_mentions(
        &self,
        ctx: &OperationContext,
        items: &[NewMention],
        config: Option<&BulkOperationConfig>,
    ) -> Result<BulkWriteResult, BulkWriteError> {
        self.run(ctx, "bulk_create_mentions", &MENTION_CREATE, items, config)
            .await
    }

    async fn run<T, D>(
        &self,
        ctx: &OperationContext,
        operation: &'static str,
        plan: &WritePlan<T, D>,
        items: &[T],
        config: Option<&BulkOperationConfig>,
    ) -> Result<BulkWriteResult, BulkWriteError>
    where
        T: Sync,
        D: Send + Sync,
    {
        let config = config.unwrap_or(&self.defaults);
        config.validate()?;

        let span = info_span!(
            parent: ctx.span(),
            "bulk_write",
            operation,
            correlation_id = %ctx.correlation_id(),
            total_items = items.len(),
            batch_size = config.batch_size,
        );

        async move {
            info!(
                "Starting {} for {} {} item(s)",
                operation,
                items.len(),
                plan.record
            );
            let mut collector = MetricsCollector::start(items.len());
            let mut errors = Vec::new();

            for (batch_index, chunk) in items.chunks(config.batch_size).enumerate() {
                collector.batch_started();
                let offset = batch_index * config.batch_size;
                let outcome = self
                    .write_batch(plan, batch_index, offset, chunk, config)
                    .instrument(info_span!("bulk_batch", batch_index, size = chunk.len()))
                    .await?;
                collector.record_batch(&outcome.tally);
                errors.extend(outcome.errors);
            }

            let metrics = collector.finish();
            if config.enable_metrics {
                info!(
                    operation,
                    total_items = metrics.total_items,
                    success_count = metrics.success_count,
                    failure_count = metrics.failure_count,
                    skipped_count = metrics.skipped_count,
                    batch_count = metrics.batch_count,
                    duration_ms = metrics.duration.as_millis() as u64,
                    throughput = metrics.throughput,
                    "Bulk operation completed"
                );
            } else {
                debug!(
                    operation,
                    success_count = metrics.success_count,
                    failure_count = metrics.failure_count,
                    batch_count = metrics.batch_count,
                    "Bulk operation completed"
                );
            }

            Ok::<_, BulkWriteError>(BulkWriteResult {
                success_count: metrics.success_count,
                failure_count: metrics.failure_count,
                errors,
                metrics,
            })
        }
        .instrument(span)
        .await
    }

    async fn write_batch<T, D>(
        &self,
        plan: &WritePlan<T, D>,
        batch_index: usize,
        offset: usize,
        chunk: &[T],
        config: &BulkOperationConfig,
    ) -> Result<BatchOutcome, BulkWriteError>
    where
        T: Sync,
        D: Send + Sync,
    {
        let mut outcome = BatchOutcome::default();
        let mut indices = Vec::with_capacity(chunk.len());
        let mut drafts = Vec::with_capacity(chunk.len());
        for (i, item) in chunk.iter().enumerate() {
            match (plan.prepare)(item) {
                Ok(draft) => {
                    indices.push(offset + i);
                    drafts.push(draft);
                }
                Err(e) => outcome.fail(offset + i, batch_index, e.into()),
            }
        }

        if drafts.is_empty() {
            debug!(batch_index, "No valid items in batch, skipping store");
            return Ok(outcome);
        }

        if config.enable_transactions {
            let begin_ctx = ErrorContext::new(plan.record, Operation::Begin);
            let tx = with_retry(config, &begin_ctx, || self.store.begin())
                .await
                .map_err(|source| BulkWriteError::BatchAborted {
                    batch_index,
                    source,
                })?;

            apply(plan, tx.as_ops(), batch_index, &indices, &drafts, config, &mut outcome).await;

            tx.commit().await.map_err(|failure| {
                warn!(batch_index, "Batch transaction failed to commit");
                BulkWriteError::BatchAborted {
                    batch_index,
                    source: translate(failure, &ErrorContext::new(plan.record, Operation::Commit)),
                }
            })?;
        } else {
            let ops: &dyn CatalogOps = &*self.store;
            apply(plan, ops, batch_index, &indices, &drafts, config, &mut outcome).await;
        }

        outcome.errors.sort_by_key(|e| e.index);
        debug!(
            batch_index,
            written = outcome.tally.written,
            skipped = outcome.tally.skipped,
            failed = outcome.tally.failed,
            "Batch completed"
        );
        Ok(outcome)
    }
}

async fn apply<T, D>(
    plan: &WritePlan<T, D>,
    ops: &dyn CatalogOps,
    batch_index: usize,
    indices: &[usize],
    drafts: &[D],
    config: &BulkOperationConfig,
    outcome: &mut BatchOutcome,
) where
    D: Send + Sync,
{
    match plan.mode {
        WriteMode::InsertSkipping(insert) => {
            let batch_ctx = ErrorContext::new(plan.record, Operation::CreateMany);
            match with_retry(config, &batch_ctx, || insert(ops, drafts)).await {
                Ok(inserted) => {
                    let inserted = inserted as usize;
                    outcome.tally.written += inserted;
                    outcome.tally.skipped += drafts.len().saturating_sub(inserted);
                }
                Err(err) => {
                    debug!(batch_index, error = %err, "Batch insert failed, replaying per item");
                    for (&index, draft) in indices.iter().zip(drafts) {
                        let item_ctx = plan.item_context(draft);
                        let single = std::slice::from_ref(draft);
                        match with_retry(config, &item_ctx, || insert(ops, single)).await {
                            Ok(0) => outcome.tally.skipped += 1,
                            Ok(_) => outcome.tally.written += 1,
                            Err(e) => outcome.fail(index, batch_index, e),
                        }
                    }
                }
            }
        }
        WriteMode::UpsertEach(upsert) => {
            for (&index, draft) in indices.iter().zip(drafts) {
                let item_ctx = plan.item_context(draft);
                match with_retry(config, &item_ctx, || upsert(ops, draft)).await {
                    Ok(()) => outcome.tally.written += 1,
                    Err(e) => outcome.fail(index, batch_index, e),
                }
            }
        }
    }
}

/// Run a store call, retrying transient failures up to `max_retries` times.
async fn with_retry<'a, R, F>(
    config: &BulkOperationConfig,
    ctx: &ErrorContext,
    mut call: F,
) -> CatalogResult<R>
where
    F: FnMut() -> BoxFuture<'a, StoreResult<R>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(failure) => {
                let err = translate(failure, ctx);
                if !err.is_retryable() || attempt >= config.max_retries {
                    return Err(err);
                }
                attempt += 1;
                warn!(
                    target_op = %ctx,
                    attempt,
                    max_retries = config.max_retries,
                    error = %err,
                    "Transient store failure, retrying"
                );
                tokio::time::sleep(config.retry_delay).await;
            }
        }
    }
}
