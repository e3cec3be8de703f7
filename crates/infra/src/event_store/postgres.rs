//! Postgres-backed event store implementation.
//!
//! ## Append
//!
//! One transaction per append:
//! 1. Register the stream row if missing, then lock it (`SELECT ... FOR UPDATE`)
//! 2. Evaluate the expected version against the locked position
//! 3. Bulk-insert the batch; `global_position` comes from a sequence and
//!    `transaction_id` from `pg_current_xact_id()`, shared by the whole batch
//! 4. Move the stream row to the new position and commit
//!
//! Concurrent appends to one stream serialize on the row lock, so the second
//! writer sees the first writer's position and fails its version check.
//!
//! ## Reads
//!
//! `read_stream` runs in a `REPEATABLE READ, READ ONLY` transaction so the
//! stream version and the events come from one snapshot.
//!
//! `read_all` pages by `(transaction_id, global_position)` and only returns
//! rows written by transactions older than the oldest transaction still
//! running. Every transaction below that horizon has finished, so a row that
//! becomes visible later always carries a higher transaction id than anything
//! already returned. Paging by the sequence value alone would not do: an append
//! takes its transaction id when it registers the stream and draws `nextval`
//! later, so a lower sequence value can commit after a higher one.
//!
//! ## Thread Safety
//!
//! `PostgresEventStore` is `Send + Sync` and cheap to clone; all state lives in
//! the SQLx pool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};
use tracing::{Span, debug, instrument};

use strata_core::{AgeBucket, ConcurrencyConflict, EventId, GlobalPosition, PartitionKey};

use super::r#trait::{
    AppendResult, AppendToStreamOptions, EventStore, EventStoreError, ReadAllOptions,
    ReadStreamOptions, ReadStreamResult, StoredEvent, UncommittedEvent, validate_stream_name,
};
use crate::db::postgres::{UNIQUE_VIOLATION, has_code, map_sqlx_error, to_bigint};
use crate::partitions::{PartitionCache, PostgresPartitionManager};

/// Postgres-backed append-only, partitioned event store.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    partitions: PostgresPartitionManager,
    cache: Arc<PartitionCache>,
}

impl PostgresEventStore {
    /// Expects a pool over a schema prepared by `db::postgres::migrate`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            partitions: PostgresPartitionManager::new(pool.clone()),
            pool,
            cache: Arc::new(PartitionCache::default()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn partition_manager(&self) -> &PostgresPartitionManager {
        &self.partitions
    }

    /// Load a stream (or a slice of it) from one snapshot.
    #[instrument(
        skip(self, options),
        fields(
            stream = %stream_name,
            partition = %options.scope.partition_key(),
            expected_version = ?options.expected_version,
            event_count
        ),
        err
    )]
    pub async fn load_stream(
        &self,
        stream_name: &str,
        options: ReadStreamOptions,
    ) -> Result<ReadStreamResult, EventStoreError> {
        validate_stream_name(stream_name)?;
        let key = options.scope.partition_key();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;

        let current: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT stream_position
            FROM strata_streams
            WHERE stream_id = $1 AND partition = $2
            "#,
        )
        .bind(stream_name)
        .bind(key.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("read_stream_version", e))?;

        // 0 is the placeholder an append writes before its first insert.
        let current = current.filter(|v| *v > 0).map(|v| v as u64);

        // Dropping `tx` on the error path rolls it back.
        options.expected_version.check(stream_name, current)?;

        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                stream_id,
                stream_position,
                partition,
                is_archived,
                event_type,
                event_schema_version,
                event_data,
                event_metadata,
                global_position,
                transaction_id,
                created_at
            FROM strata_events
            WHERE stream_id = $1 AND partition = $2 AND stream_position >= $3
            ORDER BY stream_position ASC
            LIMIT $4
            "#,
        )
        .bind(stream_name)
        .bind(key.as_str())
        .bind(to_bigint(options.from.unwrap_or(1)))
        .bind(options.max_count.map(to_bigint))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("read_stream", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let events = rows
            .iter()
            .map(|row| {
                StoredEventRow::from_row(row)
                    .map_err(|e| map_sqlx_error("decode_event_row", e))?
                    .try_into()
            })
            .collect::<Result<Vec<StoredEvent>, EventStoreError>>()?;

        Span::current().record("event_count", events.len());
        Ok(ReadStreamResult {
            current_stream_version: current,
            events,
        })
    }

    /// Append a batch with optimistic concurrency control.
    #[instrument(
        skip(self, events, options),
        fields(
            stream = %stream_name,
            partition = %options.scope.partition_key(),
            event_count = events.len(),
            expected_version = ?options.expected_version
        ),
        err
    )]
    pub async fn append_events(
        &self,
        stream_name: &str,
        events: Vec<UncommittedEvent>,
        options: AppendToStreamOptions,
    ) -> Result<AppendResult, EventStoreError> {
        validate_stream_name(stream_name)?;
        if events.is_empty() {
            return Err(EventStoreError::InvalidAppend(format!(
                "no events to append to '{stream_name}'"
            )));
        }

        let key = options.scope.partition_key();
        self.cache.ensure(&self.partitions, &key).await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO strata_streams (stream_id, partition, module, tenant, stream_position)
            VALUES ($1, $2, $3, $4, 0)
            ON CONFLICT (stream_id, partition) DO NOTHING
            "#,
        )
        .bind(stream_name)
        .bind(key.as_str())
        .bind(key.module().as_str())
        .bind(key.tenant().as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("register_stream", e))?;

        let locked: i64 = sqlx::query_scalar(
            r#"
            SELECT stream_position
            FROM strata_streams
            WHERE stream_id = $1 AND partition = $2
            FOR UPDATE
            "#,
        )
        .bind(stream_name)
        .bind(key.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_stream", e))?;

        let current = (locked > 0).then_some(locked as u64);
        if let Err(conflict) = options.expected_version.check(stream_name, current) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(conflict.into());
        }

        let start = current.unwrap_or(0);
        let next_version = start + events.len() as u64;

        let mut insert = QueryBuilder::<Postgres>::new(
            "INSERT INTO strata_events (stream_id, stream_position, partition, event_id, \
             event_type, event_schema_version, event_data, event_metadata) ",
        );
        insert.push_values(events.iter().enumerate(), |mut row, (idx, event)| {
            row.push_bind(stream_name)
                .push_bind((start + idx as u64 + 1) as i64)
                .push_bind(key.as_str())
                .push_bind(*event.event_id.as_uuid())
                .push_bind(event.event_type.as_str())
                .push_bind(event.schema_version as i32)
                .push_bind(event.payload.as_slice())
                .push_bind(event.metadata.as_slice());
        });
        insert.push(" RETURNING global_position");

        let positions: Vec<i64> = insert
            .build_query_scalar::<i64>()
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| {
                if has_code(&e, UNIQUE_VIOLATION) {
                    EventStoreError::Concurrency(ConcurrencyConflict {
                        stream_name: stream_name.to_string(),
                        expected: options.expected_version,
                        actual: current,
                    })
                } else {
                    map_sqlx_error("insert_events", e)
                }
            })?;

        sqlx::query(
            r#"
            UPDATE strata_streams
            SET stream_position = $1, updated_at = now()
            WHERE stream_id = $2 AND partition = $3
            "#,
        )
        .bind(next_version as i64)
        .bind(stream_name)
        .bind(key.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_stream", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let last_global_position = positions
            .into_iter()
            .max()
            .map(|p| GlobalPosition::new(p as u64))
            .ok_or_else(|| EventStoreError::Storage("insert returned no positions".to_string()))?;

        debug!(version = next_version, global_position = %last_global_position, "appended events");
        Ok(AppendResult {
            next_expected_stream_version: next_version,
            last_global_position,
            created_new_stream: current.is_none(),
        })
    }

    /// Events of every stream after `options.after`, in log order.
    #[instrument(skip(self), fields(event_count), err)]
    pub async fn read_all_events(
        &self,
        options: ReadAllOptions,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                stream_id,
                stream_position,
                partition,
                is_archived,
                event_type,
                event_schema_version,
                event_data,
                event_metadata,
                global_position,
                transaction_id,
                created_at
            FROM strata_events
            WHERE (transaction_id, global_position) > ($1, $2)
              AND transaction_id < pg_snapshot_xmin(pg_current_snapshot())::text::bigint
            ORDER BY transaction_id ASC, global_position ASC
            LIMIT $3
            "#,
        )
        .bind(options.after.map_or(0, |p| to_bigint(p.transaction_id)))
        .bind(options.after.map_or(0, |p| to_bigint(p.global_position.value())))
        .bind(to_bigint(options.max_count))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_all", e))?;

        let events = rows
            .iter()
            .map(|row| {
                StoredEventRow::from_row(row)
                    .map_err(|e| map_sqlx_error("decode_event_row", e))?
                    .try_into()
            })
            .collect::<Result<Vec<StoredEvent>, EventStoreError>>()?;

        Span::current().record("event_count", events.len());
        Ok(events)
    }
}

// SQLx row types

#[derive(Debug)]
struct StoredEventRow {
    event_id: uuid::Uuid,
    stream_id: String,
    stream_position: i64,
    partition: String,
    is_archived: bool,
    event_type: String,
    event_schema_version: i32,
    event_data: Vec<u8>,
    event_metadata: Vec<u8>,
    global_position: i64,
    transaction_id: i64,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            stream_id: row.try_get("stream_id")?,
            stream_position: row.try_get("stream_position")?,
            partition: row.try_get("partition")?,
            is_archived: row.try_get("is_archived")?,
            event_type: row.try_get("event_type")?,
            event_schema_version: row.try_get("event_schema_version")?,
            event_data: row.try_get("event_data")?,
            event_metadata: row.try_get("event_metadata")?,
            global_position: row.try_get("global_position")?,
            transaction_id: row.try_get("transaction_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<StoredEventRow> for StoredEvent {
    type Error = EventStoreError;

    fn try_from(row: StoredEventRow) -> Result<Self, Self::Error> {
        Ok(StoredEvent {
            event_id: EventId::from_uuid(row.event_id),
            stream_name: row.stream_id,
            stream_position: row.stream_position as u64,
            partition: PartitionKey::parse(&row.partition)?,
            age_bucket: AgeBucket::from_archived_flag(row.is_archived),
            event_type: row.event_type,
            schema_version: row.event_schema_version as u32,
            payload: row.event_data,
            metadata: row.event_metadata,
            global_position: GlobalPosition::new(row.global_position as u64),
            transaction_id: row.transaction_id as u64,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn read_stream(
        &self,
        stream_name: &str,
        options: ReadStreamOptions,
    ) -> Result<ReadStreamResult, EventStoreError> {
        self.load_stream(stream_name, options).await
    }

    async fn append_to_stream(
        &self,
        stream_name: &str,
        events: Vec<UncommittedEvent>,
        options: AppendToStreamOptions,
    ) -> Result<AppendResult, EventStoreError> {
        self.append_events(stream_name, events, options).await
    }

    async fn read_all(&self, options: ReadAllOptions) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.read_all_events(options).await
    }
}
