//! PostgreSQL pool construction, schema bootstrap and sqlx error mapping.
//!
//! ## Schema
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `strata_streams` | one row per `(stream_id, partition)` holding the current stream position |
//! | `strata_events` | list-partitioned by partition key, each partition list-partitioned by `is_archived` |
//! | `strata_partitions` | registry of known `(module, tenant)` pairs |
//! | `strata_subscriptions` | consumer checkpoints as `(transaction_id, global_position)` |
//!
//! `migrate()` is idempotent and serialized through an advisory lock, so several
//! processes may run it on startup.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | `EventStoreError` |
//! |------------|-----------------|-------------------|
//! | Database | `40001`, `40P01`, class `08` | `Unavailable` |
//! | Database | any other | `Storage` |
//! | PoolTimedOut / PoolClosed / Io / Tls | n/a | `Unavailable` |
//! | anything else | n/a | `Storage` |
//!
//! Unique violations (`23505`) are mapped to `Concurrency` at the call sites
//! that know which stream they were appending to.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, instrument};

use strata_core::ModuleName;

use crate::config::StoreConfig;
use crate::event_store::EventStoreError;
use crate::partitions::{PartitionManager, PostgresPartitionManager};

pub(crate) const UNIQUE_VIOLATION: &str = "23505";
pub(crate) const DUPLICATE_TABLE: &str = "42P07";

/// Key of the advisory lock serializing schema bootstrap.
const MIGRATION_LOCK_KEY: &str = "strata_migrate";

const SCHEMA: &[&str] = &[
    r#"CREATE SEQUENCE IF NOT EXISTS strata_global_position"#,
    r#"
    CREATE TABLE IF NOT EXISTS strata_streams (
        stream_id        TEXT        NOT NULL,
        partition        TEXT        NOT NULL,
        module           TEXT        NOT NULL,
        tenant           TEXT        NOT NULL,
        stream_position  BIGINT      NOT NULL,
        created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (stream_id, partition)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS strata_events (
        stream_id             TEXT        NOT NULL,
        stream_position       BIGINT      NOT NULL,
        partition             TEXT        NOT NULL,
        is_archived           BOOLEAN     NOT NULL DEFAULT FALSE,
        event_id              UUID        NOT NULL,
        event_type            TEXT        NOT NULL,
        event_schema_version  INTEGER     NOT NULL,
        event_data            BYTEA       NOT NULL,
        event_metadata        BYTEA       NOT NULL,
        global_position       BIGINT      NOT NULL DEFAULT nextval('strata_global_position'),
        transaction_id        BIGINT      NOT NULL DEFAULT (pg_current_xact_id()::text::bigint),
        created_at            TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (stream_id, stream_position, partition, is_archived)
    ) PARTITION BY LIST (partition)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS strata_events_default
        PARTITION OF strata_events DEFAULT
        PARTITION BY LIST (is_archived)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS strata_events_default_active
        PARTITION OF strata_events_default FOR VALUES IN (FALSE)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS strata_events_default_archived
        PARTITION OF strata_events_default FOR VALUES IN (TRUE)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS strata_events_global_position_idx
        ON strata_events (global_position)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS strata_events_log_position_idx
        ON strata_events (transaction_id, global_position)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS strata_partitions (
        partition   TEXT        PRIMARY KEY,
        module      TEXT        NOT NULL,
        tenant      TEXT        NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (module, tenant)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS strata_subscriptions (
        subscription_id          TEXT        PRIMARY KEY,
        last_transaction_id      BIGINT      NOT NULL,
        last_global_position     BIGINT      NOT NULL,
        updated_at               TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

/// Build a connection pool from `config.database_url`.
pub async fn connect(config: &StoreConfig) -> Result<PgPool, EventStoreError> {
    let url = config
        .require_database_url()
        .map_err(|e| EventStoreError::Unavailable(e.to_string()))?;

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect(url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

/// Create every table the event log needs and the default `global__global`
/// partition. Safe to run repeatedly and concurrently.
#[instrument(skip(pool), err)]
pub async fn migrate(pool: &PgPool) -> Result<(), EventStoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| map_sqlx_error("begin_transaction", e))?;

    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("migration_lock", e))?;

    for statement in SCHEMA {
        sqlx::query(*statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
    }

    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))?;

    PostgresPartitionManager::new(pool.clone())
        .ensure_module(&ModuleName::global())
        .await?;

    info!("event log schema ready");
    Ok(())
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code() {
                Some(code) if is_transient_code(code.as_ref()) => EventStoreError::Unavailable(msg),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            EventStoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Io(e) => EventStoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => EventStoreError::Unavailable(format!("tls error in {operation}: {e}")),
        other => EventStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// Serialization failure, deadlock, or any connection exception (class 08).
fn is_transient_code(code: &str) -> bool {
    matches!(code, "40001" | "40P01") || code.starts_with("08")
}

/// Bind a `u64` count or position as `BIGINT`, saturating instead of wrapping.
pub(crate) fn to_bigint(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn has_code(err: &sqlx::Error, expected: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == expected),
        _ => false,
    }
}
