//! PostgreSQL partition manager.
//!
//! Each `(module, tenant)` pair gets a list partition of `strata_events`, itself
//! list-partitioned by `is_archived`:
//!
//! ```text
//! strata_events
//! └── strata_events_{module}__{tenant}          FOR VALUES IN ('{module}__{tenant}')
//!     ├── strata_events_{module}__{tenant}_active    FOR VALUES IN (FALSE)
//!     └── strata_events_{module}__{tenant}_archived  FOR VALUES IN (TRUE)
//! ```
//!
//! Creation is serialized per key with a transaction-scoped advisory lock, and
//! every DDL statement is `IF NOT EXISTS`, so concurrent ensures both succeed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{info, instrument};

use strata_core::{AgeBucket, EVENTS_TABLE, ModuleName, PartitionKey, TenantName};

use super::{Ensured, PartitionInfo, PartitionManager, TimePartitionReport, default_archive_after};
use crate::db::postgres::{DUPLICATE_TABLE, UNIQUE_VIOLATION, has_code, map_sqlx_error};
use crate::event_store::EventStoreError;

#[derive(Debug, Clone)]
pub struct PostgresPartitionManager {
    pool: PgPool,
    archive_after: chrono::Duration,
}

impl PostgresPartitionManager {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            archive_after: default_archive_after(),
        }
    }

    pub fn with_archive_after(mut self, archive_after: chrono::Duration) -> Self {
        self.archive_after = archive_after;
        self
    }

    async fn create_partition(&self, key: &PartitionKey) -> Result<Ensured, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key.as_str())
            .execute(&mut *tx)
            .await?;

        let registered = sqlx::query(
            r#"
            INSERT INTO strata_partitions (partition, module, tenant)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(key.module().as_str())
        .bind(key.tenant().as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Registry rows and tables are created in one transaction, so a
        // registered key already has its tables.
        if registered == 0 {
            tx.commit().await?;
            return Ok(Ensured::Existing);
        }

        create_partition_tables(&mut tx, key).await?;
        tx.commit().await?;
        Ok(Ensured::Created)
    }
}

/// Create the key's partition and both age buckets, if missing.
///
/// Names are validated (`[a-z0-9_]`) before they reach a `PartitionKey`, so
/// interpolating them into DDL is safe.
async fn create_partition_tables(
    tx: &mut Transaction<'_, Postgres>,
    key: &PartitionKey,
) -> Result<(), sqlx::Error> {
    let table = key.table_name();
    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS {table} PARTITION OF {EVENTS_TABLE} \
             FOR VALUES IN ('{key}') PARTITION BY LIST (is_archived)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF {table} FOR VALUES IN (FALSE)",
            key.bucket_table_name(AgeBucket::Active)
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF {table} FOR VALUES IN (TRUE)",
            key.bucket_table_name(AgeBucket::Archived)
        ),
    ];

    for statement in &statements {
        sqlx::query(statement).execute(&mut **tx).await?;
    }
    Ok(())
}

#[async_trait]
impl PartitionManager for PostgresPartitionManager {
    #[instrument(skip(self, module, tenant), fields(module = %module, tenant = %tenant), err)]
    async fn ensure_tenant(
        &self,
        module: &ModuleName,
        tenant: &TenantName,
    ) -> Result<Ensured, EventStoreError> {
        let key = PartitionKey::new(module.clone(), tenant.clone());
        match self.create_partition(&key).await {
            Ok(Ensured::Created) => {
                info!(partition = %key, "created partition");
                Ok(Ensured::Created)
            }
            Ok(Ensured::Existing) => Ok(Ensured::Existing),
            // Lost a race with a writer that does not take the advisory lock;
            // the partition exists either way.
            Err(e) if has_code(&e, DUPLICATE_TABLE) || has_code(&e, UNIQUE_VIOLATION) => {
                Ok(Ensured::Existing)
            }
            Err(e) => Err(map_sqlx_error("ensure_partition", e)),
        }
    }

    #[instrument(skip(self), err)]
    async fn archive_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<TimePartitionReport, EventStoreError> {
        let partitions = self.list_partitions().await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for partition in &partitions {
            create_partition_tables(&mut tx, &partition.key)
                .await
                .map_err(|e| map_sqlx_error("create_partition", e))?;
        }

        // Flipping the flag moves the row into the archived sub-partition.
        let events_archived = sqlx::query(
            r#"
            UPDATE strata_events
            SET is_archived = TRUE
            WHERE is_archived = FALSE AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("archive_events", e))?
        .rows_affected();

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let report = TimePartitionReport {
            partitions_checked: partitions.len(),
            events_archived,
            cutoff,
        };
        info!(
            partitions_checked = report.partitions_checked,
            events_archived = report.events_archived,
            "time partitions refreshed"
        );
        Ok(report)
    }

    #[instrument(skip(self), err)]
    async fn list_partitions(&self) -> Result<Vec<PartitionInfo>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT partition, created_at
            FROM strata_partitions
            ORDER BY partition ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_partitions", e))?;

        rows.iter()
            .map(|row| {
                let key: String = row
                    .try_get("partition")
                    .map_err(|e| map_sqlx_error("list_partitions", e))?;
                Ok(PartitionInfo {
                    key: PartitionKey::parse(&key)?,
                    created_at: row
                        .try_get("created_at")
                        .map_err(|e| map_sqlx_error("list_partitions", e))?,
                })
            })
            .collect()
    }

    fn archive_after(&self) -> chrono::Duration {
        self.archive_after
    }
}
