//! Postgres-backed checkpoint store over `strata_subscriptions`.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use strata_core::{GlobalPosition, LogPosition};

use super::{CheckpointAdvance, CheckpointStore, validate_consumer_name};
use crate::db::postgres::{map_sqlx_error, to_bigint};
use crate::event_store::EventStoreError;

#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self), err)]
    async fn get_checkpoint(
        &self,
        consumer: &str,
    ) -> Result<Option<LogPosition>, EventStoreError> {
        validate_consumer_name(consumer)?;

        let position: Option<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT last_transaction_id, last_global_position
            FROM strata_subscriptions
            WHERE subscription_id = $1
            "#,
        )
        .bind(consumer)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_checkpoint", e))?;

        Ok(position.map(log_position))
    }

    /// Insert-or-lock, then compare: the row lock makes concurrent advances
    /// for one consumer apply one at a time.
    #[instrument(skip(self, position), fields(position = %position), err)]
    async fn advance_checkpoint(
        &self,
        consumer: &str,
        position: LogPosition,
    ) -> Result<CheckpointAdvance, EventStoreError> {
        validate_consumer_name(consumer)?;
        let transaction_id = to_bigint(position.transaction_id);
        let global_position = to_bigint(position.global_position.value());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO strata_subscriptions
                (subscription_id, last_transaction_id, last_global_position)
            VALUES ($1, $2, $3)
            ON CONFLICT (subscription_id) DO NOTHING
            "#,
        )
        .bind(consumer)
        .bind(transaction_id)
        .bind(global_position)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_checkpoint", e))?
        .rows_affected();

        let outcome = if inserted == 1 {
            CheckpointAdvance::Advanced { previous: None }
        } else {
            let current: (i64, i64) = sqlx::query_as(
                r#"
                SELECT last_transaction_id, last_global_position
                FROM strata_subscriptions
                WHERE subscription_id = $1
                FOR UPDATE
                "#,
            )
            .bind(consumer)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_checkpoint", e))?;
            let current = log_position(current);

            if position > current {
                sqlx::query(
                    r#"
                    UPDATE strata_subscriptions
                    SET last_transaction_id = $2,
                        last_global_position = $3,
                        updated_at = now()
                    WHERE subscription_id = $1
                    "#,
                )
                .bind(consumer)
                .bind(transaction_id)
                .bind(global_position)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("advance_checkpoint", e))?;
                CheckpointAdvance::Advanced {
                    previous: Some(current),
                }
            } else {
                CheckpointAdvance::Unchanged { current }
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }
}

fn log_position((transaction_id, global_position): (i64, i64)) -> LogPosition {
    LogPosition::new(transaction_id as u64, GlobalPosition::new(global_position as u64))
}
