//! Consumer checkpoints: the last log position a named consumer processed.
//!
//! Checkpoints only move forward. Advancing to a position at or below the
//! stored one is a no-op, so replays and late duplicate acknowledgements can
//! never rewind a consumer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use strata_core::{DomainError, LogPosition};

use crate::event_store::EventStoreError;

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryCheckpointStore;
pub use postgres::PostgresCheckpointStore;

/// Outcome of `CheckpointStore::advance_checkpoint`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CheckpointAdvance {
    /// Stored position moved up to the requested one.
    Advanced { previous: Option<LogPosition> },
    /// Requested position was not ahead of the stored one; nothing changed.
    Unchanged { current: LogPosition },
}

impl CheckpointAdvance {
    pub fn was_advanced(self) -> bool {
        matches!(self, CheckpointAdvance::Advanced { .. })
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `None` when the consumer has never stored a checkpoint.
    async fn get_checkpoint(
        &self,
        consumer: &str,
    ) -> Result<Option<LogPosition>, EventStoreError>;

    /// Atomically raise the stored checkpoint to `position` if it is ahead.
    async fn advance_checkpoint(
        &self,
        consumer: &str,
        position: LogPosition,
    ) -> Result<CheckpointAdvance, EventStoreError>;
}

pub(crate) fn validate_consumer_name(consumer: &str) -> Result<(), EventStoreError> {
    if consumer.trim().is_empty() {
        return Err(EventStoreError::InvalidName(DomainError::invalid_name(
            "consumer name is empty",
        )));
    }
    Ok(())
}
