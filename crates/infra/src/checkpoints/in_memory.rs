use std::collections::hash_map::Entry;

use async_trait::async_trait;

use strata_core::LogPosition;

use super::{CheckpointAdvance, CheckpointStore, validate_consumer_name};
use crate::db::InMemoryDatabase;
use crate::event_store::EventStoreError;

/// In-memory checkpoint store.
///
/// Build it over the event store's `InMemoryDatabase` to share one set of tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    db: InMemoryDatabase,
}

impl InMemoryCheckpointStore {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_checkpoint(
        &self,
        consumer: &str,
    ) -> Result<Option<LogPosition>, EventStoreError> {
        validate_consumer_name(consumer)?;
        let tables = self.db.read()?;
        Ok(tables.subscriptions.get(consumer).copied())
    }

    async fn advance_checkpoint(
        &self,
        consumer: &str,
        position: LogPosition,
    ) -> Result<CheckpointAdvance, EventStoreError> {
        validate_consumer_name(consumer)?;
        let mut tables = self.db.write()?;

        match tables.subscriptions.entry(consumer.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(position);
                Ok(CheckpointAdvance::Advanced { previous: None })
            }
            Entry::Occupied(mut slot) => {
                let current = *slot.get();
                if position > current {
                    slot.insert(position);
                    Ok(CheckpointAdvance::Advanced {
                        previous: Some(current),
                    })
                } else {
                    Ok(CheckpointAdvance::Unchanged { current })
                }
            }
        }
    }
}
