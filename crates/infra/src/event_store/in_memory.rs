use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use strata_core::{AgeBucket, ExpectedStreamVersion, GlobalPosition, PartitionKey};

use super::r#trait::{
    AppendResult, AppendToStreamOptions, EventStore, EventStoreError, ReadAllOptions,
    ReadStreamOptions, ReadStreamResult, StoredEvent, UncommittedEvent, validate_stream_name,
};
use crate::db::InMemoryDatabase;
use crate::partitions::{InMemoryPartitionManager, PartitionCache};

/// In-memory append-only event store.
///
/// Every append runs under the database write lock, so the version check,
/// position assignment and insert are one atomic step, and global positions
/// follow commit order.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Clone)]
pub struct InMemoryEventStore {
    db: InMemoryDatabase,
    partitions: InMemoryPartitionManager,
    cache: Arc<PartitionCache>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::with_database(InMemoryDatabase::new())
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store over existing tables (shared with a checkpoint store, say).
    pub fn with_database(db: InMemoryDatabase) -> Self {
        Self {
            partitions: InMemoryPartitionManager::new(db.clone()),
            db,
            cache: Arc::new(PartitionCache::default()),
        }
    }

    pub fn database(&self) -> &InMemoryDatabase {
        &self.db
    }

    /// Partition manager over the same tables as this store.
    pub fn partition_manager(&self) -> &InMemoryPartitionManager {
        &self.partitions
    }

    fn append_locked(
        &self,
        stream_name: &str,
        key: PartitionKey,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedStreamVersion,
    ) -> Result<AppendResult, EventStoreError> {
        let mut guard = self.db.write()?;
        let tables = &mut *guard;

        let stream_key = (key, stream_name.to_string());
        let current = tables.streams.get(&stream_key).copied();
        expected_version.check(stream_name, current)?;

        let partition = tables.partitions.get_mut(&stream_key.0).ok_or_else(|| {
            EventStoreError::Storage(format!("partition {} is not registered", stream_key.0))
        })?;

        let committed_at = Utc::now();
        let transaction_id = tables.last_transaction_id + 1;
        let mut position = current.unwrap_or(0);
        let mut global = tables.last_global_position;

        for e in events {
            position += 1;
            global = global.next();
            partition.active.push(StoredEvent {
                event_id: e.event_id,
                stream_name: stream_name.to_string(),
                stream_position: position,
                partition: stream_key.0.clone(),
                age_bucket: AgeBucket::Active,
                event_type: e.event_type,
                schema_version: e.schema_version,
                payload: e.payload,
                metadata: e.metadata,
                global_position: global,
                transaction_id,
                created_at: committed_at,
            });
        }

        tables.last_global_position = global;
        tables.last_transaction_id = transaction_id;
        tables.streams.insert(stream_key, position);

        Ok(AppendResult {
            next_expected_stream_version: position,
            last_global_position: global,
            created_new_stream: current.is_none(),
        })
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn read_stream(
        &self,
        stream_name: &str,
        options: ReadStreamOptions,
    ) -> Result<ReadStreamResult, EventStoreError> {
        validate_stream_name(stream_name)?;
        let key = options.scope.partition_key();

        let tables = self.db.read()?;
        let current = tables
            .streams
            .get(&(key.clone(), stream_name.to_string()))
            .copied();
        options.expected_version.check(stream_name, current)?;

        let mut events: Vec<StoredEvent> = tables
            .partitions
            .get(&key)
            .into_iter()
            .flat_map(|p| p.events())
            .filter(|e| e.stream_name == stream_name && options.includes(e.stream_position))
            .cloned()
            .collect();
        drop(tables);

        events.sort_by_key(|e| e.stream_position);
        if let Some(max_count) = options.max_count {
            events.truncate(usize::try_from(max_count).unwrap_or(usize::MAX));
        }

        debug!(stream = stream_name, partition = %key, count = events.len(), "read stream");
        Ok(ReadStreamResult {
            current_stream_version: current,
            events,
        })
    }

    async fn append_to_stream(
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

        let count = events.len();
        let result = self.append_locked(stream_name, key, events, options.expected_version)?;
        debug!(
            stream = stream_name,
            count,
            version = result.next_expected_stream_version,
            global_position = %result.last_global_position,
            "appended events"
        );
        Ok(result)
    }

    async fn read_all(&self, options: ReadAllOptions) -> Result<Vec<StoredEvent>, EventStoreError> {
        let tables = self.db.read()?;
        let mut events: Vec<StoredEvent> = tables
            .partitions
            .values()
            .flat_map(|p| p.events())
            .filter(|e| options.includes(e.log_position()))
            .cloned()
            .collect();
        drop(tables);

        events.sort_by_key(|e| e.log_position());
        events.truncate(usize::try_from(options.max_count).unwrap_or(usize::MAX));
        Ok(events)
    }
}
