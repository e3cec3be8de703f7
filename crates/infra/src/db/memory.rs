//! In-memory tables shared by the in-memory event store, partition manager and
//! checkpoint store.
//!
//! One lock guards every table, so a write is visible to readers entirely or
//! not at all. Intended for tests/dev. Not optimized for performance.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use strata_core::{GlobalPosition, LogPosition, PartitionKey, StreamVersion};

use crate::event_store::{EventStoreError, StoredEvent};

/// Streams are unique per partition (module + tenant), not globally.
pub(crate) type StreamKey = (PartitionKey, String);

#[derive(Debug)]
pub(crate) struct PartitionTables {
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) active: Vec<StoredEvent>,
    pub(crate) archived: Vec<StoredEvent>,
}

impl PartitionTables {
    pub(crate) fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            active: Vec::new(),
            archived: Vec::new(),
        }
    }

    pub(crate) fn events(&self) -> impl Iterator<Item = &StoredEvent> {
        self.active.iter().chain(self.archived.iter())
    }
}

#[derive(Debug)]
pub(crate) struct Tables {
    pub(crate) streams: HashMap<StreamKey, StreamVersion>,
    /// Partition registry and partition contents in one map.
    pub(crate) partitions: BTreeMap<PartitionKey, PartitionTables>,
    pub(crate) last_global_position: GlobalPosition,
    /// One id per committed append.
    pub(crate) last_transaction_id: u64,
    pub(crate) subscriptions: HashMap<String, LogPosition>,
}

impl Default for Tables {
    fn default() -> Self {
        let mut partitions = BTreeMap::new();
        partitions.insert(PartitionKey::default(), PartitionTables::new(Utc::now()));

        Self {
            streams: HashMap::new(),
            partitions,
            last_global_position: GlobalPosition::new(0),
            last_transaction_id: 0,
            subscriptions: HashMap::new(),
        }
    }
}

/// Handle to a set of in-memory tables. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, EventStoreError> {
        self.tables
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, EventStoreError> {
        self.tables
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))
    }
}
