use std::collections::btree_map::Entry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use strata_core::{AgeBucket, ModuleName, PartitionKey, TenantName};

use super::{Ensured, PartitionInfo, PartitionManager, TimePartitionReport, default_archive_after};
use crate::db::InMemoryDatabase;
use crate::db::memory::PartitionTables;
use crate::event_store::EventStoreError;

/// In-memory partition registry over an `InMemoryDatabase`.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Clone)]
pub struct InMemoryPartitionManager {
    db: InMemoryDatabase,
    archive_after: chrono::Duration,
}

impl Default for InMemoryPartitionManager {
    fn default() -> Self {
        Self::new(InMemoryDatabase::new())
    }
}

impl InMemoryPartitionManager {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self {
            db,
            archive_after: default_archive_after(),
        }
    }

    pub fn with_archive_after(mut self, archive_after: chrono::Duration) -> Self {
        self.archive_after = archive_after;
        self
    }
}

#[async_trait]
impl PartitionManager for InMemoryPartitionManager {
    async fn ensure_tenant(
        &self,
        module: &ModuleName,
        tenant: &TenantName,
    ) -> Result<Ensured, EventStoreError> {
        let key = PartitionKey::new(module.clone(), tenant.clone());
        let mut tables = self.db.write()?;

        match tables.partitions.entry(key) {
            Entry::Occupied(_) => Ok(Ensured::Existing),
            Entry::Vacant(slot) => {
                info!(partition = %slot.key(), "created partition");
                slot.insert(PartitionTables::new(Utc::now()));
                Ok(Ensured::Created)
            }
        }
    }

    async fn archive_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<TimePartitionReport, EventStoreError> {
        let mut tables = self.db.write()?;
        let mut events_archived = 0u64;

        for (key, partition) in tables.partitions.iter_mut() {
            let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut partition.active)
                .into_iter()
                .partition(|e| e.created_at < cutoff);
            partition.active = kept;

            if !expired.is_empty() {
                debug!(partition = %key, count = expired.len(), "archiving events");
            }
            events_archived += expired.len() as u64;
            partition.archived.extend(expired.into_iter().map(|mut e| {
                e.age_bucket = AgeBucket::Archived;
                e
            }));
        }

        let report = TimePartitionReport {
            partitions_checked: tables.partitions.len(),
            events_archived,
            cutoff,
        };
        info!(
            partitions_checked = report.partitions_checked,
            events_archived = report.events_archived,
            cutoff = %report.cutoff,
            "time partitions refreshed"
        );
        Ok(report)
    }

    async fn list_partitions(&self) -> Result<Vec<PartitionInfo>, EventStoreError> {
        let tables = self.db.read()?;
        Ok(tables
            .partitions
            .iter()
            .map(|(key, partition)| PartitionInfo {
                key: key.clone(),
                created_at: partition.created_at,
            })
            .collect())
    }

    fn archive_after(&self) -> chrono::Duration {
        self.archive_after
    }
}
