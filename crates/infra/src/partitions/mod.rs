//! Partition management: registry of `(module, tenant)` pairs and their physical
//! `active` / `archived` sub-partitions.
//!
//! Every ensure operation is idempotent and safe under concurrency: when two
//! callers race to create the same partition, both succeed and exactly one of
//! them observes `Ensured::Created`.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_core::{ModuleName, PartitionKey, TenantName};

use crate::event_store::EventStoreError;

pub mod in_memory;
pub mod maintenance;
pub mod postgres;

pub use in_memory::InMemoryPartitionManager;
pub use maintenance::spawn_maintenance;
pub use postgres::PostgresPartitionManager;

/// Outcome of an ensure call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ensured {
    Created,
    Existing,
}

impl Ensured {
    pub fn was_created(self) -> bool {
        matches!(self, Ensured::Created)
    }
}

/// One ensured partition of a fan-out call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsuredPartition {
    pub key: PartitionKey,
    pub outcome: Ensured,
}

/// A row of the partition registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub key: PartitionKey,
    pub created_at: DateTime<Utc>,
}

impl PartitionInfo {
    pub fn module(&self) -> &ModuleName {
        self.key.module()
    }

    pub fn tenant(&self) -> &TenantName {
        self.key.tenant()
    }
}

/// Result of a time-partition maintenance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePartitionReport {
    pub partitions_checked: usize,
    pub events_archived: u64,
    /// Events created strictly before this instant were archived.
    pub cutoff: DateTime<Utc>,
}

/// Default age after which events move to the archived bucket.
pub fn default_archive_after() -> chrono::Duration {
    chrono::Duration::days(30)
}

#[async_trait]
pub trait PartitionManager: Send + Sync {
    /// Ensure the partition for `(module, tenant)` and its age buckets exist.
    async fn ensure_tenant(
        &self,
        module: &ModuleName,
        tenant: &TenantName,
    ) -> Result<Ensured, EventStoreError>;

    /// Move events created before `cutoff` from active to archived, after
    /// re-ensuring the age buckets of every registered partition.
    async fn archive_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<TimePartitionReport, EventStoreError>;

    /// Snapshot of the registry, ordered by partition key.
    async fn list_partitions(&self) -> Result<Vec<PartitionInfo>, EventStoreError>;

    /// Age after which `ensure_time_partitions()` archives events.
    fn archive_after(&self) -> chrono::Duration;

    /// Ensure the module's shared (`global` tenant) partition.
    async fn ensure_module(&self, module: &ModuleName) -> Result<Ensured, EventStoreError> {
        self.ensure_tenant(module, &TenantName::global()).await
    }

    /// Ensure `(module, t)` for every tenant `t` known at call time.
    async fn ensure_module_for_all_tenants(
        &self,
        module: &ModuleName,
    ) -> Result<Vec<EnsuredPartition>, EventStoreError> {
        let tenants: BTreeSet<TenantName> = self
            .list_partitions()
            .await?
            .into_iter()
            .map(|p| p.tenant().clone())
            .collect();

        let mut ensured = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            let outcome = self.ensure_tenant(module, &tenant).await?;
            ensured.push(EnsuredPartition {
                key: PartitionKey::new(module.clone(), tenant),
                outcome,
            });
        }
        Ok(ensured)
    }

    /// Ensure `(m, tenant)` for every module `m` known at call time.
    async fn ensure_tenant_for_all_modules(
        &self,
        tenant: &TenantName,
    ) -> Result<Vec<EnsuredPartition>, EventStoreError> {
        let modules: BTreeSet<ModuleName> = self
            .list_partitions()
            .await?
            .into_iter()
            .map(|p| p.module().clone())
            .collect();

        let mut ensured = Vec::with_capacity(modules.len());
        for module in modules {
            let outcome = self.ensure_tenant(&module, tenant).await?;
            ensured.push(EnsuredPartition {
                key: PartitionKey::new(module, tenant.clone()),
                outcome,
            });
        }
        Ok(ensured)
    }

    /// Periodic maintenance: archive everything older than `archive_after()`.
    async fn ensure_time_partitions(&self) -> Result<TimePartitionReport, EventStoreError> {
        let cutoff = Utc::now() - self.archive_after();
        self.archive_older_than(cutoff).await
    }
}

#[async_trait]
impl<M> PartitionManager for Arc<M>
where
    M: PartitionManager + ?Sized,
{
    async fn ensure_tenant(
        &self,
        module: &ModuleName,
        tenant: &TenantName,
    ) -> Result<Ensured, EventStoreError> {
        (**self).ensure_tenant(module, tenant).await
    }

    async fn archive_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<TimePartitionReport, EventStoreError> {
        (**self).archive_older_than(cutoff).await
    }

    async fn list_partitions(&self) -> Result<Vec<PartitionInfo>, EventStoreError> {
        (**self).list_partitions().await
    }

    fn archive_after(&self) -> chrono::Duration {
        (**self).archive_after()
    }
}

/// Partition keys this process has already ensured.
///
/// Lets the append path skip the registry round-trip once a partition is known
/// to exist. Entries are never evicted: partitions are never dropped.
#[derive(Debug, Default)]
pub(crate) struct PartitionCache {
    known: RwLock<HashSet<PartitionKey>>,
}

impl PartitionCache {
    pub(crate) fn contains(&self, key: &PartitionKey) -> bool {
        self.known.read().is_ok_and(|known| known.contains(key))
    }

    fn remember(&self, key: PartitionKey) {
        if let Ok(mut known) = self.known.write() {
            known.insert(key);
        }
    }

    /// Ensure the partition behind `key` exists, creating it on first use.
    pub(crate) async fn ensure<M>(&self, manager: &M, key: &PartitionKey) -> Result<(), EventStoreError>
    where
        M: PartitionManager + ?Sized,
    {
        if self.contains(key) {
            return Ok(());
        }
        manager.ensure_tenant(key.module(), key.tenant()).await?;
        self.remember(key.clone());
        Ok(())
    }
}
