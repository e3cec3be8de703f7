//! Partition hierarchy: `module → tenant → {active, archived}`.
//!
//! Partition identifiers are derived deterministically from the `(module, tenant)`
//! pair, so readers and writers can compute the physical target without asking the
//! partition registry first.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{ModuleName, TenantName};

/// Parent table every partition hangs off.
pub const EVENTS_TABLE: &str = "strata_events";

/// Catch-all partition for rows whose key has no dedicated partition.
pub const DEFAULT_PARTITION_TABLE: &str = "strata_events_default";

/// Separator between module and tenant inside a partition key.
pub const KEY_SEPARATOR: &str = "__";

/// The module/tenant scope a stream lives in.
///
/// Stream names are unique within a scope, not globally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StreamScope {
    pub module: ModuleName,
    pub tenant: TenantName,
}

impl StreamScope {
    pub fn new(module: ModuleName, tenant: TenantName) -> Self {
        Self { module, tenant }
    }

    /// Scope of a module's shared (`global` tenant) partition.
    pub fn module(module: ModuleName) -> Self {
        Self {
            module,
            tenant: TenantName::global(),
        }
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.module.clone(), self.tenant.clone())
    }
}

/// Deterministic identifier of a `(module, tenant)` partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionKey {
    key: String,
    module: ModuleName,
    tenant: TenantName,
}

impl PartitionKey {
    pub fn new(module: ModuleName, tenant: TenantName) -> Self {
        Self {
            key: format!("{module}{KEY_SEPARATOR}{tenant}"),
            module,
            tenant,
        }
    }

    /// Parse a stored key (`"{module}__{tenant}"`).
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let (module, tenant) = value.split_once(KEY_SEPARATOR).ok_or_else(|| {
            DomainError::invalid_name(format!("partition key '{value}' has no separator"))
        })?;
        Ok(Self::new(ModuleName::new(module)?, TenantName::new(tenant)?))
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn module(&self) -> &ModuleName {
        &self.module
    }

    pub fn tenant(&self) -> &TenantName {
        &self.tenant
    }

    pub fn scope(&self) -> StreamScope {
        StreamScope::new(self.module.clone(), self.tenant.clone())
    }

    /// Physical table holding both age buckets of this partition.
    pub fn table_name(&self) -> String {
        format!("{EVENTS_TABLE}_{}", self.key)
    }

    /// Physical sub-partition for one age bucket.
    pub fn bucket_table_name(&self, bucket: AgeBucket) -> String {
        format!("{}_{}", self.table_name(), bucket.suffix())
    }
}

impl Default for PartitionKey {
    fn default() -> Self {
        StreamScope::default().partition_key()
    }
}

impl core::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.key)
    }
}

impl TryFrom<String> for PartitionKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PartitionKey> for String {
    fn from(value: PartitionKey) -> Self {
        value.key
    }
}

/// Age-based split below every `(module, tenant)` partition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeBucket {
    #[default]
    Active,
    Archived,
}

impl AgeBucket {
    pub fn suffix(self) -> &'static str {
        match self {
            AgeBucket::Active => "active",
            AgeBucket::Archived => "archived",
        }
    }

    pub fn is_archived(self) -> bool {
        matches!(self, AgeBucket::Archived)
    }

    pub fn from_archived_flag(archived: bool) -> Self {
        if archived {
            AgeBucket::Archived
        } else {
            AgeBucket::Active
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(module: &str, tenant: &str) -> PartitionKey {
        PartitionKey::new(ModuleName::new(module).unwrap(), TenantName::new(tenant).unwrap())
    }

    #[test]
    fn key_is_derived_from_module_and_tenant() {
        let key = key("orders", "acme");
        assert_eq!(key.as_str(), "orders__acme");
        assert_eq!(key.table_name(), "strata_events_orders__acme");
        assert_eq!(
            key.bucket_table_name(AgeBucket::Archived),
            "strata_events_orders__acme_archived"
        );
    }

    #[test]
    fn default_scope_maps_to_global_partition() {
        assert_eq!(PartitionKey::default().as_str(), "global__global");
        assert_eq!(StreamScope::default().partition_key(), PartitionKey::default());
    }

    #[test]
    fn parse_round_trips_through_the_separator() {
        let parsed = PartitionKey::parse("billing__tenant_1").unwrap();
        assert_eq!(parsed, key("billing", "tenant_1"));
        assert!(PartitionKey::parse("billing").is_err());
        assert!(PartitionKey::parse("Billing__x").is_err());
    }

    #[test]
    fn longest_names_fit_postgres_identifiers() {
        let longest = "a".repeat(crate::id::MAX_NAME_LEN);
        let key = key(&longest, &longest);
        assert!(key.bucket_table_name(AgeBucket::Archived).len() <= 63);
    }
}
