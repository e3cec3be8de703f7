//! Strongly-typed identifiers and names used across the event log.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a stored event (globally unique).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(EventId, "EventId");

/// Name of the module dimension of the partition hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleName(String);

/// Name of the tenant dimension of the partition hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantName(String);

/// Longest accepted module/tenant name.
///
/// Keeps `strata_events_{module}__{tenant}_archived` within the 63-byte
/// PostgreSQL identifier limit.
pub const MAX_NAME_LEN: usize = 18;

/// Name shared by the default module and the default tenant.
pub const GLOBAL: &str = "global";

/// Names end up inside table identifiers, so only a conservative alphabet is
/// accepted: `[a-z][a-z0-9_]*`, no trailing `_` and no `__` (the key separator).
fn validate_name(kind: &str, value: &str) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::invalid_name(format!("{kind} name is empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(DomainError::invalid_name(format!(
            "{kind} name '{value}' is longer than {MAX_NAME_LEN} bytes"
        )));
    }
    if !value.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(DomainError::invalid_name(format!(
            "{kind} name '{value}' must start with a lowercase letter"
        )));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(DomainError::invalid_name(format!(
            "{kind} name '{value}' contains '{bad}'"
        )));
    }
    if value.ends_with('_') || value.contains("__") {
        return Err(DomainError::invalid_name(format!(
            "{kind} name '{value}' has a trailing or doubled underscore"
        )));
    }
    Ok(())
}

macro_rules! impl_name_newtype {
    ($t:ident, $kind:literal) => {
        impl $t {
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                validate_name($kind, &value)?;
                Ok(Self(value))
            }

            /// The default (`global`) name.
            pub fn global() -> Self {
                Self(GLOBAL.to_string())
            }

            pub fn is_global(&self) -> bool {
                self.0 == GLOBAL
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::global()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_name_newtype!(ModuleName, "module");
impl_name_newtype!(TenantName, "tenant");
