//! `strata-core`: storage-agnostic building blocks of the event log.
//!
//! This crate contains **pure** primitives (no IO, no async): names, partition
//! keys, stream versions and the concurrency contract between readers and writers.

pub mod error;
pub mod id;
pub mod partition;
pub mod position;
pub mod version;

pub use error::DomainError;
pub use id::{EventId, MAX_NAME_LEN, ModuleName, TenantName};
pub use partition::{AgeBucket, DEFAULT_PARTITION_TABLE, EVENTS_TABLE, PartitionKey, StreamScope};
pub use position::{GlobalPosition, LogPosition};
pub use version::{ConcurrencyConflict, ExpectedStreamVersion, StreamVersion};
