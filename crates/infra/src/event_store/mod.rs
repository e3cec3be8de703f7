//! Append-only, partitioned event store boundary.
//!
//! The `EventStore` trait is the append engine plus the stream reader;
//! `aggregate_stream` folds a stream into state on top of it. Both backends
//! route every stream to the partition of its `StreamScope`.

pub mod aggregate;
pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use aggregate::{AggregateStreamResult, aggregate_stream};
pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{
    AppendResult, AppendToStreamOptions, DEFAULT_READ_ALL_BATCH, EventStore, EventStoreError,
    ReadAllOptions, ReadStreamOptions, ReadStreamResult, StoredEvent, UncommittedEvent,
};
