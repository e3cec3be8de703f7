//! Infrastructure layer: event store backends, partition management,
//! checkpoints, command handling and configuration.

pub mod checkpoints;
pub mod command_handler;
pub mod config;
pub mod db;
pub mod event_store;
pub mod partitions;


pub use checkpoints::{CheckpointAdvance, CheckpointStore, InMemoryCheckpointStore, PostgresCheckpointStore};
pub use command_handler::{CommandError, CommandHandler, CommandResult, HandleOptions};
pub use config::{ConfigError, StoreConfig};
pub use event_store::{
    AggregateStreamResult, AppendResult, AppendToStreamOptions, EventStore, EventStoreError,
    InMemoryEventStore, PostgresEventStore, ReadAllOptions, ReadStreamOptions, ReadStreamResult,
    StoredEvent, UncommittedEvent, aggregate_stream,
};
pub use partitions::{
    Ensured, EnsuredPartition, InMemoryPartitionManager, PartitionInfo, PartitionManager,
    PostgresPartitionManager, TimePartitionReport, spawn_maintenance,
};
