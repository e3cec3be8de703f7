use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use strata_core::{
    AgeBucket, ConcurrencyConflict, DomainError, EventId, ExpectedStreamVersion, GlobalPosition,
    LogPosition, PartitionKey, StreamScope, StreamVersion,
};
use strata_events::{Event, EventEnvelope};
use std::sync::Arc;

/// An event ready to be appended to a stream (not yet assigned a position).
///
/// Payload and metadata are opaque bytes to the store. The store assigns the
/// stream position, the global position and the commit timestamp during append.
///
/// Use `UncommittedEvent::from_typed()` to build one from a typed domain event:
/// the payload is the serde_json encoding and the type tag / schema version come
/// from the `Event` trait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub schema_version: u32,
    pub payload: Vec<u8>,
    pub metadata: Vec<u8>,
}

/// A stored event in an append-only stream.
///
/// ## Positions
///
/// - `stream_position` is 1-based, gap-free and strictly increasing per stream.
/// - `global_position` is drawn from one source shared by all streams and
///   partitions while the append is in flight.
/// - `transaction_id` identifies the append that wrote the event. Together with
///   `global_position` it forms the `LogPosition` consumers checkpoint on.
///
/// Stored events are write-once. The only thing that may change is `age_bucket`,
/// when archival moves the row from the active to the archived sub-partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub stream_name: String,
    pub stream_position: u64,
    pub partition: PartitionKey,
    pub age_bucket: AgeBucket,

    pub event_type: String,
    pub schema_version: u32,
    pub payload: Vec<u8>,
    pub metadata: Vec<u8>,

    pub global_position: GlobalPosition,
    pub transaction_id: u64,
    pub created_at: DateTime<Utc>,
}

impl StoredEvent {
    pub fn stream_version(&self) -> StreamVersion {
        self.stream_position
    }

    pub fn log_position(&self) -> LogPosition {
        LogPosition::new(self.transaction_id, self.global_position)
    }

    /// Decode the payload into a typed envelope.
    pub fn decode<E>(&self) -> Result<EventEnvelope<E>, EventStoreError>
    where
        E: DeserializeOwned,
    {
        let payload: E = serde_json::from_slice(&self.payload).map_err(|e| {
            EventStoreError::Serialization(format!(
                "failed to decode '{}' at {}@{}: {e}",
                self.event_type, self.stream_name, self.stream_position
            ))
        })?;

        Ok(EventEnvelope::new(
            self.event_id,
            self.stream_name.clone(),
            self.stream_position,
            self.partition.clone(),
            self.global_position,
            self.event_type.clone(),
            self.schema_version,
            self.metadata.clone(),
            self.created_at,
            payload,
        ))
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** as opposed to domain errors. The split
/// callers care about:
///
/// - `Concurrency`: the expected-version precondition failed; reload, decide
///   again, then retry.
/// - `Unavailable`: transient connection/transaction failure; the same request
///   may be retried as-is.
/// - everything else: permanent for this request.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyConflict),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error(transparent)]
    InvalidName(#[from] DomainError),

    #[error("event serialization failed: {0}")]
    Serialization(String),
}

impl EventStoreError {
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, EventStoreError::Concurrency(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EventStoreError::Unavailable(_))
    }
}

/// Options for `EventStore::read_stream`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadStreamOptions {
    pub scope: StreamScope,
    /// Checked before any event is returned.
    pub expected_version: ExpectedStreamVersion,
    /// First stream position to return (inclusive, 1-based).
    pub from: Option<u64>,
    pub max_count: Option<u64>,
}

impl ReadStreamOptions {
    pub fn in_scope(scope: StreamScope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    pub fn expecting(mut self, expected_version: ExpectedStreamVersion) -> Self {
        self.expected_version = expected_version;
        self
    }

    pub fn from_position(mut self, from: u64) -> Self {
        self.from = Some(from);
        self
    }

    pub fn max_count(mut self, max_count: u64) -> Self {
        self.max_count = Some(max_count);
        self
    }

    pub(crate) fn includes(&self, position: u64) -> bool {
        self.from.is_none_or(|from| position >= from)
    }
}

/// Result of `EventStore::read_stream`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadStreamResult {
    /// Version of the whole stream in the read snapshot, even for partial reads.
    pub current_stream_version: Option<StreamVersion>,
    pub events: Vec<StoredEvent>,
}

impl ReadStreamResult {
    pub fn stream_exists(&self) -> bool {
        self.current_stream_version.is_some()
    }
}

/// Options for `EventStore::append_to_stream`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendToStreamOptions {
    pub scope: StreamScope,
    pub expected_version: ExpectedStreamVersion,
}

impl AppendToStreamOptions {
    pub fn expecting(expected_version: ExpectedStreamVersion) -> Self {
        Self {
            expected_version,
            ..Self::default()
        }
    }

    pub fn in_scope(mut self, scope: StreamScope) -> Self {
        self.scope = scope;
        self
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResult {
    pub next_expected_stream_version: StreamVersion,
    pub last_global_position: GlobalPosition,
    pub created_new_stream: bool,
}

/// Default page size for `EventStore::read_all`.
pub const DEFAULT_READ_ALL_BATCH: u64 = 1000;

/// Options for `EventStore::read_all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadAllOptions {
    /// Return events strictly after this position (a consumer's checkpoint).
    pub after: Option<LogPosition>,
    pub max_count: u64,
}

impl Default for ReadAllOptions {
    fn default() -> Self {
        Self {
            after: None,
            max_count: DEFAULT_READ_ALL_BATCH,
        }
    }
}

impl ReadAllOptions {
    pub fn after(after: Option<LogPosition>) -> Self {
        Self {
            after,
            ..Self::default()
        }
    }

    pub(crate) fn includes(&self, position: LogPosition) -> bool {
        self.after.is_none_or(|after| position > after)
    }
}

/// Append-only, partitioned event store.
///
/// Streams are addressed by name inside a `StreamScope` (module + tenant); the
/// scope also decides the physical partition every event is routed to.
///
/// ## Append Semantics
///
/// `append_to_stream()`:
/// - Reads the current stream version and evaluates the expected version
/// - Assigns positions `current + 1 ..` and commit-time global positions
/// - Persists the whole batch atomically (all or nothing)
/// - Creates the target partition lazily when it does not exist yet
///
/// Two concurrent appends expecting the same version never both succeed.
///
/// ## Read Semantics
///
/// `read_stream()`:
/// - Returns events in stream position order from one consistent snapshot
/// - Returns no events and `current_stream_version = None` for a stream that
///   was never appended to (not an error)
///
/// `read_all()`:
/// - Returns events of every stream ordered by `LogPosition`, strictly after
///   the supplied checkpoint
/// - Never returns an event while an append that could still commit below it
///   is in flight, so resuming from the last returned position skips nothing
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn read_stream(
        &self,
        stream_name: &str,
        options: ReadStreamOptions,
    ) -> Result<ReadStreamResult, EventStoreError>;

    async fn append_to_stream(
        &self,
        stream_name: &str,
        events: Vec<UncommittedEvent>,
        options: AppendToStreamOptions,
    ) -> Result<AppendResult, EventStoreError>;

    async fn read_all(&self, options: ReadAllOptions) -> Result<Vec<StoredEvent>, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn read_stream(
        &self,
        stream_name: &str,
        options: ReadStreamOptions,
    ) -> Result<ReadStreamResult, EventStoreError> {
        (**self).read_stream(stream_name, options).await
    }

    async fn append_to_stream(
        &self,
        stream_name: &str,
        events: Vec<UncommittedEvent>,
        options: AppendToStreamOptions,
    ) -> Result<AppendResult, EventStoreError> {
        (**self).append_to_stream(stream_name, events, options).await
    }

    async fn read_all(&self, options: ReadAllOptions) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).read_all(options).await
    }
}

impl UncommittedEvent {
    /// Build an uncommitted event from a typed domain event.
    ///
    /// Keeps the store decoupled from domain types while still capturing the
    /// type tag and schema version needed to decode it later.
    pub fn from_typed<E>(event: &E, metadata: Vec<u8>) -> Result<Self, EventStoreError>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_vec(event).map_err(|e| {
            EventStoreError::Serialization(format!(
                "failed to encode '{}': {e}",
                event.event_type()
            ))
        })?;

        Ok(Self {
            event_id: EventId::new(),
            event_type: event.event_type().to_string(),
            schema_version: event.schema_version(),
            payload,
            metadata,
        })
    }
}

/// Reject empty stream names before touching storage.
pub(crate) fn validate_stream_name(stream_name: &str) -> Result<(), EventStoreError> {
    if stream_name.is_empty() {
        return Err(EventStoreError::InvalidName(DomainError::invalid_name(
            "stream name is empty",
        )));
    }
    Ok(())
}
