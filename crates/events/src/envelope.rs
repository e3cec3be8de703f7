use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_core::{EventId, GlobalPosition, PartitionKey};

/// A committed event together with its stream and ordering metadata.
///
/// This is what a stored event decodes into. `stream_position` orders events
/// inside one stream; `global_position` orders them across the whole log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    stream_name: String,
    stream_position: u64,
    partition: PartitionKey,
    global_position: GlobalPosition,
    event_type: String,
    schema_version: u32,
    metadata: Vec<u8>,
    created_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: EventId,
        stream_name: impl Into<String>,
        stream_position: u64,
        partition: PartitionKey,
        global_position: GlobalPosition,
        event_type: impl Into<String>,
        schema_version: u32,
        metadata: Vec<u8>,
        created_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            stream_name: stream_name.into(),
            stream_position,
            partition,
            global_position,
            event_type: event_type.into(),
            schema_version,
            metadata,
            created_at,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn stream_position(&self) -> u64 {
        self.stream_position
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn global_position(&self) -> GlobalPosition {
        self.global_position
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
