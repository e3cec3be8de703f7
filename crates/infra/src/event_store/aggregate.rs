//! Stream aggregation: fold a stream's history into caller-defined state.

use serde::de::DeserializeOwned;

use strata_core::StreamVersion;

use super::r#trait::{EventStore, EventStoreError, ReadStreamOptions, StoredEvent};

/// Folded state plus the stream version it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateStreamResult<S> {
    pub state: S,
    /// `None` when the stream does not exist; `state` is then the initial state.
    pub current_stream_version: Option<StreamVersion>,
}

/// Read the whole stream and fold it with `evolve`, starting from `initial_state()`.
///
/// `options.from` / `options.max_count` are ignored: state is always rebuilt
/// from position 1. The expected-version check in `options` runs before any
/// event is applied.
pub async fn aggregate_stream<St, S, E, Ev, I>(
    store: &St,
    stream_name: &str,
    evolve: Ev,
    initial_state: I,
    options: ReadStreamOptions,
) -> Result<AggregateStreamResult<S>, EventStoreError>
where
    St: EventStore + ?Sized,
    E: DeserializeOwned,
    Ev: Fn(S, &E) -> S,
    I: FnOnce() -> S,
{
    let read = store
        .read_stream(
            stream_name,
            ReadStreamOptions {
                from: None,
                max_count: None,
                ..options
            },
        )
        .await?;
    validate_history(&read.events)?;

    let mut state = initial_state();
    for stored in &read.events {
        let envelope = stored.decode::<E>()?;
        state = evolve(state, envelope.payload());
    }

    Ok(AggregateStreamResult {
        state,
        current_stream_version: read.current_stream_version,
    })
}

/// A backend must hand back positions `1..=n` in order; anything else would
/// fold a different state than the one the writer decided on.
fn validate_history(history: &[StoredEvent]) -> Result<(), EventStoreError> {
    for (idx, e) in history.iter().enumerate() {
        let expected = idx as u64 + 1;
        if e.stream_position != expected {
            return Err(EventStoreError::Storage(format!(
                "stream '{}' is not contiguous: expected position {expected}, found {}",
                e.stream_name, e.stream_position
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    use strata_core::ExpectedStreamVersion;
    use strata_events::Event;

    use crate::event_store::{AppendToStreamOptions, InMemoryEventStore, UncommittedEvent};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum CounterEvent {
        Added(i64),
        Reset,
    }

    impl Event for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                CounterEvent::Added(_) => "counter.added",
                CounterEvent::Reset => "counter.reset",
            }
        }
    }

    fn evolve(total: i64, event: &CounterEvent) -> i64 {
        match event {
            CounterEvent::Added(n) => total + n,
            CounterEvent::Reset => 0,
        }
    }

    async fn append(store: &InMemoryEventStore, events: &[CounterEvent]) {
        let batch = events
            .iter()
            .map(|e| UncommittedEvent::from_typed(e, Vec::new()).unwrap())
            .collect();
        store
            .append_to_stream("counter-1", batch, AppendToStreamOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn absent_stream_yields_initial_state() {
        let store = InMemoryEventStore::new();
        let result = aggregate_stream(&store, "counter-1", evolve, || 42, ReadStreamOptions::default())
            .await
            .unwrap();
        assert_eq!(result.state, 42);
        assert_eq!(result.current_stream_version, None);
    }

    #[tokio::test]
    async fn folds_history_in_order() {
        let store = InMemoryEventStore::new();
        append(&store, &[CounterEvent::Added(5), CounterEvent::Reset]).await;
        append(&store, &[CounterEvent::Added(3)]).await;

        let result = aggregate_stream(&store, "counter-1", evolve, || 0, ReadStreamOptions::default())
            .await
            .unwrap();
        assert_eq!(result.state, 3);
        assert_eq!(result.current_stream_version, Some(3));
    }

    #[tokio::test]
    async fn partial_read_options_do_not_truncate_the_fold() {
        let store = InMemoryEventStore::new();
        append(&store, &[CounterEvent::Added(1), CounterEvent::Added(2), CounterEvent::Added(4)]).await;

        let options = ReadStreamOptions::default().from_position(3).max_count(1);
        let result = aggregate_stream(&store, "counter-1", evolve, || 0, options)
            .await
            .unwrap();
        assert_eq!(result.state, 7);
    }

    #[tokio::test]
    async fn expected_version_mismatch_fails_before_folding() {
        let store = InMemoryEventStore::new();
        append(&store, &[CounterEvent::Added(1)]).await;

        let options = ReadStreamOptions::default().expecting(ExpectedStreamVersion::StreamDoesNotExist);
        let err = aggregate_stream(
            &store,
            "counter-1",
            |_: i64, _: &CounterEvent| -> i64 { panic!("must not fold") },
            || 0,
            options,
        )
        .await
        .unwrap_err();
        assert!(err.is_concurrency_conflict());
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_serialization_error() {
        let store = InMemoryEventStore::new();
        let garbage = UncommittedEvent {
            event_id: strata_core::EventId::new(),
            event_type: "counter.added".to_string(),
            schema_version: 1,
            payload: b"not json".to_vec(),
            metadata: Vec::new(),
        };
        store
            .append_to_stream("counter-1", vec![garbage], AppendToStreamOptions::default())
            .await
            .unwrap();

        let err = aggregate_stream(&store, "counter-1", evolve, || 0, ReadStreamOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Serialization(_)));
    }

    #[test]
    fn gaps_in_history_are_rejected() {
        let mut events = Vec::new();
        for position in [1, 3] {
            events.push(StoredEvent {
                event_id: strata_core::EventId::new(),
                stream_name: "counter-1".to_string(),
                stream_position: position,
                partition: Default::default(),
                age_bucket: Default::default(),
                event_type: "counter.reset".to_string(),
                schema_version: 1,
                payload: Vec::new(),
                metadata: Vec::new(),
                global_position: strata_core::GlobalPosition::new(position),
                transaction_id: position,
                created_at: chrono::Utc::now(),
            });
        }
        assert!(matches!(validate_history(&events), Err(EventStoreError::Storage(_))));
    }
}
