//! Command handling for event-sourced streams.
//!
//! ```text
//! id ──map──▶ stream name
//!   ↓
//! 1. Aggregate the stream (expected version checked before folding)
//!   ↓
//! 2. Decide: pure `decide(&state)` returns zero or more new events
//!   ↓
//! 3. Append with an expected version, then fold the new events into state
//! ```
//!
//! The append expects, in order of preference: the caller's explicit version,
//! the version observed in step 1, or "stream does not exist". A writer that
//! slipped in between steps 1 and 3 therefore surfaces as
//! `CommandError::Concurrency`. Retrying is the caller's decision; nothing
//! here retries.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use strata_core::{
    ConcurrencyConflict, ExpectedStreamVersion, GlobalPosition, StreamScope, StreamVersion,
};
use strata_events::Event;

use crate::event_store::{
    AggregateStreamResult, AppendToStreamOptions, EventStore, EventStoreError, ReadStreamOptions,
    UncommittedEvent, aggregate_stream,
};

#[derive(Debug, Error)]
pub enum CommandError<E> {
    /// The decision function refused the command; its error is passed through as-is.
    #[error("command rejected: {0}")]
    Rejected(E),

    /// Expected-version mismatch on read or append. Reload and retry.
    #[error(transparent)]
    Concurrency(ConcurrencyConflict),

    #[error(transparent)]
    Store(EventStoreError),
}

impl<E> CommandError<E> {
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, CommandError::Concurrency(_))
    }

    pub fn rejection(&self) -> Option<&E> {
        match self {
            CommandError::Rejected(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_rejection(self) -> Option<E> {
        match self {
            CommandError::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<EventStoreError> for CommandError<E> {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(conflict) => CommandError::Concurrency(conflict),
            other => CommandError::Store(other),
        }
    }
}

/// Per-invocation options for `CommandHandler::handle`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleOptions {
    /// Checked on read and used for the append when set.
    pub expected_version: Option<ExpectedStreamVersion>,
    pub scope: StreamScope,
    /// Attached to every event the decision produces.
    pub metadata: Vec<u8>,
}

impl HandleOptions {
    pub fn in_scope(scope: StreamScope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    pub fn expecting(mut self, expected_version: ExpectedStreamVersion) -> Self {
        self.expected_version = Some(expected_version);
        self
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Outcome of a handled command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult<S, E> {
    /// Loaded state folded with `new_events`.
    pub new_state: S,
    pub new_events: Vec<E>,
    /// Version after the append, or the observed version when nothing was appended.
    pub next_expected_stream_version: Option<StreamVersion>,
    /// `None` when the decision produced no events.
    pub last_global_position: Option<GlobalPosition>,
    pub created_new_stream: bool,
}

type Evolve<S, E> = dyn Fn(S, &E) -> S + Send + Sync;

/// Reusable load / decide / append pipeline for one kind of stream.
///
/// Holds the stream's `evolve` and `initial_state` functions plus the mapping
/// from a business id to a stream name (identity by default). The decision
/// function is supplied per call.
pub struct CommandHandler<S, E> {
    evolve: Arc<Evolve<S, E>>,
    initial_state: Arc<dyn Fn() -> S + Send + Sync>,
    map_to_stream_id: Arc<dyn Fn(&str) -> String + Send + Sync>,
}

impl<S, E> Clone for CommandHandler<S, E> {
    fn clone(&self) -> Self {
        Self {
            evolve: Arc::clone(&self.evolve),
            initial_state: Arc::clone(&self.initial_state),
            map_to_stream_id: Arc::clone(&self.map_to_stream_id),
        }
    }
}

impl<S, E> core::fmt::Debug for CommandHandler<S, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandHandler").finish_non_exhaustive()
    }
}

impl<S, E> CommandHandler<S, E>
where
    E: Event + Serialize + DeserializeOwned,
{
    pub fn new(
        evolve: impl Fn(S, &E) -> S + Send + Sync + 'static,
        initial_state: impl Fn() -> S + Send + Sync + 'static,
    ) -> Self {
        Self {
            evolve: Arc::new(evolve),
            initial_state: Arc::new(initial_state),
            map_to_stream_id: Arc::new(|id: &str| id.to_string()),
        }
    }

    /// Map business ids to stream names (e.g. `"order-{id}"`).
    pub fn with_stream_id_mapper(
        mut self,
        map_to_stream_id: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.map_to_stream_id = Arc::new(map_to_stream_id);
        self
    }

    pub fn stream_name(&self, id: &str) -> String {
        (self.map_to_stream_id)(id)
    }

    /// Current state of the stream behind `id`, without deciding anything.
    pub async fn load<St>(
        &self,
        store: &St,
        id: &str,
        scope: StreamScope,
    ) -> Result<AggregateStreamResult<S>, EventStoreError>
    where
        St: EventStore + ?Sized,
    {
        aggregate_stream(
            store,
            &self.stream_name(id),
            self.evolve.as_ref(),
            self.initial_state.as_ref(),
            ReadStreamOptions::in_scope(scope),
        )
        .await
    }

    /// Load, decide and append once.
    pub async fn handle<St, D, I, Err>(
        &self,
        store: &St,
        id: &str,
        decide: D,
        options: HandleOptions,
    ) -> Result<CommandResult<S, E>, CommandError<Err>>
    where
        St: EventStore + ?Sized,
        D: FnOnce(&S) -> Result<I, Err>,
        I: IntoIterator<Item = E>,
    {
        let stream_name = self.stream_name(id);

        // 1) Aggregate; an explicit expectation fails fast here.
        let read = ReadStreamOptions::in_scope(options.scope.clone())
            .expecting(options.expected_version.unwrap_or_default());
        let AggregateStreamResult {
            state,
            current_stream_version,
        } = aggregate_stream(
            store,
            &stream_name,
            self.evolve.as_ref(),
            self.initial_state.as_ref(),
            read,
        )
        .await?;

        // 2) Decide
        let new_events: Vec<E> = decide(&state)
            .map_err(CommandError::Rejected)?
            .into_iter()
            .collect();

        if new_events.is_empty() {
            debug!(stream = %stream_name, "command produced no events");
            return Ok(CommandResult {
                new_state: state,
                new_events,
                next_expected_stream_version: current_stream_version,
                last_global_position: None,
                created_new_stream: false,
            });
        }

        // 3) Append with the strongest expectation available.
        let expected_version = options.expected_version.unwrap_or(match current_stream_version {
            Some(version) => ExpectedStreamVersion::Exact(version),
            None => ExpectedStreamVersion::StreamDoesNotExist,
        });

        let uncommitted = new_events
            .iter()
            .map(|e| UncommittedEvent::from_typed(e, options.metadata.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let appended = store
            .append_to_stream(
                &stream_name,
                uncommitted,
                AppendToStreamOptions {
                    scope: options.scope,
                    expected_version,
                },
            )
            .await?;

        let new_state = new_events
            .iter()
            .fold(state, |state, event| (self.evolve)(state, event));

        debug!(
            stream = %stream_name,
            count = new_events.len(),
            version = appended.next_expected_stream_version,
            "command handled"
        );

        Ok(CommandResult {
            new_state,
            new_events,
            next_expected_stream_version: Some(appended.next_expected_stream_version),
            last_global_position: Some(appended.last_global_position),
            created_new_stream: appended.created_new_stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    use crate::event_store::InMemoryEventStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum LightEvent {
        SwitchedOn,
        SwitchedOff,
    }

    impl Event for LightEvent {
        fn event_type(&self) -> &'static str {
            match self {
                LightEvent::SwitchedOn => "light.switched_on",
                LightEvent::SwitchedOff => "light.switched_off",
            }
        }
    }

    #[derive(Debug, PartialEq)]
    struct AlreadyOn;

    impl core::fmt::Display for AlreadyOn {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.write_str("light is already on")
        }
    }

    fn lights() -> CommandHandler<bool, LightEvent> {
        CommandHandler::new(
            |_, e: &LightEvent| matches!(e, LightEvent::SwitchedOn),
            || false,
        )
        .with_stream_id_mapper(|id| format!("light-{id}"))
    }

    fn switch_on(on: &bool) -> Result<Vec<LightEvent>, AlreadyOn> {
        if *on { Err(AlreadyOn) } else { Ok(vec![LightEvent::SwitchedOn]) }
    }

    #[tokio::test]
    async fn first_command_creates_the_stream() {
        let store = InMemoryEventStore::new();
        let result = lights()
            .handle(&store, "kitchen", switch_on, HandleOptions::default())
            .await
            .unwrap();

        assert!(result.new_state);
        assert!(result.created_new_stream);
        assert_eq!(result.next_expected_stream_version, Some(1));
        assert_eq!(result.new_events, vec![LightEvent::SwitchedOn]);

        let read = store
            .read_stream("light-kitchen", ReadStreamOptions::default())
            .await
            .unwrap();
        assert_eq!(read.current_stream_version, Some(1));
    }

    #[tokio::test]
    async fn rejection_is_passed_through_and_nothing_is_appended() {
        let store = InMemoryEventStore::new();
        let handler = lights();
        handler
            .handle(&store, "kitchen", switch_on, HandleOptions::default())
            .await
            .unwrap();

        let err = handler
            .handle(&store, "kitchen", switch_on, HandleOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.into_rejection(), Some(AlreadyOn));

        let loaded = handler.load(&store, "kitchen", StreamScope::default()).await.unwrap();
        assert_eq!(loaded.current_stream_version, Some(1));
    }

    #[tokio::test]
    async fn empty_decision_appends_nothing() {
        let store = InMemoryEventStore::new();
        let result = lights()
            .handle(
                &store,
                "kitchen",
                |_: &bool| Ok::<_, AlreadyOn>(Vec::<LightEvent>::new()),
                HandleOptions::default(),
            )
            .await
            .unwrap();

        assert!(!result.new_state);
        assert_eq!(result.next_expected_stream_version, None);
        assert_eq!(result.last_global_position, None);
        assert!(!result.created_new_stream);
        assert!(store.read_all(Default::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn explicit_expectation_fails_fast_on_read() {
        let store = InMemoryEventStore::new();
        let err = lights()
            .handle(
                &store,
                "kitchen",
                |_: &bool| -> Result<Vec<LightEvent>, AlreadyOn> { panic!("must not decide") },
                HandleOptions::default().expecting(ExpectedStreamVersion::Exact(3)),
            )
            .await
            .unwrap_err();
        assert!(err.is_concurrency_conflict());
    }

    #[tokio::test]
    async fn metadata_is_attached_to_every_new_event() {
        let store = InMemoryEventStore::new();
        lights()
            .handle(
                &store,
                "kitchen",
                |_: &bool| Ok::<_, AlreadyOn>(vec![LightEvent::SwitchedOn, LightEvent::SwitchedOff]),
                HandleOptions::default().with_metadata(b"{\"user\":\"ops\"}".to_vec()),
            )
            .await
            .unwrap();

        let read = store
            .read_stream("light-kitchen", ReadStreamOptions::default())
            .await
            .unwrap();
        assert_eq!(read.events.len(), 2);
        assert!(read.events.iter().all(|e| e.metadata == b"{\"user\":\"ops\"}"));
    }
}
