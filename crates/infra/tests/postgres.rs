//! Integration tests for the PostgreSQL backends.
//!
//! These tests require Docker and spin up a PostgreSQL 16 container using
//! testcontainers. Run them with `cargo test -p strata-infra -- --ignored`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

use std::collections::HashSet;
use std::time::Duration;

use strata_core::{
    AgeBucket, EventId, ExpectedStreamVersion, GlobalPosition, LogPosition, ModuleName,
    StreamScope, TenantName,
};
use strata_events::Event;
use strata_infra::checkpoints::{CheckpointStore, PostgresCheckpointStore};
use strata_infra::command_handler::{CommandHandler, HandleOptions};
use strata_infra::db;
use strata_infra::event_store::{
    AppendToStreamOptions, EventStore, PostgresEventStore, ReadAllOptions, ReadStreamOptions,
    UncommittedEvent,
};
use strata_infra::partitions::{Ensured, PartitionManager};

struct TestDb {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestDb {
    async fn new() -> Self {
        let container = Postgres::default().with_tag("16-alpine").start().await.unwrap();
        let host = container.get_host().await.unwrap();
        let port = container.get_host_port_ipv4(5432).await.unwrap();

        let connection_string = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let pool = PgPool::connect(&connection_string).await.unwrap();
        db::postgres::migrate(&pool).await.unwrap();

        Self {
            _container: container,
            pool,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum TicketEvent {
    Opened { title: String },
    Closed,
}

impl Event for TicketEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TicketEvent::Opened { .. } => "ticket.opened",
            TicketEvent::Closed => "ticket.closed",
        }
    }
}

fn opened() -> UncommittedEvent {
    UncommittedEvent::from_typed(
        &TicketEvent::Opened {
            title: "printer on fire".to_string(),
        },
        b"{\"source\":\"test\"}".to_vec(),
    )
    .unwrap()
}

fn closed() -> UncommittedEvent {
    UncommittedEvent::from_typed(&TicketEvent::Closed, Vec::new()).unwrap()
}

fn support_acme() -> StreamScope {
    StreamScope::new(ModuleName::new("support").unwrap(), TenantName::new("acme").unwrap())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn migrate_is_idempotent_and_creates_the_default_partition() {
    let db = TestDb::new().await;
    db::postgres::migrate(&db.pool).await.unwrap();

    let store = PostgresEventStore::new(db.pool.clone());
    let partitions = store.partition_manager().list_partitions().await.unwrap();
    let keys: Vec<&str> = partitions.iter().map(|p| p.key.as_str()).collect();
    assert_eq!(keys, vec!["global__global"]);

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT tablename::text FROM pg_tables WHERE tablename LIKE 'strata_events_global%' ORDER BY 1",
    )
    .fetch_all(&db.pool)
    .await
    .unwrap();
    assert_eq!(
        tables,
        vec![
            "strata_events_global__global",
            "strata_events_global__global_active",
            "strata_events_global__global_archived"
        ]
    );
}

#[tokio::test]
#[ignore = "requires docker"]
async fn append_and_read_round_trip() {
    let db = TestDb::new().await;
    let store = PostgresEventStore::new(db.pool.clone());

    let first = store
        .append_to_stream(
            "ticket-1",
            vec![opened()],
            AppendToStreamOptions::expecting(ExpectedStreamVersion::StreamDoesNotExist),
        )
        .await
        .unwrap();
    assert_eq!(first.next_expected_stream_version, 1);
    assert!(first.created_new_stream);

    let err = store
        .append_to_stream(
            "ticket-1",
            vec![opened()],
            AppendToStreamOptions::expecting(ExpectedStreamVersion::StreamDoesNotExist),
        )
        .await
        .unwrap_err();
    assert!(err.is_concurrency_conflict());

    let second = store
        .append_to_stream(
            "ticket-1",
            vec![closed()],
            AppendToStreamOptions::expecting(ExpectedStreamVersion::Exact(1)),
        )
        .await
        .unwrap();
    assert_eq!(second.next_expected_stream_version, 2);
    assert!(second.last_global_position > first.last_global_position);

    let read = store.read_stream("ticket-1", ReadStreamOptions::default()).await.unwrap();
    assert_eq!(read.current_stream_version, Some(2));
    assert_eq!(read.events.len(), 2);
    assert_eq!(read.events[0].metadata, b"{\"source\":\"test\"}");
    let decoded = read.events[1].decode::<TicketEvent>().unwrap();
    assert_eq!(decoded.payload(), &TicketEvent::Closed);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn absent_stream_is_not_an_error() {
    let db = TestDb::new().await;
    let store = PostgresEventStore::new(db.pool.clone());

    let read = store.read_stream("ticket-404", ReadStreamOptions::default()).await.unwrap();
    assert_eq!(read.current_stream_version, None);
    assert!(read.events.is_empty());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn concurrent_creates_succeed_exactly_once() {
    let db = TestDb::new().await;
    let store = PostgresEventStore::new(db.pool.clone());

    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .append_to_stream(
                    "ticket-1",
                    vec![opened()],
                    AppendToStreamOptions::expecting(ExpectedStreamVersion::StreamDoesNotExist),
                )
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(e) => assert!(e.is_concurrency_conflict(), "unexpected error: {e}"),
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn scoped_appends_create_partitions_lazily() {
    let db = TestDb::new().await;
    let store = PostgresEventStore::new(db.pool.clone());

    store
        .append_to_stream(
            "ticket-1",
            vec![opened()],
            AppendToStreamOptions::default().in_scope(support_acme()),
        )
        .await
        .unwrap();

    let read = store
        .read_stream("ticket-1", ReadStreamOptions::in_scope(support_acme()))
        .await
        .unwrap();
    assert_eq!(read.events[0].partition.as_str(), "support__acme");

    let in_partition: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM strata_events_support__acme_active")
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(in_partition, 1);

    let global = store.read_stream("ticket-1", ReadStreamOptions::default()).await.unwrap();
    assert!(!global.stream_exists());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn concurrent_partition_creation_is_race_tolerant() {
    let db = TestDb::new().await;
    let store = PostgresEventStore::new(db.pool.clone());
    let support = ModuleName::new("support").unwrap();
    let acme = TenantName::new("acme").unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = store.partition_manager().clone();
        let (support, acme) = (support.clone(), acme.clone());
        handles.push(tokio::spawn(async move {
            manager.ensure_tenant(&support, &acme).await
        }));
    }

    let mut created = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() == Ensured::Created {
            created += 1;
        }
    }
    assert_eq!(created, 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn archival_moves_rows_to_the_archived_bucket() {
    let db = TestDb::new().await;
    let store = PostgresEventStore::new(db.pool.clone());
    store
        .append_to_stream("ticket-1", vec![opened(), closed()], AppendToStreamOptions::default())
        .await
        .unwrap();

    let report = store
        .partition_manager()
        .archive_older_than(Utc::now() + chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(report.events_archived, 2);

    let read = store.read_stream("ticket-1", ReadStreamOptions::default()).await.unwrap();
    assert!(read.events.iter().all(|e| e.age_bucket == AgeBucket::Archived));

    // Appends after archival still continue the stream.
    let next = store
        .append_to_stream(
            "ticket-1",
            vec![opened()],
            AppendToStreamOptions::expecting(ExpectedStreamVersion::Exact(2)),
        )
        .await
        .unwrap();
    assert_eq!(next.next_expected_stream_version, 3);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn read_all_and_checkpoints() {
    let db = TestDb::new().await;
    let store = PostgresEventStore::new(db.pool.clone());
    let checkpoints = PostgresCheckpointStore::new(db.pool.clone());

    for stream in ["ticket-1", "ticket-2", "ticket-3"] {
        store
            .append_to_stream(stream, vec![opened()], AppendToStreamOptions::default())
            .await
            .unwrap();
    }

    let all = store.read_all(ReadAllOptions::default()).await.unwrap();
    assert_eq!(all.len(), 3);
    checkpoints
        .advance_checkpoint("mailer", all[0].log_position())
        .await
        .unwrap();

    let resume = checkpoints.get_checkpoint("mailer").await.unwrap();
    let rest = store.read_all(ReadAllOptions::after(resume)).await.unwrap();
    assert_eq!(rest.len(), 2);

    let stale = checkpoints
        .advance_checkpoint("mailer", LogPosition::new(0, GlobalPosition::new(0)))
        .await
        .unwrap();
    assert!(!stale.was_advanced());
    assert_eq!(
        checkpoints.get_checkpoint("mailer").await.unwrap(),
        Some(all[0].log_position())
    );
}

/// Writes one event into the default partition inside `tx` and returns its
/// sequence value, the way an append does after its version check.
async fn insert_in_open_transaction(
    tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
    stream: &str,
) -> i64 {
    sqlx::query_scalar(
        r#"
        INSERT INTO strata_events (stream_id, stream_position, partition, event_id,
            event_type, event_schema_version, event_data, event_metadata)
        VALUES ($1, 1, 'global__global', $2, 'ticket.opened', 1, $3, $4)
        RETURNING global_position
        "#,
    )
    .bind(stream)
    .bind(*EventId::new().as_uuid())
    .bind(b"{}".to_vec())
    .bind(Vec::<u8>::new())
    .fetch_one(&mut **tx)
    .await
    .unwrap()
}

async fn take_transaction_id(tx: &mut sqlx::Transaction<'static, sqlx::Postgres>) {
    sqlx::query("SELECT pg_current_xact_id()")
        .execute(&mut **tx)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires docker"]
async fn lower_sequence_value_committed_late_is_still_delivered() {
    let db = TestDb::new().await;
    let store = PostgresEventStore::new(db.pool.clone());
    let checkpoints = PostgresCheckpointStore::new(db.pool.clone());

    // `late` takes its transaction id after `early` but draws the lower
    // sequence value, then stays open while `early` commits.
    let mut early = db.pool.begin().await.unwrap();
    take_transaction_id(&mut early).await;
    let mut late = db.pool.begin().await.unwrap();
    take_transaction_id(&mut late).await;

    let late_position = insert_in_open_transaction(&mut late, "ticket-late").await;
    let early_position = insert_in_open_transaction(&mut early, "ticket-early").await;
    assert!(late_position < early_position);
    early.commit().await.unwrap();

    let page = store.read_all(ReadAllOptions::default()).await.unwrap();
    let streams: Vec<&str> = page.iter().map(|e| e.stream_name.as_str()).collect();
    assert_eq!(streams, vec!["ticket-early"]);
    checkpoints
        .advance_checkpoint("mailer", page[0].log_position())
        .await
        .unwrap();

    late.commit().await.unwrap();

    let resume = checkpoints.get_checkpoint("mailer").await.unwrap();
    let rest = store.read_all(ReadAllOptions::after(resume)).await.unwrap();
    let streams: Vec<&str> = rest.iter().map(|e| e.stream_name.as_str()).collect();
    assert_eq!(streams, vec!["ticket-late"]);
    assert_eq!(rest[0].global_position, GlobalPosition::new(late_position as u64));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn open_writer_holds_back_later_commits() {
    let db = TestDb::new().await;
    let store = PostgresEventStore::new(db.pool.clone());

    let mut open = db.pool.begin().await.unwrap();
    insert_in_open_transaction(&mut open, "ticket-open").await;

    store
        .append_to_stream("ticket-done", vec![opened()], AppendToStreamOptions::default())
        .await
        .unwrap();
    assert!(store.read_all(ReadAllOptions::default()).await.unwrap().is_empty());

    open.commit().await.unwrap();

    let all = store.read_all(ReadAllOptions::default()).await.unwrap();
    let streams: Vec<&str> = all.iter().map(|e| e.stream_name.as_str()).collect();
    assert_eq!(streams, vec!["ticket-open", "ticket-done"]);
    assert!(all.windows(2).all(|w| w[0].log_position() < w[1].log_position()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires docker"]
async fn consumer_polling_during_concurrent_appends_sees_every_event_once() {
    const WRITERS: usize = 8;
    const EVENTS_PER_WRITER: usize = 10;

    let db = TestDb::new().await;
    let store = PostgresEventStore::new(db.pool.clone());

    let mut writers = Vec::new();
    for writer in 0..WRITERS {
        let store = store.clone();
        writers.push(tokio::spawn(async move {
            for _ in 0..EVENTS_PER_WRITER {
                store
                    .append_to_stream(
                        &format!("ticket-{writer}"),
                        vec![opened()],
                        AppendToStreamOptions::default(),
                    )
                    .await
                    .unwrap();
            }
        }));
    }

    let consumer = async {
        let mut checkpoint = None;
        let mut seen = Vec::new();
        while seen.len() < WRITERS * EVENTS_PER_WRITER {
            let page = store
                .read_all(ReadAllOptions {
                    after: checkpoint,
                    max_count: 7,
                })
                .await
                .unwrap();
            if let Some(last) = page.last() {
                checkpoint = Some(last.log_position());
            }
            seen.extend(page.into_iter().map(|e| e.event_id));
            tokio::task::yield_now().await;
        }
        seen
    };
    let seen = tokio::time::timeout(Duration::from_secs(60), consumer)
        .await
        .expect("consumer missed events");

    for writer in writers {
        writer.await.unwrap();
    }
    let unique: HashSet<EventId> = seen.iter().copied().collect();
    assert_eq!(unique.len(), seen.len());
    assert_eq!(seen.len(), WRITERS * EVENTS_PER_WRITER);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn oversized_read_limits_return_everything() {
    let db = TestDb::new().await;
    let store = PostgresEventStore::new(db.pool.clone());
    store
        .append_to_stream("ticket-1", vec![opened(), closed()], AppendToStreamOptions::default())
        .await
        .unwrap();

    let read = store
        .read_stream("ticket-1", ReadStreamOptions::default().max_count(u64::MAX))
        .await
        .unwrap();
    assert_eq!(read.events.len(), 2);

    let beyond = store
        .read_stream("ticket-1", ReadStreamOptions::default().from_position(u64::MAX))
        .await
        .unwrap();
    assert!(beyond.events.is_empty());
    assert_eq!(beyond.current_stream_version, Some(2));

    let all = store
        .read_all(ReadAllOptions {
            after: None,
            max_count: u64::MAX,
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn command_handler_on_postgres() {
    let db = TestDb::new().await;
    let store = PostgresEventStore::new(db.pool.clone());
    let tickets: CommandHandler<bool, TicketEvent> =
        CommandHandler::new(|_, e: &TicketEvent| matches!(e, TicketEvent::Opened { .. }), || false);

    let opened = tickets
        .handle(
            &store,
            "ticket-1",
            |_: &bool| {
                Ok::<_, String>(vec![TicketEvent::Opened {
                    title: "printer on fire".to_string(),
                }])
            },
            HandleOptions::in_scope(support_acme()),
        )
        .await
        .unwrap();
    assert!(opened.new_state);
    assert_eq!(opened.next_expected_stream_version, Some(1));

    let closed = tickets
        .handle(
            &store,
            "ticket-1",
            |open: &bool| {
                if *open {
                    Ok(vec![TicketEvent::Closed])
                } else {
                    Err("ticket is not open".to_string())
                }
            },
            HandleOptions::in_scope(support_acme()),
        )
        .await
        .unwrap();
    assert!(!closed.new_state);
    assert_eq!(closed.next_expected_stream_version, Some(2));
}
