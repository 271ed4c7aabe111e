#![cfg(feature = "postgres")]

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::TryStreamExt;
use serde_json::{json, Value};
use sqlx::{Pool, Postgres};

use sql_event_store::error::{BoxDynError, Error};
use sql_event_store::projection::projector::{ProjectorContext, ProjectorHandler};
use sql_event_store::strategy::postgres::PostgresAggregateStreamStrategy;
use sql_event_store::{
    Event, EventStore, GapDetection, PgEventStore, ProjectionManager, ProjectionStore,
    ProjectorOptions, ReadModel, RecordedEvent, Status, Stream, StreamName,
};

async fn store(pool: Pool<Postgres>) -> PgEventStore {
    PgEventStore::builder(pool)
        .try_build()
        .await
        .expect("failed to build PgEventStore")
}

fn counting_options() -> ProjectorOptions {
    ProjectorOptions::builder().sleep(100).build()
}

fn count_events(state: Value, _event: &RecordedEvent) -> Option<Value> {
    let count = state["count"].as_i64().unwrap_or(0);
    Some(json!({ "count": count + 1 }))
}

#[sqlx::test]
async fn a_projector_folds_a_stream_and_persists_its_position(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let manager = ProjectionManager::new(store.clone());
    let stream_name = StreamName::new("user-123");

    let events: Vec<Event> = (0..3)
        .map(|i| Event::new("user-counted", json!({ "i": i })))
        .collect();
    store
        .create(Stream::new(stream_name.clone()).with_events(events))
        .await
        .unwrap();

    let mut projector = manager
        .create_projection("user-count", counting_options())
        .init(|| json!({"count": 0}))
        .unwrap()
        .from_stream(stream_name.clone())
        .unwrap()
        .when_any(|state, event, _ctx| Ok(count_events(state, event)))
        .unwrap();

    projector.run(false).await.unwrap();
    assert_eq!(projector.state()["count"], json!(3));

    // Position, state and status are persisted in the registry.
    let positions = manager
        .fetch_projection_stream_positions("user-count")
        .await
        .unwrap();
    assert_eq!(positions["user-123"], json!(3));
    assert_eq!(
        manager.fetch_projection_state("user-count").await.unwrap(),
        json!({"count": 3})
    );
    assert_eq!(
        manager.fetch_projection_status("user-count").await.unwrap(),
        Status::Idle
    );

    // A later run resumes after the last checkpoint.
    store
        .append_to(
            &stream_name,
            vec![Event::new("user-counted", json!({"i": 3}))],
        )
        .await
        .unwrap();
    projector.run(false).await.unwrap();
    assert_eq!(projector.state()["count"], json!(4));
}

#[sqlx::test]
async fn named_handlers_skip_unmatched_events_but_advance_positions(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let manager = ProjectionManager::new(store.clone());
    let stream_name = StreamName::new("user-123");

    store
        .create(Stream::new(stream_name.clone()).with_events(vec![
            Event::new("user-registered", json!({})),
            Event::new("user-ignored", json!({})),
            Event::new("user-registered", json!({})),
        ]))
        .await
        .unwrap();

    let mut handlers: HashMap<String, ProjectorHandler> = HashMap::new();
    handlers.insert(
        "user-registered".to_string(),
        Box::new(|state: Value, event: &RecordedEvent, _ctx: &mut ProjectorContext| {
            Ok(count_events(state, event))
        }),
    );

    let mut projector = manager
        .create_projection("registrations", counting_options())
        .from_stream(stream_name)
        .unwrap()
        .when(handlers)
        .unwrap();

    projector.run(false).await.unwrap();
    assert_eq!(projector.state()["count"], json!(2));

    let positions = manager
        .fetch_projection_stream_positions("registrations")
        .await
        .unwrap();
    assert_eq!(positions["user-123"], json!(3));
}

#[sqlx::test]
async fn configuration_conflicts_are_rejected(pool: Pool<Postgres>) {
    let manager = ProjectionManager::new(store(pool).await);

    let result = manager
        .create_projection("p", counting_options())
        .from_all()
        .unwrap()
        .from_stream("user-1");
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    let result = manager
        .create_projection("p", counting_options())
        .when_any(|_, _, _| Ok(None))
        .unwrap()
        .when_any(|_, _, _| Ok(None));
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    let mut unconfigured = manager.create_projection("p", counting_options());
    assert!(matches!(
        unconfigured.run(false).await,
        Err(Error::Runtime(_))
    ));
}

#[sqlx::test]
async fn emitted_events_land_in_the_projection_stream(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let manager = ProjectionManager::new(store.clone());
    let stream_name = StreamName::new("user-123");

    store
        .create(Stream::new(stream_name.clone()).with_events(vec![
            Event::new("user-registered", json!({"name": "John"})),
            Event::new("user-registered", json!({"name": "Jane"})),
        ]))
        .await
        .unwrap();

    let mut projector = manager
        .create_projection("user-names", counting_options())
        .from_stream(stream_name)
        .unwrap()
        .when_any(|_state, event, ctx| {
            ctx.emit(Event::new("name-seen", event.payload.clone()));
            ctx.link_to("user-names-audit", Event::new("audited", json!({})));
            Ok(None)
        })
        .unwrap();
    projector.run(false).await.unwrap();

    let emitted: Vec<_> = store
        .load(&StreamName::new("user-names"), 1, None, None)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[0].event_name, "name-seen");

    let linked: Vec<_> = store
        .load(&StreamName::new("user-names-audit"), 1, None, None)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(linked.len(), 2);
}

#[sqlx::test]
async fn handlers_can_stop_the_projection_cooperatively(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let manager = ProjectionManager::new(store.clone());
    let stream_name = StreamName::new("user-123");

    let events: Vec<Event> = (0..5)
        .map(|_| Event::new("user-counted", json!({})))
        .collect();
    store
        .create(Stream::new(stream_name.clone()).with_events(events))
        .await
        .unwrap();

    let mut projector = manager
        .create_projection("stops-early", counting_options())
        .init(|| json!({"count": 0}))
        .unwrap()
        .from_stream(stream_name)
        .unwrap()
        .when_any(|state, event, ctx| {
            let state = count_events(state, event).unwrap();
            if state["count"] == json!(2) {
                ctx.stop();
            }
            Ok(Some(state))
        })
        .unwrap();

    // keep_running would otherwise poll forever.
    projector.run(true).await.unwrap();
    assert_eq!(projector.state()["count"], json!(2));
    assert_eq!(
        manager.fetch_projection_status("stops-early").await.unwrap(),
        Status::Idle
    );
}

#[sqlx::test]
async fn remote_commands_are_honored_on_the_next_run(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let manager = ProjectionManager::new(store.clone());
    let stream_name = StreamName::new("user-123");

    store
        .create(Stream::new(stream_name.clone()).with_events(vec![Event::new(
            "user-registered",
            json!({}),
        )]))
        .await
        .unwrap();

    let mut projector = manager
        .create_projection("controlled", counting_options())
        .init(|| json!({"count": 0}))
        .unwrap()
        .from_stream(stream_name)
        .unwrap()
        .when_any(|state, event, ctx| {
            ctx.emit(Event::new("echo", json!({})));
            Ok(count_events(state, event))
        })
        .unwrap();
    projector.run(false).await.unwrap();
    assert!(store.has_stream(&StreamName::new("controlled")).await.unwrap());

    // Reset: positions and state are cleared, the emitted stream removed.
    manager.reset_projection("controlled").await.unwrap();
    assert_eq!(
        manager.fetch_projection_status("controlled").await.unwrap(),
        Status::Resetting
    );
    projector.run(false).await.unwrap();
    assert_eq!(projector.state()["count"], json!(1));
    let positions = manager
        .fetch_projection_stream_positions("controlled")
        .await
        .unwrap();
    assert_eq!(positions["user-123"], json!(1));

    // Delete including emitted events: registry row and stream disappear.
    manager.delete_projection("controlled", true).await.unwrap();
    projector.run(false).await.unwrap();
    assert!(!store.projection_exists("controlled").await.unwrap());
    assert!(!store.has_stream(&StreamName::new("controlled")).await.unwrap());

    assert!(matches!(
        manager.stop_projection("unknown").await,
        Err(Error::ProjectionNotFound(_))
    ));
}

#[sqlx::test]
async fn the_lease_admits_a_single_holder(pool: Pool<Postgres>) {
    let store = store(pool).await;
    store.create_projection("lease").await.unwrap();

    let now = Utc::now();
    store
        .acquire_projection_lock("lease", now, now + Duration::milliseconds(1000))
        .await
        .unwrap();

    // The lease is still fresh, a second process is turned away.
    let result = store
        .acquire_projection_lock("lease", now, now + Duration::milliseconds(1000))
        .await;
    assert!(matches!(
        result,
        Err(Error::Runtime(message)) if message.contains("Another projection process")
    ));

    // Once the window elapsed the lease is transferable.
    let later = now + Duration::seconds(2);
    store
        .acquire_projection_lock("lease", later, later + Duration::milliseconds(1000))
        .await
        .unwrap();

    store
        .release_projection_lock("lease", Status::Idle)
        .await
        .unwrap();
    let again = now + Duration::seconds(4);
    store
        .acquire_projection_lock("lease", again, again + Duration::milliseconds(1000))
        .await
        .unwrap();
}

#[sqlx::test]
async fn gaps_are_retried_before_being_skipped(pool: Pool<Postgres>) {
    let store = PgEventStore::builder(pool)
        .with_strategy(PostgresAggregateStreamStrategy)
        .try_build()
        .await
        .unwrap();
    let manager = ProjectionManager::new(store.clone());
    let stream_name = StreamName::new("user-42");

    // The aggregate strategy uses the version as sequence number, so a
    // skipped version leaves a permanent gap at `no = 3`.
    let versioned = |version: i64| {
        Event::new("user-counted", json!({}))
            .with_added_metadata("_aggregate_id", json!("a"))
            .with_added_metadata("_aggregate_version", json!(version))
    };
    store
        .create(
            Stream::new(stream_name.clone())
                .with_events(vec![versioned(1), versioned(2), versioned(4)]),
        )
        .await
        .unwrap();

    let options = ProjectorOptions::builder()
        .sleep(100)
        .gap_detection(Some(
            GapDetection::new().with_retry_config(vec![0]),
        ))
        .build();
    let mut projector = manager
        .create_projection("gapped", options)
        .init(|| json!({"count": 0}))
        .unwrap()
        .from_stream(stream_name)
        .unwrap()
        .when_any(|state, event, _ctx| Ok(count_events(state, event)))
        .unwrap();

    // First pass stops in front of the gap and burns the only retry.
    projector.run(false).await.unwrap();
    let positions = manager
        .fetch_projection_stream_positions("gapped")
        .await
        .unwrap();
    assert_eq!(positions["user-42"], json!(2));

    // With retries exhausted the gap is accepted as permanent.
    projector.run(false).await.unwrap();
    let positions = manager
        .fetch_projection_stream_positions("gapped")
        .await
        .unwrap();
    assert_eq!(positions["user-42"], json!(4));
    assert_eq!(projector.state()["count"], json!(3));
}

#[sqlx::test]
async fn queries_fold_streams_in_global_order(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let manager = ProjectionManager::new(store.clone());

    let base = Utc::now();
    let at = |offset_ms: i64, name: &str| {
        let mut event = Event::new(name, json!({}));
        event.created_at = base + Duration::milliseconds(offset_ms);
        event
    };
    store
        .create(Stream::new("user-1").with_events(vec![at(0, "first"), at(20, "third")]))
        .await
        .unwrap();
    store
        .create(Stream::new("user-2").with_events(vec![at(10, "second")]))
        .await
        .unwrap();

    let mut query = manager
        .create_query()
        .init(|| json!({"seen": []}))
        .unwrap()
        .from_category("user")
        .unwrap()
        .when_any(|state, event, _ctx| {
            let mut seen = state["seen"].as_array().cloned().unwrap_or_default();
            seen.push(json!(event.event_name));
            Ok(Some(json!({ "seen": seen })))
        })
        .unwrap();
    query.run().await.unwrap();

    assert_eq!(query.state()["seen"], json!(["first", "second", "third"]));

    // A reset re-seeds the state and allows a fresh run.
    query.reset();
    assert_eq!(query.state()["seen"], json!([]));
    query.run().await.unwrap();
    assert_eq!(query.state()["seen"], json!(["first", "second", "third"]));
}

struct VecReadModel {
    initialized: bool,
    stack: Vec<String>,
    rows: Vec<String>,
}

#[async_trait]
impl ReadModel for VecReadModel {
    async fn init(&mut self) -> Result<(), BoxDynError> {
        self.initialized = true;
        Ok(())
    }

    async fn is_initialized(&mut self) -> Result<bool, BoxDynError> {
        Ok(self.initialized)
    }

    async fn reset(&mut self) -> Result<(), BoxDynError> {
        self.stack.clear();
        self.rows.clear();
        Ok(())
    }

    async fn delete(&mut self) -> Result<(), BoxDynError> {
        self.stack.clear();
        self.rows.clear();
        Ok(())
    }

    async fn persist(&mut self) -> Result<(), BoxDynError> {
        self.rows.append(&mut self.stack);
        Ok(())
    }
}

#[sqlx::test]
async fn read_model_projections_flush_buffered_writes_on_persist(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let manager = ProjectionManager::new(store.clone());
    let stream_name = StreamName::new("user-123");

    store
        .create(Stream::new(stream_name.clone()).with_events(vec![
            Event::new("user-registered", json!({"name": "John"})),
            Event::new("user-registered", json!({"name": "Jane"})),
        ]))
        .await
        .unwrap();

    let read_model = VecReadModel {
        initialized: false,
        stack: Vec::new(),
        rows: Vec::new(),
    };
    let mut projector = manager
        .create_read_model_projection("user-list", read_model, counting_options())
        .from_stream(stream_name)
        .unwrap()
        .when_any(|_state, event, ctx| {
            let name = event.payload["name"].as_str().unwrap_or("?").to_string();
            ctx.read_model().stack.push(name);
            Ok(None)
        })
        .unwrap();

    projector.run(false).await.unwrap();
    assert!(projector.read_model().stack.is_empty());
    assert_eq!(projector.read_model().rows, vec!["John", "Jane"]);
}

#[sqlx::test]
async fn projection_names_are_listed_and_filtered(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let manager = ProjectionManager::new(store.clone());
    for name in ["alpha", "beta", "alphabet"] {
        store.create_projection(name).await.unwrap();
    }

    let names = manager.projection_names().await.unwrap();
    assert_eq!(names, vec!["alpha", "alphabet", "beta"]);

    let names = manager
        .fetch_projection_names(Some("beta"), 20, 0)
        .await
        .unwrap();
    assert_eq!(names, vec!["beta"]);

    let names = manager
        .fetch_projection_names_regex("^alpha", 20, 0)
        .await
        .unwrap();
    assert_eq!(names, vec!["alpha", "alphabet"]);

    // Postgres rejects the malformed pattern server side.
    assert!(matches!(
        manager.fetch_projection_names_regex("(", 20, 0).await,
        Err(Error::InvalidArgument(_))
    ));

    assert!(matches!(
        manager.fetch_projection_status("unknown").await,
        Err(Error::ProjectionNotFound(_))
    ));
}
