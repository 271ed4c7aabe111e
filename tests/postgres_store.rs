#![cfg(feature = "postgres")]

use futures::TryStreamExt;
use serde_json::{json, Map, Value};
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use sql_event_store::error::Error;
use sql_event_store::strategy::postgres::{
    PostgresAggregateStreamStrategy, PostgresSimpleStreamStrategy,
};
use sql_event_store::{
    Event, EventStore, MetadataMatcher, Operator, PgEventStore, RecordedEvent, Stream, StreamName,
};

async fn store(pool: Pool<Postgres>) -> PgEventStore {
    PgEventStore::builder(pool)
        .try_build()
        .await
        .expect("failed to build PgEventStore")
}

fn metadata(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

async fn collect(
    store: &PgEventStore,
    stream: &StreamName,
    from: i64,
) -> Result<Vec<RecordedEvent>, Error> {
    store.load(stream, from, None, None).await?.try_collect().await
}

#[sqlx::test]
async fn created_streams_are_registered_and_loadable(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let stream_name = StreamName::new("user-123");

    let event = Event::new("user-registered", json!({"name": ["John", "Jane"]}))
        .with_metadata(metadata(&[("key", json!("value"))]));
    store
        .create(Stream::new(stream_name.clone()).with_events(vec![event.clone()]))
        .await
        .unwrap();

    assert!(store.has_stream(&stream_name).await.unwrap());

    let events = collect(&store, &stream_name, 1).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].no, 1);
    assert_eq!(events[0].event_id, event.event_id);
    assert_eq!(events[0].payload, event.payload);
    assert_eq!(events[0].metadata["key"], json!("value"));
    // The sequence number is injected as `_position` on read.
    assert_eq!(events[0].metadata["_position"], json!(1));
}

#[sqlx::test]
async fn the_raw_metadata_column_holds_compact_json(pool: Pool<Postgres>) {
    let store = store(pool.clone()).await;
    let stream_name = StreamName::new("user-123");

    let event = Event::new("user-registered", json!({"name": "John"}))
        .with_metadata(metadata(&[("key", json!("value"))]));
    store
        .create(Stream::new(stream_name.clone()).with_events(vec![event]))
        .await
        .unwrap();

    let table = stream_name.table_name();
    let raw: String = sqlx::query(&format!("SELECT metadata::text FROM \"{table}\""))
        .fetch_one(&pool)
        .await
        .unwrap()
        .get(0);
    assert_eq!(raw.replace(' ', ""), r#"{"key":"value"}"#);
}

#[sqlx::test]
async fn creating_the_same_stream_twice_fails(pool: Pool<Postgres>) {
    let store = store(pool).await;

    store.create(Stream::new("user-123")).await.unwrap();
    let result = store.create(Stream::new("user-123")).await;
    assert!(matches!(result, Err(Error::StreamExistsAlready(_))));
}

#[sqlx::test]
async fn appending_to_a_missing_stream_fails(pool: Pool<Postgres>) {
    let store = store(pool).await;

    let result = store
        .append_to(&StreamName::new("missing"), vec![Event::new("e", json!({}))])
        .await;
    assert!(matches!(result, Err(Error::StreamNotFound(_))));
}

#[sqlx::test]
async fn appending_an_empty_batch_is_a_no_op(pool: Pool<Postgres>) {
    let store = store(pool).await;
    store.create(Stream::new("user-123")).await.unwrap();

    store
        .append_to(&StreamName::new("user-123"), vec![])
        .await
        .unwrap();
    assert!(collect(&store, &StreamName::new("user-123"), 1)
        .await
        .unwrap()
        .is_empty());
}

#[sqlx::test]
async fn aggregate_version_collisions_are_concurrency_errors(pool: Pool<Postgres>) {
    let store = PgEventStore::builder(pool)
        .with_strategy(PostgresAggregateStreamStrategy)
        .try_build()
        .await
        .unwrap();
    let stream_name = StreamName::new("user-42");

    let first = Event::new("user-registered", json!({"name": "John"}))
        .with_added_metadata("_aggregate_id", json!("a"))
        .with_added_metadata("_aggregate_version", json!(1));
    store
        .create(Stream::new(stream_name.clone()).with_events(vec![first.clone()]))
        .await
        .unwrap();

    let colliding = Event::new("user-renamed", json!({"name": "Jane"}))
        .with_added_metadata("_aggregate_id", json!("a"))
        .with_added_metadata("_aggregate_version", json!(1));
    let result = store.append_to(&stream_name, vec![colliding]).await;
    assert!(matches!(result, Err(Error::Concurrency(_))));

    let events = collect(&store, &stream_name, 1).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_id, first.event_id);
}

#[sqlx::test]
async fn aggregate_streams_require_a_version(pool: Pool<Postgres>) {
    let store = PgEventStore::builder(pool)
        .with_strategy(PostgresAggregateStreamStrategy)
        .try_build()
        .await
        .unwrap();

    let result = store
        .create(Stream::new("user-42").with_events(vec![Event::new("e", json!({}))]))
        .await;
    assert!(matches!(result, Err(Error::AggregateVersionMissing)));
    // The failed create tears down registry row and table again.
    assert!(!store.has_stream(&StreamName::new("user-42")).await.unwrap());
}

#[sqlx::test]
async fn load_respects_from_number_and_count(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let stream_name = StreamName::new("user-123");

    let events: Vec<Event> = (0..5)
        .map(|i| Event::new("user-counted", json!({ "i": i })))
        .collect();
    store
        .create(Stream::new(stream_name.clone()).with_events(events))
        .await
        .unwrap();

    let loaded = collect(&store, &stream_name, 3).await.unwrap();
    assert_eq!(loaded.iter().map(|e| e.no).collect::<Vec<_>>(), vec![3, 4, 5]);

    let capped: Vec<RecordedEvent> = store
        .load(&stream_name, 1, Some(2), None)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(capped.iter().map(|e| e.no).collect::<Vec<_>>(), vec![1, 2]);

    let mut empty = store.load(&stream_name, 1, Some(0), None).await.unwrap();
    assert!(empty.next().await.is_none());
}

#[sqlx::test]
async fn batches_are_paged_transparently(pool: Pool<Postgres>) {
    let store = PgEventStore::builder(pool)
        .with_load_batch_size(2)
        .try_build()
        .await
        .unwrap();
    let stream_name = StreamName::new("user-123");

    let events: Vec<Event> = (0..7)
        .map(|i| Event::new("user-counted", json!({ "i": i })))
        .collect();
    store
        .create(Stream::new(stream_name.clone()).with_events(events))
        .await
        .unwrap();

    let loaded = collect(&store, &stream_name, 1).await.unwrap();
    assert_eq!(
        loaded.iter().map(|e| e.no).collect::<Vec<_>>(),
        (1..=7).collect::<Vec<_>>()
    );
}

#[sqlx::test]
async fn load_reverse_yields_decreasing_sequence_numbers(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let stream_name = StreamName::new("user-123");

    let events: Vec<Event> = (0..4)
        .map(|i| Event::new("user-counted", json!({ "i": i })))
        .collect();
    store
        .create(Stream::new(stream_name.clone()).with_events(events))
        .await
        .unwrap();

    let iterator = store.load_reverse(&stream_name, None, None, None).await.unwrap();
    assert_eq!(iterator.total(), Some(4));
    let loaded: Vec<RecordedEvent> = iterator.try_collect().await.unwrap();
    assert_eq!(loaded.iter().map(|e| e.no).collect::<Vec<_>>(), vec![4, 3, 2, 1]);

    let bounded: Vec<RecordedEvent> = store
        .load_reverse(&stream_name, Some(3), Some(2), None)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(bounded.iter().map(|e| e.no).collect::<Vec<_>>(), vec![3, 2]);

    let mut empty = store
        .load_reverse(&StreamName::new("user-123"), Some(0), None, None)
        .await
        .unwrap();
    assert!(empty.next().await.is_none());
}

#[sqlx::test]
async fn metadata_matchers_filter_events(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let stream_name = StreamName::new("user-123");

    let tagged = Event::new("user-registered", json!({}))
        .with_added_metadata("tenant", json!("alpha"))
        .with_added_metadata("internal", json!(true));
    let untagged = Event::new("user-registered", json!({}))
        .with_added_metadata("tenant", json!("beta"))
        .with_added_metadata("internal", json!(false));
    store
        .create(Stream::new(stream_name.clone()).with_events(vec![tagged.clone(), untagged]))
        .await
        .unwrap();

    let matcher = MetadataMatcher::new()
        .with("tenant", Operator::Equals, json!("alpha"))
        .unwrap();
    let events: Vec<RecordedEvent> = store
        .load(&stream_name, 1, None, Some(&matcher))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_id, tagged.event_id);

    let matcher = MetadataMatcher::new()
        .with("tenant", Operator::In, json!(["alpha", "beta"]))
        .unwrap()
        .with("internal", Operator::Equals, json!(false))
        .unwrap();
    let events: Vec<RecordedEvent> = store
        .load(&stream_name, 1, None, Some(&matcher))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].metadata["tenant"], json!("beta"));

    let matcher = MetadataMatcher::new()
        .with_message_property("no", Operator::GreaterThanEquals, json!(2))
        .unwrap();
    let events: Vec<RecordedEvent> = store
        .load(&stream_name, 1, None, Some(&matcher))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(events.iter().map(|e| e.no).collect::<Vec<_>>(), vec![2]);

    let matcher = MetadataMatcher::new()
        .with_message_property("event_name", Operator::Regex, json!("^user-"))
        .unwrap();
    let events: Vec<RecordedEvent> = store
        .load(&stream_name, 1, None, Some(&matcher))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(events.len(), 2);
}

#[sqlx::test]
async fn unknown_matcher_columns_are_reported(pool: Pool<Postgres>) {
    let store = store(pool).await;
    store.create(Stream::new("user-123")).await.unwrap();

    let matcher = MetadataMatcher::new()
        .with_message_property("nope", Operator::Equals, json!("x"))
        .unwrap();
    let result = store
        .load(&StreamName::new("user-123"), 1, None, Some(&matcher))
        .await;
    assert!(matches!(result, Err(Error::UnexpectedValue(message)) if message.contains("metadata matcher")));
}

#[sqlx::test]
async fn deleted_streams_are_gone(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let stream_name = StreamName::new("user-123");
    store
        .create(Stream::new(stream_name.clone()).with_events(vec![Event::new("e", json!({}))]))
        .await
        .unwrap();

    store.delete(&stream_name).await.unwrap();
    assert!(!store.has_stream(&stream_name).await.unwrap());
    assert!(matches!(
        store.load(&stream_name, 1, None, None).await,
        Err(Error::StreamNotFound(_))
    ));
    assert!(matches!(
        store.delete(&stream_name).await,
        Err(Error::StreamNotFound(_))
    ));
}

#[sqlx::test]
async fn stream_metadata_can_be_read_and_updated(pool: Pool<Postgres>) {
    let store = store(pool).await;
    let stream_name = StreamName::new("user-123");
    store
        .create(Stream::new(stream_name.clone()).with_metadata(metadata(&[("owner", json!("crm"))])))
        .await
        .unwrap();

    let loaded = store.fetch_stream_metadata(&stream_name).await.unwrap();
    assert_eq!(loaded["owner"], json!("crm"));

    store
        .update_stream_metadata(&stream_name, metadata(&[("owner", json!("billing"))]))
        .await
        .unwrap();
    let loaded = store.fetch_stream_metadata(&stream_name).await.unwrap();
    assert_eq!(loaded["owner"], json!("billing"));

    assert!(matches!(
        store.fetch_stream_metadata(&StreamName::new("missing")).await,
        Err(Error::StreamNotFound(_))
    ));
    assert!(matches!(
        store
            .update_stream_metadata(&StreamName::new("missing"), Map::new())
            .await,
        Err(Error::StreamNotFound(_))
    ));
}

#[sqlx::test]
async fn stream_names_are_enumerated_in_pages(pool: Pool<Postgres>) {
    let store = store(pool).await;
    for name in ["user-1", "user-2", "order-1"] {
        store.create(Stream::new(name)).await.unwrap();
    }

    let names = store.fetch_stream_names(None, None, 20, 0).await.unwrap();
    assert_eq!(
        names.iter().map(StreamName::as_str).collect::<Vec<_>>(),
        vec!["order-1", "user-1", "user-2"]
    );

    let names = store
        .fetch_stream_names(Some("user-1"), None, 20, 0)
        .await
        .unwrap();
    assert_eq!(names.len(), 1);

    let names = store
        .fetch_stream_names_regex("^user-", None, 20, 0)
        .await
        .unwrap();
    assert_eq!(names.len(), 2);

    let names = store.fetch_stream_names(None, None, 1, 1).await.unwrap();
    assert_eq!(names[0].as_str(), "user-1");
}

#[sqlx::test]
async fn invalid_regex_filters_fail_before_reaching_the_database(pool: Pool<Postgres>) {
    let store = store(pool).await;

    assert!(matches!(
        store.fetch_stream_names_regex("(", None, 20, 0).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        store.fetch_category_names_regex("", 20, 0).await,
        Err(Error::InvalidArgument(_))
    ));
}

#[sqlx::test]
async fn categories_are_grouped(pool: Pool<Postgres>) {
    let store = store(pool).await;
    for name in ["user-1", "user-2", "order-1", "plain"] {
        store.create(Stream::new(name)).await.unwrap();
    }

    let categories = store.fetch_category_names(None, 20, 0).await.unwrap();
    assert_eq!(categories, vec!["order", "user"]);

    let categories = store.fetch_category_names(Some("user"), 20, 0).await.unwrap();
    assert_eq!(categories, vec!["user"]);

    let categories = store.fetch_category_names_regex("^ord", 20, 0).await.unwrap();
    assert_eq!(categories, vec!["order"]);
}

#[sqlx::test]
async fn simple_streams_allow_duplicate_aggregate_versions(pool: Pool<Postgres>) {
    let store = PgEventStore::builder(pool)
        .with_strategy(PostgresSimpleStreamStrategy)
        .try_build()
        .await
        .unwrap();
    let stream_name = StreamName::new("audit");

    let duplicate_version = |uuid: Uuid| {
        Event {
            event_id: uuid,
            ..Event::new("audited", json!({}))
        }
        .with_added_metadata("_aggregate_version", json!(1))
    };
    store
        .create(Stream::new(stream_name.clone()).with_events(vec![
            duplicate_version(Uuid::new_v4()),
            duplicate_version(Uuid::new_v4()),
        ]))
        .await
        .unwrap();

    assert_eq!(collect(&store, &stream_name, 1).await.unwrap().len(), 2);

    // Duplicate event ids still collide.
    let id = Uuid::new_v4();
    let result = store
        .append_to(
            &stream_name,
            vec![duplicate_version(id), duplicate_version(id)],
        )
        .await;
    assert!(matches!(result, Err(Error::Concurrency(_))));
}

#[sqlx::test]
async fn a_too_small_batch_size_is_rejected(pool: Pool<Postgres>) {
    let result = PgEventStore::builder(pool).with_load_batch_size(0).try_build().await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}
