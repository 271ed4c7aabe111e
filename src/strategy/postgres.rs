//! Postgres persistence strategies. Aggregate constraints are expressed as
//! functional unique indexes over the JSONB metadata column.

use serde_json::Value;

use crate::error::Error;
use crate::event::Event;
use crate::sql::{Dialect, SqlValue};
use crate::stream::StreamName;

use super::{
    aggregate_version, PersistenceStrategy, COLUMNS_WITHOUT_NO, COLUMNS_WITH_NO,
};

const DIALECT: Dialect = Dialect::Postgres;

fn base_table_ddl(quoted: &str) -> String {
    format!(
        "CREATE TABLE {quoted} (\
         no BIGSERIAL, \
         event_id UUID NOT NULL, \
         event_name VARCHAR(100) NOT NULL, \
         payload JSON NOT NULL, \
         metadata JSONB NOT NULL, \
         created_at TIMESTAMPTZ NOT NULL, \
         PRIMARY KEY (no), \
         UNIQUE (event_id))"
    )
}

/// Table name with the schema prefix the stream name may carry.
fn qualified_table_name(stream_name: &StreamName) -> String {
    match stream_name.schema() {
        Some(schema) => format!("{schema}.{}", stream_name.table_name()),
        None => stream_name.table_name(),
    }
}

fn row_values(event: &Event) -> [SqlValue; 5] {
    [
        SqlValue::Uuid(event.event_id),
        SqlValue::Text(event.event_name.clone()),
        SqlValue::Json(event.payload.clone()),
        SqlValue::Json(Value::Object(event.metadata.clone())),
        SqlValue::Timestamp(event.created_at),
    ]
}

/// One stream per aggregate instance; the aggregate version doubles as the
/// sequence number.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresAggregateStreamStrategy;

impl PersistenceStrategy for PostgresAggregateStreamStrategy {
    fn create_schema(&self, table_name: &str) -> Vec<String> {
        let quoted = DIALECT.quote(table_name);
        vec![
            base_table_ddl(&quoted),
            format!(
                "CREATE UNIQUE INDEX ON {quoted} ((metadata->>'_aggregate_version'))"
            ),
        ]
    }

    fn column_names(&self) -> &'static [&'static str] {
        COLUMNS_WITH_NO
    }

    fn prepare_data(&self, events: &[Event]) -> Result<Vec<SqlValue>, Error> {
        let mut values = Vec::with_capacity(events.len() * COLUMNS_WITH_NO.len());
        for event in events {
            values.push(SqlValue::Int(aggregate_version(event)?));
            values.extend(row_values(event));
        }
        Ok(values)
    }

    fn table_name(&self, stream_name: &StreamName) -> String {
        qualified_table_name(stream_name)
    }
}

/// One stream per aggregate type, with composite uniqueness over
/// `(_aggregate_type, _aggregate_id, _aggregate_version)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresSingleStreamStrategy;

impl PersistenceStrategy for PostgresSingleStreamStrategy {
    fn create_schema(&self, table_name: &str) -> Vec<String> {
        let quoted = DIALECT.quote(table_name);
        vec![
            base_table_ddl(&quoted),
            format!(
                "CREATE UNIQUE INDEX ON {quoted} \
                 ((metadata->>'_aggregate_type'), (metadata->>'_aggregate_id'), \
                 (metadata->>'_aggregate_version'))"
            ),
            format!(
                "CREATE INDEX ON {quoted} \
                 ((metadata->>'_aggregate_type'), (metadata->>'_aggregate_id'), no)"
            ),
        ]
    }

    fn column_names(&self) -> &'static [&'static str] {
        COLUMNS_WITHOUT_NO
    }

    fn prepare_data(&self, events: &[Event]) -> Result<Vec<SqlValue>, Error> {
        Ok(events.iter().flat_map(row_values).collect())
    }

    fn table_name(&self, stream_name: &StreamName) -> String {
        qualified_table_name(stream_name)
    }
}

/// No aggregate constraints, only `event_id` uniqueness.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresSimpleStreamStrategy;

impl PersistenceStrategy for PostgresSimpleStreamStrategy {
    fn create_schema(&self, table_name: &str) -> Vec<String> {
        vec![base_table_ddl(&DIALECT.quote(table_name))]
    }

    fn column_names(&self) -> &'static [&'static str] {
        COLUMNS_WITHOUT_NO
    }

    fn prepare_data(&self, events: &[Event]) -> Result<Vec<SqlValue>, Error> {
        Ok(events.iter().flat_map(row_values).collect())
    }

    fn table_name(&self, stream_name: &StreamName) -> String {
        qualified_table_name(stream_name)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn aggregate_strategy_uses_the_version_as_sequence_number() {
        let strategy = PostgresAggregateStreamStrategy;
        let event = Event::new("e", json!({"a": 1}))
            .with_added_metadata("_aggregate_version", json!(4));

        let values = strategy.prepare_data(&[event]).unwrap();
        assert_eq!(values.len(), strategy.column_names().len());
        assert!(matches!(values[0], SqlValue::Int(4)));
    }

    #[test]
    fn aggregate_strategy_rejects_events_without_a_version() {
        let strategy = PostgresAggregateStreamStrategy;
        let result = strategy.prepare_data(&[Event::new("e", json!({}))]);
        assert!(matches!(result, Err(Error::AggregateVersionMissing)));
    }

    #[test]
    fn single_stream_schema_adds_composite_uniqueness() {
        let ddl = PostgresSingleStreamStrategy.create_schema("_abc");
        assert_eq!(ddl.len(), 3);
        assert!(ddl[1].contains("CREATE UNIQUE INDEX"));
        assert!(ddl[1].contains("_aggregate_type"));
        assert!(ddl[2].contains("no)"));
    }

    #[test]
    fn simple_stream_strategy_omits_the_sequence_number_on_insert() {
        let strategy = PostgresSimpleStreamStrategy;
        assert_eq!(strategy.column_names().first(), Some(&"event_id"));
        assert_eq!(strategy.create_schema("_abc").len(), 1);
    }

    #[test]
    fn table_names_keep_the_schema_prefix() {
        let strategy = PostgresSimpleStreamStrategy;
        let table = strategy.table_name(&StreamName::new("public.user-123"));
        assert!(table.starts_with("public._"));
        assert_eq!(
            strategy.table_name(&StreamName::new("user-123")),
            "_d5ecfb11836d0806d18f2fd4c815d970bdc54ddc"
        );
    }
}
