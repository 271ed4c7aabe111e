//! MySql persistence strategies. Aggregate constraints are expressed through
//! stored generated columns so they can carry unique keys, and the single
//! stream strategy advertises its query index for `USE INDEX` injection.

use serde_json::Value;

use crate::error::Error;
use crate::event::Event;
use crate::json;
use crate::sql::SqlValue;

use super::{
    aggregate_version, PersistenceStrategy, COLUMNS_WITHOUT_NO, COLUMNS_WITH_NO,
};

const SINGLE_STREAM_INDEXED_FIELDS: &[(&str, &str)] = &[
    ("_aggregate_type", "aggregate_type"),
    ("_aggregate_id", "aggregate_id"),
    ("_aggregate_version", "aggregate_version"),
];

fn row_values(event: &Event) -> Result<[SqlValue; 5], Error> {
    Ok([
        SqlValue::Text(event.event_id.to_string()),
        SqlValue::Text(event.event_name.clone()),
        SqlValue::Text(json::encode(&event.payload)?),
        SqlValue::Text(json::encode(&Value::Object(event.metadata.clone()))?),
        SqlValue::Timestamp(event.created_at),
    ])
}

/// One stream per aggregate instance; the aggregate version doubles as the
/// sequence number, so the primary key enforces version uniqueness.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlAggregateStreamStrategy;

impl PersistenceStrategy for MySqlAggregateStreamStrategy {
    fn create_schema(&self, table_name: &str) -> Vec<String> {
        vec![format!(
            "CREATE TABLE `{table_name}` (\
             no BIGINT NOT NULL, \
             event_id CHAR(36) COLLATE utf8mb4_bin NOT NULL, \
             event_name VARCHAR(100) COLLATE utf8mb4_bin NOT NULL, \
             payload JSON NOT NULL, \
             metadata JSON NOT NULL, \
             created_at DATETIME(6) NOT NULL, \
             PRIMARY KEY (no), \
             UNIQUE KEY ix_event_id (event_id)\
             ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin"
        )]
    }

    fn column_names(&self) -> &'static [&'static str] {
        COLUMNS_WITH_NO
    }

    fn prepare_data(&self, events: &[Event]) -> Result<Vec<SqlValue>, Error> {
        let mut values = Vec::with_capacity(events.len() * COLUMNS_WITH_NO.len());
        for event in events {
            values.push(SqlValue::Int(aggregate_version(event)?));
            values.extend(row_values(event)?);
        }
        Ok(values)
    }
}

/// One stream per aggregate type. Generated columns materialize the aggregate
/// metadata for the composite unique key and the per-aggregate query index.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlSingleStreamStrategy;

impl PersistenceStrategy for MySqlSingleStreamStrategy {
    fn create_schema(&self, table_name: &str) -> Vec<String> {
        vec![format!(
            "CREATE TABLE `{table_name}` (\
             no BIGINT NOT NULL AUTO_INCREMENT, \
             event_id CHAR(36) COLLATE utf8mb4_bin NOT NULL, \
             event_name VARCHAR(100) COLLATE utf8mb4_bin NOT NULL, \
             payload JSON NOT NULL, \
             metadata JSON NOT NULL, \
             created_at DATETIME(6) NOT NULL, \
             aggregate_version INT UNSIGNED GENERATED ALWAYS AS \
             (JSON_EXTRACT(metadata, '$._aggregate_version')) STORED NOT NULL, \
             aggregate_id CHAR(36) COLLATE utf8mb4_bin GENERATED ALWAYS AS \
             (JSON_UNQUOTE(JSON_EXTRACT(metadata, '$._aggregate_id'))) STORED NOT NULL, \
             aggregate_type VARCHAR(150) COLLATE utf8mb4_bin GENERATED ALWAYS AS \
             (JSON_UNQUOTE(JSON_EXTRACT(metadata, '$._aggregate_type'))) STORED NOT NULL, \
             PRIMARY KEY (no), \
             UNIQUE KEY ix_event_id (event_id), \
             UNIQUE KEY ix_unique_event (aggregate_type, aggregate_id, aggregate_version), \
             KEY ix_query_aggregate (aggregate_type, aggregate_id, no)\
             ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin"
        )]
    }

    fn column_names(&self) -> &'static [&'static str] {
        COLUMNS_WITHOUT_NO
    }

    fn prepare_data(&self, events: &[Event]) -> Result<Vec<SqlValue>, Error> {
        let mut values = Vec::with_capacity(events.len() * COLUMNS_WITHOUT_NO.len());
        for event in events {
            values.extend(row_values(event)?);
        }
        Ok(values)
    }

    fn index_name(&self) -> Option<&'static str> {
        Some("ix_query_aggregate")
    }

    fn indexed_metadata_fields(&self) -> Option<&'static [(&'static str, &'static str)]> {
        Some(SINGLE_STREAM_INDEXED_FIELDS)
    }
}

/// No aggregate constraints, only `event_id` uniqueness.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlSimpleStreamStrategy;

impl PersistenceStrategy for MySqlSimpleStreamStrategy {
    fn create_schema(&self, table_name: &str) -> Vec<String> {
        vec![format!(
            "CREATE TABLE `{table_name}` (\
             no BIGINT NOT NULL AUTO_INCREMENT, \
             event_id CHAR(36) COLLATE utf8mb4_bin NOT NULL, \
             event_name VARCHAR(100) COLLATE utf8mb4_bin NOT NULL, \
             payload JSON NOT NULL, \
             metadata JSON NOT NULL, \
             created_at DATETIME(6) NOT NULL, \
             PRIMARY KEY (no), \
             UNIQUE KEY ix_event_id (event_id)\
             ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin"
        )]
    }

    fn column_names(&self) -> &'static [&'static str] {
        COLUMNS_WITHOUT_NO
    }

    fn prepare_data(&self, events: &[Event]) -> Result<Vec<SqlValue>, Error> {
        let mut values = Vec::with_capacity(events.len() * COLUMNS_WITHOUT_NO.len());
        for event in events {
            values.extend(row_values(event)?);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn single_stream_advertises_its_query_index() {
        let strategy = MySqlSingleStreamStrategy;
        assert_eq!(strategy.index_name(), Some("ix_query_aggregate"));
        let fields = strategy.indexed_metadata_fields().unwrap();
        assert!(fields.contains(&("_aggregate_id", "aggregate_id")));
    }

    #[test]
    fn aggregate_strategy_requires_a_version() {
        let strategy = MySqlAggregateStreamStrategy;
        assert!(matches!(
            strategy.prepare_data(&[Event::new("e", json!({}))]),
            Err(Error::AggregateVersionMissing)
        ));
    }

    #[test]
    fn payload_and_metadata_are_bound_as_encoded_json() {
        let strategy = MySqlSimpleStreamStrategy;
        let event = Event::new("e", json!({"name": ["John", "Jane"]}));
        let values = strategy.prepare_data(&[event]).unwrap();
        assert!(matches!(
            &values[2],
            SqlValue::Text(payload) if payload == r#"{"name":["John","Jane"]}"#
        ));
    }

    #[test]
    fn uuids_are_bound_as_char_36() {
        let strategy = MySqlSimpleStreamStrategy;
        let event = Event::new("e", json!({}));
        let values = strategy.prepare_data(&[event.clone()]).unwrap();
        assert!(matches!(
            &values[0],
            SqlValue::Text(id) if *id == event.event_id.to_string()
        ));
    }
}
