//! MariaDb persistence strategies. JSON lands in LONGTEXT columns guarded by
//! `JSON_VALID` checks, and the generated columns are VIRTUAL with
//! `JSON_VALUE` extraction.

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
pub struct MariaDbAggregateStreamStrategy;

impl PersistenceStrategy for MariaDbAggregateStreamStrategy {
    fn create_schema(&self, table_name: &str) -> Vec<String> {
        vec![format!(
            "CREATE TABLE `{table_name}` (\
             no BIGINT NOT NULL, \
             event_id CHAR(36) NOT NULL, \
             event_name VARCHAR(100) NOT NULL, \
             payload LONGTEXT NOT NULL, \
             metadata LONGTEXT NOT NULL, \
             created_at DATETIME(6) NOT NULL, \
             CHECK (JSON_VALID(payload)), \
             CHECK (JSON_VALID(metadata)), \
             PRIMARY KEY (no), \
             UNIQUE KEY ix_event_id (event_id)\
             ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_general_ci"
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

/// One stream per aggregate type, with virtual generated columns backing the
/// composite unique key and the per-aggregate query index.
#[derive(Debug, Clone, Copy, Default)]
pub struct MariaDbSingleStreamStrategy;

impl PersistenceStrategy for MariaDbSingleStreamStrategy {
    fn create_schema(&self, table_name: &str) -> Vec<String> {
        vec![format!(
            "CREATE TABLE `{table_name}` (\
             no BIGINT NOT NULL AUTO_INCREMENT, \
             event_id CHAR(36) NOT NULL, \
             event_name VARCHAR(100) NOT NULL, \
             payload LONGTEXT NOT NULL, \
             metadata LONGTEXT NOT NULL, \
             created_at DATETIME(6) NOT NULL, \
             aggregate_version INT UNSIGNED GENERATED ALWAYS AS \
             (JSON_VALUE(metadata, '$._aggregate_version')) VIRTUAL, \
             aggregate_id CHAR(36) GENERATED ALWAYS AS \
             (JSON_VALUE(metadata, '$._aggregate_id')) VIRTUAL, \
             aggregate_type VARCHAR(150) GENERATED ALWAYS AS \
             (JSON_VALUE(metadata, '$._aggregate_type')) VIRTUAL, \
             CHECK (JSON_VALID(payload)), \
             CHECK (JSON_VALID(metadata)), \
             PRIMARY KEY (no), \
             UNIQUE KEY ix_event_id (event_id), \
             UNIQUE KEY ix_unique_event (aggregate_type, aggregate_id, aggregate_version), \
             KEY ix_query_aggregate (aggregate_type, aggregate_id, no)\
             ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_general_ci"
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
pub struct MariaDbSimpleStreamStrategy;

impl PersistenceStrategy for MariaDbSimpleStreamStrategy {
    fn create_schema(&self, table_name: &str) -> Vec<String> {
        vec![format!(
            "CREATE TABLE `{table_name}` (\
             no BIGINT NOT NULL AUTO_INCREMENT, \
             event_id CHAR(36) NOT NULL, \
             event_name VARCHAR(100) NOT NULL, \
             payload LONGTEXT NOT NULL, \
             metadata LONGTEXT NOT NULL, \
             created_at DATETIME(6) NOT NULL, \
             CHECK (JSON_VALID(payload)), \
             CHECK (JSON_VALID(metadata)), \
             PRIMARY KEY (no), \
             UNIQUE KEY ix_event_id (event_id)\
             ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_general_ci"
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
    fn json_columns_are_longtext_with_validity_checks() {
        let ddl = MariaDbSimpleStreamStrategy.create_schema("_abc");
        assert!(ddl[0].contains("payload LONGTEXT"));
        assert!(ddl[0].contains("JSON_VALID(metadata)"));
    }

    #[test]
    fn generated_columns_are_virtual_json_value_extractions() {
        let ddl = MariaDbSingleStreamStrategy.create_schema("_abc");
        assert!(ddl[0].contains("JSON_VALUE(metadata, '$._aggregate_id')) VIRTUAL"));
        assert!(ddl[0].contains("ix_unique_event"));
    }

    #[test]
    fn aggregate_strategy_requires_a_version() {
        let result = MariaDbAggregateStreamStrategy.prepare_data(&[Event::new("e", json!({}))]);
        assert!(matches!(result, Err(Error::AggregateVersionMissing)));
    }
}
