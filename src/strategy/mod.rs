//! Persistence strategies: the schema, insert column order and row
//! serialization for one family of stream tables on one dialect.

#[cfg(feature = "mysql")]
pub mod mariadb;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;

use serde_json::Value;

use crate::error::Error;
use crate::event::Event;
use crate::sql::SqlValue;
use crate::stream::StreamName;

/// Metadata key carrying the aggregate version on aggregate-bound streams.
pub const AGGREGATE_VERSION_KEY: &str = "_aggregate_version";

pub(crate) const COLUMNS_WITH_NO: &[&str] =
    &["no", "event_id", "event_name", "payload", "metadata", "created_at"];
pub(crate) const COLUMNS_WITHOUT_NO: &[&str] =
    &["event_id", "event_name", "payload", "metadata", "created_at"];

pub trait PersistenceStrategy: Send + Sync {
    /// DDL statements creating the stream table, executed in order.
    fn create_schema(&self, table_name: &str) -> Vec<String>;

    /// Insert column list, matching the layout produced by `prepare_data`.
    fn column_names(&self) -> &'static [&'static str];

    /// Flattens a batch into bind values, one group per event in
    /// `column_names` order.
    fn prepare_data(&self, events: &[Event]) -> Result<Vec<SqlValue>, Error>;

    /// Physical table name for a logical stream.
    fn table_name(&self, stream_name: &StreamName) -> String {
        stream_name.table_name()
    }

    /// Secondary index advertised for query hints, where the dialect
    /// supports them.
    fn index_name(&self) -> Option<&'static str> {
        None
    }

    /// Metadata fields materialized as real columns; matcher predicates on
    /// these fields are rewritten to target the column directly.
    fn indexed_metadata_fields(&self) -> Option<&'static [(&'static str, &'static str)]> {
        None
    }
}

/// Reads the aggregate version an aggregate stream strategy persists as the
/// event sequence number.
pub(crate) fn aggregate_version(event: &Event) -> Result<i64, Error> {
    event
        .metadata
        .get(AGGREGATE_VERSION_KEY)
        .and_then(Value::as_i64)
        .ok_or(Error::AggregateVersionMissing)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn aggregate_version_requires_an_integer_metadata_entry() {
        let event = Event::new("e", json!({}));
        assert!(matches!(
            aggregate_version(&event),
            Err(Error::AggregateVersionMissing)
        ));

        let event = event.with_added_metadata(AGGREGATE_VERSION_KEY, json!(3));
        assert_eq!(aggregate_version(&event).unwrap(), 3);
    }
}
