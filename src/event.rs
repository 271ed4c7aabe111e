use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Position metadata key injected into events read back from a stream.
pub const POSITION_KEY: &str = "_position";

/// An event handed to the store for appending.
///
/// Payload and metadata are arbitrary JSON; the store never inspects the
/// payload and only reads reserved metadata keys (`_aggregate_version` and
/// friends) where the configured persistence strategy requires them.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_name: String,
    pub payload: Value,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_name: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_name: event_name.into(),
            payload,
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns a copy of the event with one more metadata entry set.
    pub fn with_added_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// An event read back from a stream table, together with its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Database assigned sequence number, strictly increasing per stream but
    /// not necessarily contiguous.
    pub no: i64,
    pub event_id: Uuid,
    pub event_name: String,
    pub payload: Value,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl RecordedEvent {
    /// Sets `_position` to the row number unless the writer already recorded
    /// one.
    pub(crate) fn inject_position(&mut self) {
        self.metadata
            .entry(POSITION_KEY.to_string())
            .or_insert_with(|| Value::from(self.no));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn added_metadata_does_not_clobber_other_keys() {
        let event = Event::new("user-registered", json!({"name": "John"}))
            .with_added_metadata("_aggregate_id", json!("a1"))
            .with_added_metadata("_aggregate_version", json!(1));

        assert_eq!(event.metadata.len(), 2);
        assert_eq!(event.metadata["_aggregate_id"], json!("a1"));
    }

    #[test]
    fn position_is_injected_only_when_absent() {
        let mut recorded = RecordedEvent {
            no: 5,
            event_id: Uuid::new_v4(),
            event_name: "user-registered".to_string(),
            payload: json!({}),
            metadata: Map::new(),
            created_at: Utc::now(),
        };
        recorded.inject_position();
        assert_eq!(recorded.metadata[POSITION_KEY], json!(5));

        recorded.no = 9;
        recorded.inject_position();
        assert_eq!(recorded.metadata[POSITION_KEY], json!(5));
    }
}
