use std::fmt;

use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

use crate::event::Event;

/// Logical name of a stream.
///
/// Two conventions are encoded in the name itself: the part before the first
/// `-` is the stream category, and on dialects with schema support the part
/// before the first `.` selects the schema of the backing table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct StreamName(String);

impl StreamName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Category of the stream: everything before the first `-`, if any.
    pub fn category(&self) -> Option<&str> {
        self.0.split_once('-').map(|(category, _)| category)
    }

    /// Physical table name: `_` followed by the hex encoded SHA-1 of the
    /// logical name. The schema prefix, if any, is not part of this value.
    pub fn table_name(&self) -> String {
        use fmt::Write;

        let digest = Sha1::digest(self.0.as_bytes());
        let mut table = String::with_capacity(41);
        table.push('_');
        for byte in digest {
            let _ = write!(table, "{byte:02x}");
        }
        table
    }

    /// Schema prefix encoded in the name, for dialects that support one.
    pub(crate) fn schema(&self) -> Option<&str> {
        self.0
            .split_once('.')
            .map(|(schema, _)| schema)
            .filter(|schema| !schema.is_empty())
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for StreamName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A stream to be created: name, stream level metadata and initial events.
#[derive(Debug, Clone)]
pub struct Stream {
    pub name: StreamName,
    pub metadata: Map<String, Value>,
    pub events: Vec<Event>,
}

impl Stream {
    pub fn new(name: impl Into<StreamName>) -> Self {
        Self {
            name: name.into(),
            metadata: Map::new(),
            events: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_is_the_prefix_before_the_first_dash() {
        assert_eq!(StreamName::new("user-123").category(), Some("user"));
        assert_eq!(StreamName::new("user-123-abc").category(), Some("user"));
        assert_eq!(StreamName::new("user").category(), None);
    }

    #[test]
    fn table_name_is_the_hashed_stream_name() {
        assert_eq!(
            StreamName::new("user-123").table_name(),
            "_d5ecfb11836d0806d18f2fd4c815d970bdc54ddc"
        );
        assert_eq!(
            StreamName::new("foo").table_name(),
            "_0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33"
        );
    }

    #[test]
    fn schema_prefix_is_extracted_from_dotted_names() {
        assert_eq!(StreamName::new("public.user-123").schema(), Some("public"));
        assert_eq!(StreamName::new("user-123").schema(), None);
        assert_eq!(StreamName::new(".user-123").schema(), None);
    }
}
