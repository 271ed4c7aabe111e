//! The event store surface and its per-dialect implementations.

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};

use crate::error::Error;
use crate::event::{Event, RecordedEvent};
use crate::matcher::MetadataMatcher;
use crate::stream::{Stream as EventStream, StreamName};

/// Default page size for lazy stream iteration.
pub const DEFAULT_LOAD_BATCH_SIZE: i64 = 10_000;
/// Default page size for name enumeration.
pub const DEFAULT_FETCH_LIMIT: i64 = 20;

pub(crate) const DEFAULT_EVENT_STREAMS_TABLE: &str = "event_streams";
pub(crate) const DEFAULT_PROJECTIONS_TABLE: &str = "projections";

/// An event store persisting immutable events in append-only streams.
///
/// Implementations serialize rows through their configured
/// [`PersistenceStrategy`](crate::strategy::PersistenceStrategy), guard
/// appends with a [`WriteLockStrategy`](crate::lock::WriteLockStrategy) and
/// keep one registry row per stream in the `event_streams` table.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Creates the registry row and the stream table, then appends the
    /// initial events. On failure the table and the registry row are removed
    /// again before the error surfaces.
    async fn create(&self, stream: EventStream) -> Result<(), Error>;

    /// Appends an ordered batch of events. An empty batch is a no-op.
    async fn append_to(&self, stream_name: &StreamName, events: Vec<Event>) -> Result<(), Error>;

    /// Loads events with `no >= from_number` in ascending order, lazily
    /// paged. `count` caps the total number of yielded events.
    async fn load(
        &self,
        stream_name: &StreamName,
        from_number: i64,
        count: Option<i64>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventIterator, Error>;

    /// Loads events with `no <= from_number` in descending order.
    /// `from_number` defaults to the maximum sequence number.
    async fn load_reverse(
        &self,
        stream_name: &StreamName,
        from_number: Option<i64>,
        count: Option<i64>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventIterator, Error>;

    /// Removes the registry row and drops the stream table.
    async fn delete(&self, stream_name: &StreamName) -> Result<(), Error>;

    async fn has_stream(&self, stream_name: &StreamName) -> Result<bool, Error>;

    async fn fetch_stream_metadata(
        &self,
        stream_name: &StreamName,
    ) -> Result<Map<String, Value>, Error>;

    async fn update_stream_metadata(
        &self,
        stream_name: &StreamName,
        new_metadata: Map<String, Value>,
    ) -> Result<(), Error>;

    /// Ordered page of logical stream names. `filter` is an exact match on
    /// the name; `matcher` filters on the stream metadata.
    async fn fetch_stream_names(
        &self,
        filter: Option<&str>,
        matcher: Option<&MetadataMatcher>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StreamName>, Error>;

    /// Like [`EventStore::fetch_stream_names`] with a regex name filter. The
    /// pattern is validated client-side before the database sees it.
    async fn fetch_stream_names_regex(
        &self,
        pattern: &str,
        matcher: Option<&MetadataMatcher>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StreamName>, Error>;

    async fn fetch_category_names(
        &self,
        filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, Error>;

    async fn fetch_category_names_regex(
        &self,
        pattern: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, Error>;
}

/// Lazily paged sequence of recorded events.
///
/// Batches are fetched with bounded selects and the cursor advances by
/// re-binding the range start to the last seen sequence number, so dropping
/// the iterator early never buffers more than one page.
pub struct EventIterator {
    inner: BoxStream<'static, Result<RecordedEvent, Error>>,
    total: Option<i64>,
}

impl EventIterator {
    pub(crate) fn new(inner: BoxStream<'static, Result<RecordedEvent, Error>>) -> Self {
        Self { inner, total: None }
    }

    pub(crate) fn with_total(mut self, total: i64) -> Self {
        self.total = Some(total);
        self
    }

    pub(crate) fn empty() -> Self {
        Self::new(futures::stream::iter(Vec::new()).boxed()).with_total(0)
    }

    #[cfg(test)]
    pub(crate) fn from_records(records: Vec<RecordedEvent>) -> Self {
        Self::new(futures::stream::iter(records.into_iter().map(Ok)).boxed())
    }

    pub async fn next(&mut self) -> Option<Result<RecordedEvent, Error>> {
        self.inner.next().await
    }

    /// Number of matching events, when the implementation probed for it
    /// (reverse loads do, to short-circuit empty results).
    pub fn total(&self) -> Option<i64> {
        self.total
    }
}

impl Stream for EventIterator {
    type Item = Result<RecordedEvent, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}

/// Validates a user supplied regex pattern before it reaches the database.
pub(crate) fn validate_regex(pattern: &str) -> Result<(), Error> {
    if pattern.is_empty() {
        return Err(Error::InvalidArgument("empty regex pattern".to_string()));
    }
    regex::Regex::new(pattern)
        .map(|_| ())
        .map_err(|err| Error::InvalidArgument(format!("invalid regex pattern: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_patterns_are_validated_client_side() {
        assert!(validate_regex("^user-").is_ok());
        assert!(matches!(validate_regex(""), Err(Error::InvalidArgument(_))));
        assert!(matches!(validate_regex("("), Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn the_empty_iterator_yields_nothing() {
        let mut iterator = EventIterator::empty();
        assert_eq!(iterator.total(), Some(0));
        assert!(iterator.next().await.is_none());
    }
}
