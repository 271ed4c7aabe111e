//! Projections: long-lived consumers folding streams into derived state,
//! coordinated across processes through the `projections` registry table.

pub mod gap;
pub mod manager;
mod merged;
pub mod projector;
pub mod query;
pub mod read_model;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use typed_builder::TypedBuilder;

use crate::error::{BoxDynError, Error};
use crate::projection::gap::GapDetection;
use crate::store::EventStore;
use crate::stream::StreamName;

/// Lifecycle states persisted in the projection registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Running,
    Stopping,
    Deleting,
    DeletingInclEmittedEvents,
    Resetting,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Deleting => "deleting",
            Status::DeletingInclEmittedEvents => "deleting_incl_emitted_events",
            Status::Resetting => "resetting",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "idle" => Ok(Status::Idle),
            "running" => Ok(Status::Running),
            "stopping" => Ok(Status::Stopping),
            "deleting" => Ok(Status::Deleting),
            "deleting_incl_emitted_events" => Ok(Status::DeletingInclEmittedEvents),
            "resetting" => Ok(Status::Resetting),
            other => Err(Error::UnexpectedValue(format!(
                "unknown projection status '{other}'"
            ))),
        }
    }
}

/// Which streams a projection folds.
#[derive(Debug, Clone)]
pub enum SourceStreams {
    /// Every stream in the registry except internal `$`-prefixed ones.
    All,
    Categories(Vec<String>),
    Streams(Vec<StreamName>),
}

/// Callback invoked between events when configured; returning `true` asks
/// the projector to stop cooperatively.
pub type SignalHook = Arc<dyn Fn() -> bool + Send + Sync>;

/// Tuning knobs for projectors and read model projectors.
#[derive(Clone, TypedBuilder)]
pub struct ProjectorOptions {
    /// Length of each lease renewal window, in milliseconds.
    #[builder(default = 1000)]
    pub lock_timeout_ms: u64,
    /// Idle-cycle sleep, in microseconds.
    #[builder(default = 100_000)]
    pub sleep: u64,
    /// Number of handled events between persistence checkpoints.
    #[builder(default = 1000)]
    pub persist_block_size: usize,
    /// Capacity of the emitted-stream existence cache.
    #[builder(default = 1000)]
    pub cache_size: usize,
    /// Minimum milliseconds between lease refreshes during idle cycles.
    /// Zero refreshes on every idle cycle.
    #[builder(default = 0)]
    pub update_lock_threshold_ms: u64,
    /// Maximum events loaded per stream per cycle. `None` is unbounded per
    /// cycle but still batch-paged by the iterator.
    #[builder(default)]
    pub load_count: Option<i64>,
    #[builder(default)]
    pub gap_detection: Option<GapDetection>,
    /// Per-event cooperative interrupt hook.
    #[builder(default)]
    pub signal_hook: Option<SignalHook>,
}

impl Default for ProjectorOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Result of one handler invocation; `Some` replaces the projection state.
pub type HandlerResult = Result<Option<Value>, BoxDynError>;

/// Either a catch-all handler or a map keyed by event name. Exactly one may
/// be configured per projection.
pub(crate) enum Handlers<F> {
    Any(F),
    Named(HashMap<String, F>),
}

impl<F> Handlers<F> {
    /// The handler responsible for an event, if any. A missing named handler
    /// is a no-op for that event.
    pub(crate) fn for_event(&self, event_name: &str) -> Option<&F> {
        match self {
            Handlers::Any(handler) => Some(handler),
            Handlers::Named(handlers) => handlers.get(event_name),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Handlers::Any(_) => false,
            Handlers::Named(handlers) => handlers.is_empty(),
        }
    }
}

/// Registry operations the projection engine needs beyond [`EventStore`].
/// Implemented by each dialect store over its `projections` table.
#[async_trait]
pub trait ProjectionStore: EventStore {
    /// Inserts the registry row if absent (idle, empty position and state,
    /// no lease).
    async fn create_projection(&self, name: &str) -> Result<(), Error>;

    async fn projection_exists(&self, name: &str) -> Result<bool, Error>;

    /// Claims the lease: succeeds only when the row is unlocked or the
    /// previous lease expired.
    async fn acquire_projection_lock(
        &self,
        name: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Extends the held lease; fails when the row no longer exists.
    async fn renew_projection_lock(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Re-enters the running state after a remote reset.
    async fn start_again_projection(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Clears the lease and records the closing status.
    async fn release_projection_lock(&self, name: &str, status: Status) -> Result<(), Error>;

    /// Checkpoint: stores position and state and extends the lease.
    async fn persist_projection(
        &self,
        name: &str,
        position: &Value,
        state: &Value,
        locked_until: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Rewrites position, state and status, leaving the lease untouched.
    async fn update_projection(
        &self,
        name: &str,
        position: &Value,
        state: &Value,
        status: Status,
    ) -> Result<(), Error>;

    /// Writes the status column only, returning the affected row count.
    async fn update_projection_status(&self, name: &str, status: Status) -> Result<u64, Error>;

    async fn delete_projection_row(&self, name: &str) -> Result<(), Error>;

    /// Persisted `(position, state)` of a projection, if the row exists.
    async fn load_projection(&self, name: &str) -> Result<Option<(Value, Value)>, Error>;

    async fn fetch_projection_status(&self, name: &str) -> Result<Option<Status>, Error>;

    /// Ordered page of projection names; `filter` is an exact match, or a
    /// regex when `regex` is set.
    async fn fetch_projection_names(
        &self,
        filter: Option<&str>,
        regex: bool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, Error>;

    /// Resolves a source declaration to concrete stream names.
    async fn fetch_real_stream_names(
        &self,
        sources: &SourceStreams,
    ) -> Result<Vec<StreamName>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            Status::Idle,
            Status::Running,
            Status::Stopping,
            Status::Deleting,
            Status::DeletingInclEmittedEvents,
            Status::Resetting,
        ] {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!("paused".parse::<Status>().is_err());
    }

    #[test]
    fn named_handlers_are_selected_by_event_name() {
        let mut map = HashMap::new();
        map.insert("user-registered".to_string(), 1);
        let handlers = Handlers::Named(map);
        assert_eq!(handlers.for_event("user-registered"), Some(&1));
        assert_eq!(handlers.for_event("other"), None);

        let any = Handlers::Any(2);
        assert_eq!(any.for_event("whatever"), Some(&2));
    }
}
