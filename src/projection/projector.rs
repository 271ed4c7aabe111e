//! The projector: a single-writer cooperative loop folding streams into
//! state persisted alongside per-stream positions in the projection
//! registry. Multiple processes running the same projection coordinate
//! through the registry row's time-bounded lease.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};

use crate::error::Error;
use crate::event::{Event, RecordedEvent};
use crate::projection::gap::GapDetection;
use crate::projection::merged::MergedEventIterator;
use crate::projection::{Handlers, HandlerResult, ProjectionStore, ProjectorOptions, SourceStreams, Status};
use crate::stream::{Stream, StreamName};

/// Handler invoked per event; returning `Some` replaces the state.
pub type ProjectorHandler =
    Box<dyn Fn(Value, &RecordedEvent, &mut ProjectorContext) -> HandlerResult + Send + Sync>;

/// Produces the initial (and reset) state of a projection.
pub type InitCallback = Box<dyn Fn() -> Value + Send + Sync>;

/// Mini-API handed to handlers: the current stream name, a cooperative stop
/// switch and buffered event emission. Emission requests are flushed by the
/// projector after the handler returns.
pub struct ProjectorContext {
    stream_name: StreamName,
    projection_name: String,
    stopped: bool,
    links: Vec<(StreamName, Event)>,
}

impl ProjectorContext {
    /// Stream the current event was read from.
    pub fn stream_name(&self) -> &StreamName {
        &self.stream_name
    }

    /// Requests a cooperative stop after the current event.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Appends the event to the projection's own stream.
    pub fn emit(&mut self, event: Event) {
        let name = StreamName::new(self.projection_name.clone());
        self.links.push((name, event));
    }

    /// Appends the event to an arbitrary stream, creating it on first use.
    pub fn link_to(&mut self, stream_name: impl Into<StreamName>, event: Event) {
        self.links.push((stream_name.into(), event));
    }
}

/// Small LRU cache of stream names known to exist, so `link_to` skips the
/// existence probe on repeat targets.
pub(crate) struct StreamCache {
    entries: VecDeque<String>,
    capacity: usize,
}

impl StreamCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Marks the entry as most recently used; returns whether it was
    /// present.
    pub(crate) fn touch(&mut self, name: &str) -> bool {
        match self.entries.iter().position(|entry| entry == name) {
            Some(index) => {
                let entry = self.entries.remove(index).expect("index in range");
                self.entries.push_back(entry);
                true
            }
            None => false,
        }
    }

    pub(crate) fn roll_append(&mut self, name: String) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(name);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

pub struct Projector<ES>
where
    ES: ProjectionStore,
{
    store: ES,
    name: String,
    options: ProjectorOptions,
    gap_detection: Option<GapDetection>,
    init_callback: Option<InitCallback>,
    handlers: Option<Handlers<ProjectorHandler>>,
    sources: Option<SourceStreams>,
    state: Value,
    status: Status,
    stream_positions: BTreeMap<String, i64>,
    event_counter: usize,
    is_stopped: bool,
    last_lock_update: Option<DateTime<Utc>>,
    stream_cache: StreamCache,
}

impl<ES> Projector<ES>
where
    ES: ProjectionStore,
{
    pub(crate) fn new(store: ES, name: impl Into<String>, options: ProjectorOptions) -> Self {
        let stream_cache = StreamCache::new(options.cache_size);
        let gap_detection = options.gap_detection.clone();
        Self {
            store,
            name: name.into(),
            options,
            gap_detection,
            init_callback: None,
            handlers: None,
            sources: None,
            state: json!({}),
            status: Status::Idle,
            stream_positions: BTreeMap::new(),
            event_counter: 0,
            is_stopped: false,
            last_lock_update: None,
            stream_cache,
        }
    }

    /// Seeds the state; also re-applied by `reset`.
    pub fn init(mut self, callback: impl Fn() -> Value + Send + Sync + 'static) -> Result<Self, Error> {
        if self.init_callback.is_some() {
            return Err(Error::InvalidArgument(
                "projection already initialized".to_string(),
            ));
        }
        self.state = callback();
        self.init_callback = Some(Box::new(callback));
        Ok(self)
    }

    pub fn from_stream(self, stream_name: impl Into<StreamName>) -> Result<Self, Error> {
        self.set_sources(SourceStreams::Streams(vec![stream_name.into()]))
    }

    pub fn from_streams(self, stream_names: Vec<StreamName>) -> Result<Self, Error> {
        self.set_sources(SourceStreams::Streams(stream_names))
    }

    pub fn from_category(self, category: impl Into<String>) -> Result<Self, Error> {
        self.set_sources(SourceStreams::Categories(vec![category.into()]))
    }

    pub fn from_categories(self, categories: Vec<String>) -> Result<Self, Error> {
        self.set_sources(SourceStreams::Categories(categories))
    }

    pub fn from_all(self) -> Result<Self, Error> {
        self.set_sources(SourceStreams::All)
    }

    fn set_sources(mut self, sources: SourceStreams) -> Result<Self, Error> {
        if self.sources.is_some() {
            return Err(Error::InvalidArgument(
                "projection sources were already set".to_string(),
            ));
        }
        self.sources = Some(sources);
        Ok(self)
    }

    /// Registers one handler per event name.
    pub fn when(mut self, handlers: HashMap<String, ProjectorHandler>) -> Result<Self, Error> {
        if self.handlers.is_some() {
            return Err(Error::InvalidArgument(
                "projection handlers were already set".to_string(),
            ));
        }
        self.handlers = Some(Handlers::Named(handlers));
        Ok(self)
    }

    /// Registers a catch-all handler.
    pub fn when_any(
        mut self,
        handler: impl Fn(Value, &RecordedEvent, &mut ProjectorContext) -> HandlerResult
            + Send
            + Sync
            + 'static,
    ) -> Result<Self, Error> {
        if self.handlers.is_some() {
            return Err(Error::InvalidArgument(
                "projection handlers were already set".to_string(),
            ));
        }
        self.handlers = Some(Handlers::Any(Box::new(handler)));
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Runs the projection. With `keep_running` it polls for new events and
    /// remote control commands until stopped; otherwise it performs a single
    /// pass over the currently visible events.
    #[tracing::instrument(skip_all, fields(projection = %self.name), err)]
    pub async fn run(&mut self, keep_running: bool) -> Result<(), Error> {
        if self.handlers.as_ref().map_or(true, Handlers::is_empty) {
            return Err(Error::Runtime("No handlers configured".to_string()));
        }
        if self.sources.is_none() {
            return Err(Error::Runtime("No streams configured".to_string()));
        }

        match self.fetch_remote_status().await? {
            Status::Stopping => {
                self.stop().await?;
                return Ok(());
            }
            Status::Deleting => {
                self.delete(false).await?;
                return Ok(());
            }
            Status::DeletingInclEmittedEvents => {
                self.delete(true).await?;
                return Ok(());
            }
            Status::Resetting => self.reset().await?,
            _ => {}
        }

        if !self.store.projection_exists(&self.name).await? {
            self.store.create_projection(&self.name).await?;
        }
        self.acquire_lock().await?;
        self.prepare_stream_positions().await?;
        self.load().await?;
        self.is_stopped = false;

        let result = self.run_cycles(keep_running).await;
        let released = self.release_lock().await;
        result.and(released)
    }

    async fn run_cycles(&mut self, keep_running: bool) -> Result<(), Error> {
        loop {
            let completed = self.process_cycle().await?;
            if !completed {
                if let Some(gap) = self.gap_detection.as_ref() {
                    let sleep_ms = gap.sleep_ms();
                    if sleep_ms > 0 {
                        tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                    }
                }
                if let Some(gap) = self.gap_detection.as_mut() {
                    gap.track_retry();
                }
                self.persist().await?;
            } else {
                if let Some(gap) = self.gap_detection.as_mut() {
                    gap.reset_retries();
                }
                if self.event_counter == 0 {
                    tokio::time::sleep(std::time::Duration::from_micros(self.options.sleep)).await;
                    self.update_lock().await?;
                } else {
                    self.persist().await?;
                }
            }
            self.event_counter = 0;

            match self.fetch_remote_status().await? {
                Status::Stopping => self.stop().await?,
                Status::Deleting => self.delete(false).await?,
                Status::DeletingInclEmittedEvents => self.delete(true).await?,
                Status::Resetting => {
                    self.reset().await?;
                    if keep_running {
                        self.start_again().await?;
                    }
                }
                _ => {}
            }

            if !keep_running || self.is_stopped {
                break;
            }
            self.prepare_stream_positions().await?;
        }
        Ok(())
    }

    /// One pass over the merged streams. Returns `false` when the cycle was
    /// aborted by a retryable sequence gap.
    async fn process_cycle(&mut self) -> Result<bool, Error> {
        let mut sources = Vec::new();
        for (stream_name, position) in self.stream_positions.clone() {
            let name = StreamName::new(stream_name);
            match self
                .store
                .load(&name, position + 1, self.options.load_count, None)
                .await
            {
                Ok(iterator) => sources.push((name, iterator)),
                // The stream may have been deleted mid-cycle; skip it.
                Err(Error::StreamNotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }

        let mut merged = MergedEventIterator::new(sources);
        let mut completed = true;
        while let Some(item) = merged.next().await {
            let (stream_name, event) = item?;

            if let Some(hook) = self.options.signal_hook.clone() {
                if hook() {
                    self.is_stopped = true;
                    break;
                }
            }

            if let Some(gap) = self.gap_detection.as_ref() {
                let previous = self
                    .stream_positions
                    .get(stream_name.as_str())
                    .copied()
                    .unwrap_or(0);
                if gap.is_gap(previous, event.no) && gap.should_retry(Utc::now(), &event) {
                    completed = false;
                    break;
                }
            }

            self.stream_positions
                .insert(stream_name.as_str().to_string(), event.no);
            self.event_counter += 1;

            let mut ctx = ProjectorContext {
                stream_name: stream_name.clone(),
                projection_name: self.name.clone(),
                stopped: false,
                links: Vec::new(),
            };
            if let Some(handler) = self.handlers.as_ref().and_then(|h| h.for_event(&event.event_name)) {
                match handler(self.state.clone(), &event, &mut ctx) {
                    Ok(Some(new_state)) => self.state = new_state,
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(
                            projection = %self.name,
                            event_id = %event.event_id,
                            error = ?err,
                            "projection handler failed to handle event"
                        );
                        return Err(Error::Handler(err));
                    }
                }
            }
            let ProjectorContext { stopped, links, .. } = ctx;
            for (link_name, link_event) in links {
                self.link_to_stream(&link_name, link_event).await?;
            }
            if stopped {
                self.stop().await?;
            }

            if self.event_counter == self.options.persist_block_size {
                self.persist().await?;
                self.event_counter = 0;
                self.status = self.fetch_remote_status().await?;
                if !matches!(self.status, Status::Running | Status::Idle) {
                    self.is_stopped = true;
                }
            }
            if self.is_stopped {
                break;
            }
        }
        Ok(completed)
    }

    /// Flushes state and positions, stops the loop and records the idle
    /// status for other processes.
    pub async fn stop(&mut self) -> Result<(), Error> {
        self.persist().await?;
        self.is_stopped = true;
        self.store
            .update_projection_status(&self.name, Status::Idle)
            .await?;
        self.status = Status::Idle;
        Ok(())
    }

    /// Clears positions, re-seeds the state and deletes the emitted stream.
    pub async fn reset(&mut self) -> Result<(), Error> {
        self.stream_positions.clear();
        self.stream_cache.clear();
        self.state = self.initial_state();
        let position = self.positions_json();
        let state = self.state.clone();
        self.store
            .update_projection(&self.name, &position, &state, self.status)
            .await?;
        match self.store.delete(&StreamName::new(self.name.clone())).await {
            Ok(()) | Err(Error::StreamNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Removes the registry row; optionally deletes the emitted stream.
    pub async fn delete(&mut self, delete_emitted_events: bool) -> Result<(), Error> {
        self.store.delete_projection_row(&self.name).await?;
        if delete_emitted_events {
            match self.store.delete(&StreamName::new(self.name.clone())).await {
                Ok(()) | Err(Error::StreamNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        self.is_stopped = true;
        self.state = self.initial_state();
        self.stream_positions.clear();
        self.stream_cache.clear();
        Ok(())
    }

    async fn acquire_lock(&mut self) -> Result<(), Error> {
        let now = Utc::now();
        self.store
            .acquire_projection_lock(&self.name, now, now + self.lock_timeout())
            .await?;
        self.status = Status::Running;
        self.last_lock_update = Some(now);
        Ok(())
    }

    async fn release_lock(&mut self) -> Result<(), Error> {
        self.status = Status::Idle;
        self.store
            .release_projection_lock(&self.name, Status::Idle)
            .await
    }

    /// Refreshes the lease during idle cycles, rate limited by the
    /// configured threshold.
    async fn update_lock(&mut self) -> Result<(), Error> {
        let now = Utc::now();
        if !self.should_update_lock(now) {
            return Ok(());
        }
        self.store
            .renew_projection_lock(&self.name, now + self.lock_timeout())
            .await?;
        self.last_lock_update = Some(now);
        Ok(())
    }

    fn should_update_lock(&self, now: DateTime<Utc>) -> bool {
        if self.options.update_lock_threshold_ms == 0 {
            return true;
        }
        let threshold = Duration::milliseconds(self.options.update_lock_threshold_ms as i64);
        self.last_lock_update.map_or(true, |last| last + threshold <= now)
    }

    async fn start_again(&mut self) -> Result<(), Error> {
        self.is_stopped = false;
        let now = Utc::now();
        self.store
            .start_again_projection(&self.name, now + self.lock_timeout())
            .await?;
        self.status = Status::Running;
        self.last_lock_update = Some(now);
        Ok(())
    }

    async fn persist(&mut self) -> Result<(), Error> {
        let locked_until = Utc::now() + self.lock_timeout();
        let position = self.positions_json();
        let state = self.state.clone();
        self.store
            .persist_projection(&self.name, &position, &state, locked_until)
            .await
    }

    async fn load(&mut self) -> Result<(), Error> {
        if let Some((position, state)) = self.store.load_projection(&self.name).await? {
            if let Value::Object(positions) = position {
                for (stream, no) in positions {
                    if let Some(no) = no.as_i64() {
                        self.stream_positions.insert(stream, no);
                    }
                }
            }
            match &state {
                Value::Null => {}
                Value::Object(map) if map.is_empty() => {}
                _ => self.state = state,
            }
        }
        Ok(())
    }

    async fn prepare_stream_positions(&mut self) -> Result<(), Error> {
        let sources = self.sources.as_ref().expect("sources checked in run");
        let names = self.store.fetch_real_stream_names(sources).await?;
        for name in names {
            self.stream_positions
                .entry(name.as_str().to_string())
                .or_insert(0);
        }
        Ok(())
    }

    async fn fetch_remote_status(&self) -> Result<Status, Error> {
        Ok(self
            .store
            .fetch_projection_status(&self.name)
            .await?
            .unwrap_or(Status::Running))
    }

    async fn link_to_stream(&mut self, stream_name: &StreamName, event: Event) -> Result<(), Error> {
        if self.stream_cache.touch(stream_name.as_str()) {
            return self.store.append_to(stream_name, vec![event]).await;
        }
        self.stream_cache.roll_append(stream_name.as_str().to_string());
        if !self.store.has_stream(stream_name).await? {
            self.store.create(Stream::new(stream_name.clone())).await?;
        }
        self.store.append_to(stream_name, vec![event]).await
    }

    fn initial_state(&self) -> Value {
        self.init_callback
            .as_ref()
            .map(|callback| callback())
            .unwrap_or_else(|| json!({}))
    }

    fn positions_json(&self) -> Value {
        let mut map = Map::new();
        for (stream, no) in &self.stream_positions {
            map.insert(stream.clone(), Value::from(*no));
        }
        Value::Object(map)
    }

    fn lock_timeout(&self) -> Duration {
        Duration::milliseconds(self.options.lock_timeout_ms as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_stream_cache_rolls_out_the_least_recently_used_entry() {
        let mut cache = StreamCache::new(2);
        cache.roll_append("a".to_string());
        cache.roll_append("b".to_string());

        // Touching refreshes recency, so "b" is evicted instead of "a".
        assert!(cache.touch("a"));
        cache.roll_append("c".to_string());
        assert!(!cache.touch("b"));
        assert!(cache.touch("a"));
        assert!(cache.touch("c"));
    }

    #[test]
    fn a_zero_capacity_cache_still_holds_one_entry() {
        let mut cache = StreamCache::new(0);
        cache.roll_append("a".to_string());
        assert!(cache.touch("a"));
        cache.roll_append("b".to_string());
        assert!(!cache.touch("a"));
    }
}
