//! Read model projections: the same cooperative loop as the projector, but
//! folding events into an external read model instead of emitting streams.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};

use crate::error::{BoxDynError, Error};
use crate::event::RecordedEvent;
use crate::projection::gap::GapDetection;
use crate::projection::merged::MergedEventIterator;
use crate::projection::{Handlers, HandlerResult, ProjectionStore, ProjectorOptions, SourceStreams, Status};
use crate::stream::StreamName;

/// External storage a read model projection writes into. Handlers buffer
/// their writes on the model; `persist` flushes them at each checkpoint.
#[async_trait]
pub trait ReadModel: Send {
    async fn init(&mut self) -> Result<(), BoxDynError>;
    async fn is_initialized(&mut self) -> Result<bool, BoxDynError>;
    async fn reset(&mut self) -> Result<(), BoxDynError>;
    async fn delete(&mut self) -> Result<(), BoxDynError>;
    async fn persist(&mut self) -> Result<(), BoxDynError>;
}

/// Handler context: current stream name, stop switch and mutable access to
/// the read model for buffering writes.
pub struct ReadModelContext<'a, R> {
    stream_name: StreamName,
    read_model: &'a mut R,
    stopped: bool,
}

impl<'a, R> ReadModelContext<'a, R> {
    pub fn stream_name(&self) -> &StreamName {
        &self.stream_name
    }

    pub fn read_model(&mut self) -> &mut R {
        self.read_model
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }
}

/// Handler invoked per event; returning `Some` replaces the state.
pub type ReadModelHandler<R> = Box<
    dyn for<'a> Fn(Value, &RecordedEvent, &mut ReadModelContext<'a, R>) -> HandlerResult
        + Send
        + Sync,
>;

pub struct ReadModelProjector<ES, R>
where
    ES: ProjectionStore,
    R: ReadModel,
{
    store: ES,
    read_model: R,
    name: String,
    options: ProjectorOptions,
    gap_detection: Option<GapDetection>,
    init_callback: Option<Box<dyn Fn() -> Value + Send + Sync>>,
    handlers: Option<Handlers<ReadModelHandler<R>>>,
    sources: Option<SourceStreams>,
    state: Value,
    status: Status,
    stream_positions: BTreeMap<String, i64>,
    event_counter: usize,
    cycle_consumed_events: bool,
    is_stopped: bool,
    last_lock_update: Option<DateTime<Utc>>,
}

impl<ES, R> ReadModelProjector<ES, R>
where
    ES: ProjectionStore,
    R: ReadModel,
{
    pub(crate) fn new(
        store: ES,
        name: impl Into<String>,
        read_model: R,
        options: ProjectorOptions,
    ) -> Self {
        let gap_detection = options.gap_detection.clone();
        Self {
            store,
            read_model,
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
            cycle_consumed_events: false,
            is_stopped: false,
            last_lock_update: None,
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

    pub fn when(mut self, handlers: HashMap<String, ReadModelHandler<R>>) -> Result<Self, Error> {
        if self.handlers.is_some() {
            return Err(Error::InvalidArgument(
                "projection handlers were already set".to_string(),
            ));
        }
        self.handlers = Some(Handlers::Named(handlers));
        Ok(self)
    }

    pub fn when_any(
        mut self,
        handler: impl for<'a> Fn(Value, &RecordedEvent, &mut ReadModelContext<'a, R>) -> HandlerResult
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

    pub fn read_model(&mut self) -> &mut R {
        &mut self.read_model
    }

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
        if !self
            .read_model
            .is_initialized()
            .await
            .map_err(Error::ReadModel)?
        {
            self.read_model.init().await.map_err(Error::ReadModel)?;
        }
        self.prepare_stream_positions().await?;
        self.load().await?;
        self.is_stopped = false;

        let result = self.run_cycles(keep_running).await;
        // A read model that observed events keeps advertising itself as
        // running, even though the lease itself is cleared.
        let closing_status = if self.cycle_consumed_events {
            Status::Running
        } else {
            Status::Idle
        };
        let released = self
            .store
            .release_projection_lock(&self.name, closing_status)
            .await;
        result.and(released)
    }

    async fn run_cycles(&mut self, keep_running: bool) -> Result<(), Error> {
        loop {
            let completed = self.process_cycle().await?;
            self.cycle_consumed_events = self.event_counter > 0;
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

            let mut stopped = false;
            if let Some(handler) = self.handlers.as_ref().and_then(|h| h.for_event(&event.event_name)) {
                let mut ctx = ReadModelContext {
                    stream_name: stream_name.clone(),
                    read_model: &mut self.read_model,
                    stopped: false,
                };
                match handler(self.state.clone(), &event, &mut ctx) {
                    Ok(Some(new_state)) => {
                        stopped = ctx.stopped;
                        self.state = new_state;
                    }
                    Ok(None) => stopped = ctx.stopped,
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

    pub async fn stop(&mut self) -> Result<(), Error> {
        self.persist().await?;
        self.is_stopped = true;
        self.store
            .update_projection_status(&self.name, Status::Idle)
            .await?;
        self.status = Status::Idle;
        Ok(())
    }

    /// Clears positions, re-seeds the state and resets the read model.
    pub async fn reset(&mut self) -> Result<(), Error> {
        self.stream_positions.clear();
        self.read_model.reset().await.map_err(Error::ReadModel)?;
        self.state = self.initial_state();
        let position = self.positions_json();
        let state = self.state.clone();
        self.store
            .update_projection(&self.name, &position, &state, self.status)
            .await
    }

    /// Removes the registry row; optionally deletes the read model.
    pub async fn delete(&mut self, delete_read_model: bool) -> Result<(), Error> {
        self.store.delete_projection_row(&self.name).await?;
        if delete_read_model {
            self.read_model.delete().await.map_err(Error::ReadModel)?;
        }
        self.is_stopped = true;
        self.state = self.initial_state();
        self.stream_positions.clear();
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

    /// Flushes the read model first, then the registry checkpoint.
    async fn persist(&mut self) -> Result<(), Error> {
        self.read_model.persist().await.map_err(Error::ReadModel)?;
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
