//! Queries: one-shot projections without locking, persistence or emission.
//! They fold the currently visible events into transient state and return.

use std::collections::{BTreeMap, HashMap};

use serde_json::{json, Value};

use crate::error::Error;
use crate::event::RecordedEvent;
use crate::projection::merged::MergedEventIterator;
use crate::projection::{Handlers, HandlerResult, ProjectionStore, SignalHook, SourceStreams};
use crate::stream::StreamName;

/// Handler context: the current stream name and a stop switch.
pub struct QueryContext {
    stream_name: StreamName,
    stopped: bool,
}

impl QueryContext {
    pub fn stream_name(&self) -> &StreamName {
        &self.stream_name
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }
}

/// Handler invoked per event; returning `Some` replaces the state.
pub type QueryHandler =
    Box<dyn Fn(Value, &RecordedEvent, &mut QueryContext) -> HandlerResult + Send + Sync>;

pub struct Query<ES>
where
    ES: ProjectionStore,
{
    store: ES,
    init_callback: Option<Box<dyn Fn() -> Value + Send + Sync>>,
    handlers: Option<Handlers<QueryHandler>>,
    sources: Option<SourceStreams>,
    signal_hook: Option<SignalHook>,
    state: Value,
    stream_positions: BTreeMap<String, i64>,
    is_stopped: bool,
}

impl<ES> Query<ES>
where
    ES: ProjectionStore,
{
    pub(crate) fn new(store: ES) -> Self {
        Self {
            store,
            init_callback: None,
            handlers: None,
            sources: None,
            signal_hook: None,
            state: json!({}),
            stream_positions: BTreeMap::new(),
            is_stopped: false,
        }
    }

    /// Seeds the state; also re-applied by `reset`.
    pub fn init(mut self, callback: impl Fn() -> Value + Send + Sync + 'static) -> Result<Self, Error> {
        if self.init_callback.is_some() {
            return Err(Error::InvalidArgument("query already initialized".to_string()));
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
                "query sources were already set".to_string(),
            ));
        }
        self.sources = Some(sources);
        Ok(self)
    }

    pub fn when(mut self, handlers: HashMap<String, QueryHandler>) -> Result<Self, Error> {
        if self.handlers.is_some() {
            return Err(Error::InvalidArgument(
                "query handlers were already set".to_string(),
            ));
        }
        self.handlers = Some(Handlers::Named(handlers));
        Ok(self)
    }

    pub fn when_any(
        mut self,
        handler: impl Fn(Value, &RecordedEvent, &mut QueryContext) -> HandlerResult
            + Send
            + Sync
            + 'static,
    ) -> Result<Self, Error> {
        if self.handlers.is_some() {
            return Err(Error::InvalidArgument(
                "query handlers were already set".to_string(),
            ));
        }
        self.handlers = Some(Handlers::Any(Box::new(handler)));
        Ok(self)
    }

    pub fn with_signal_hook(mut self, hook: SignalHook) -> Self {
        self.signal_hook = Some(hook);
        self
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Folds the currently visible events and returns; the final state is
    /// available through [`Query::state`].
    pub async fn run(&mut self) -> Result<(), Error> {
        if self.handlers.as_ref().map_or(true, Handlers::is_empty) {
            return Err(Error::Runtime("No handlers configured".to_string()));
        }
        let Some(sources) = self.sources.as_ref() else {
            return Err(Error::Runtime("No streams configured".to_string()));
        };

        let names = self.store.fetch_real_stream_names(sources).await?;
        for name in names {
            self.stream_positions
                .entry(name.as_str().to_string())
                .or_insert(0);
        }
        self.is_stopped = false;

        let mut iterators = Vec::new();
        for (stream_name, position) in self.stream_positions.clone() {
            let name = StreamName::new(stream_name);
            match self.store.load(&name, position + 1, None, None).await {
                Ok(iterator) => iterators.push((name, iterator)),
                Err(Error::StreamNotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }

        let mut merged = MergedEventIterator::new(iterators);
        while let Some(item) = merged.next().await {
            let (stream_name, event) = item?;

            if let Some(hook) = self.signal_hook.clone() {
                if hook() {
                    break;
                }
            }

            self.stream_positions
                .insert(stream_name.as_str().to_string(), event.no);

            let mut ctx = QueryContext {
                stream_name: stream_name.clone(),
                stopped: false,
            };
            if let Some(handler) = self.handlers.as_ref().and_then(|h| h.for_event(&event.event_name)) {
                match handler(self.state.clone(), &event, &mut ctx) {
                    Ok(Some(new_state)) => self.state = new_state,
                    Ok(None) => {}
                    Err(err) => return Err(Error::Handler(err)),
                }
            }
            if ctx.stopped {
                self.is_stopped = true;
                break;
            }
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.is_stopped = true;
    }

    /// Clears positions and re-seeds the state for a fresh run.
    pub fn reset(&mut self) {
        self.stream_positions.clear();
        self.state = self
            .init_callback
            .as_ref()
            .map(|callback| callback())
            .unwrap_or_else(|| json!({}));
        self.is_stopped = false;
    }
}
