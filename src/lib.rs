//! SQL-backed event store with append-only streams, per-stream write locking
//! and resumable projections.
//!
//! Events are persisted into one table per stream, shaped by a pluggable
//! [`strategy::PersistenceStrategy`]; appends are guarded by a
//! [`lock::WriteLockStrategy`] over database session locks. Projections fold
//! one or more streams into derived state, coordinate across processes with
//! a lease in the `projections` table and detect sequence gaps caused by
//! concurrent transactions.

pub mod error;
pub mod event;
pub mod json;
pub mod lock;
pub mod matcher;
pub mod projection;
pub mod sql;
pub mod store;
pub mod strategy;
pub mod stream;

pub use error::Error;
pub use event::{Event, RecordedEvent};
pub use matcher::{FieldType, MetadataMatcher, Operator};
pub use projection::gap::GapDetection;
pub use projection::manager::ProjectionManager;
pub use projection::projector::{Projector, ProjectorContext};
pub use projection::query::{Query, QueryContext};
pub use projection::read_model::{ReadModel, ReadModelContext, ReadModelProjector};
pub use projection::{HandlerResult, ProjectionStore, ProjectorOptions, SignalHook, SourceStreams, Status};
pub use store::{EventIterator, EventStore};
pub use stream::{Stream, StreamName};

#[cfg(feature = "mysql")]
pub use store::mysql::{MySqlEventStore, MySqlEventStoreBuilder};
#[cfg(feature = "postgres")]
pub use store::postgres::{PgEventStore, PgEventStoreBuilder};
