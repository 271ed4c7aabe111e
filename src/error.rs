use crate::stream::StreamName;

/// Boxed error returned by user supplied projection handlers and read models.
pub type BoxDynError = Box<dyn std::error::Error + Send + Sync>;

/// All the ways an event store or projection operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `create` was called for a stream that already has a registry row.
    #[error("stream '{0}' already exists")]
    StreamExistsAlready(StreamName),
    /// The targeted stream has no registry row or no backing table.
    #[error("stream '{0}' not found")]
    StreamNotFound(StreamName),
    /// A unique constraint fired on append, or the write lock could not be
    /// acquired.
    #[error("concurrency exception: {0}")]
    Concurrency(String),
    /// An aggregate stream strategy was given an event without an
    /// `_aggregate_version` metadata entry.
    #[error("missing '_aggregate_version' in event metadata")]
    AggregateVersionMissing,
    /// Client-detected misuse: bad regex pattern, negative lock timeout,
    /// conflicting projection configuration and the like.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A metadata matcher referenced a field the database cannot resolve.
    #[error("unexpected value: {0}")]
    UnexpectedValue(String),
    /// The projection registry has no row with the given name.
    #[error("projection '{0}' not found")]
    ProjectionNotFound(String),
    /// The projection registry row could not be created.
    #[error("projection '{0}' was not created")]
    ProjectionNotCreated(String),
    /// Any other database failure (with the dialect error code in the
    /// message), or a broken invariant such as a lost projection lease.
    #[error("runtime error: {0}")]
    Runtime(String),
    /// Sql error outside of a classified operation (pool, connection, ...).
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    /// Serialization/deserialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// A projection handler returned an error.
    #[error("projection handler failed: {0}")]
    Handler(#[source] BoxDynError),
    /// A read model operation returned an error.
    #[error("read model operation failed: {0}")]
    ReadModel(#[source] BoxDynError),
}

/// Maps a database error to [`Error::Runtime`], keeping everything else as a
/// plain sqlx error.
pub(crate) fn runtime_error(err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::Database(db) => Error::Runtime(format!(
            "SQLSTATE[{}]: {}",
            db.code().unwrap_or_else(|| "HY000".into()),
            db.message()
        )),
        other => Error::Sqlx(other),
    }
}
