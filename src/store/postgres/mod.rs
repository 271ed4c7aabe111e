//! Postgres event store.

pub use builder::PgEventStoreBuilder;

mod builder;
mod iterator;
pub mod migrations;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Connection, PgConnection, Pool, Postgres, Row};

use crate::error::{runtime_error, Error};
use crate::event::Event;
use crate::lock::{write_lock_name, WriteLockStrategy};
use crate::matcher::MetadataMatcher;
use crate::projection::{ProjectionStore, SourceStreams, Status};
use crate::sql::{
    build_stream_query, insert_sql, matcher_conditions, Dialect, ProjectionStatements, SqlValue,
    StoreStatements,
};
use crate::store::{validate_regex, EventIterator, EventStore};
use crate::strategy::PersistenceStrategy;
use crate::stream::{Stream, StreamName};

use iterator::{fetch_page, paged_stream, PageSpec};

const DIALECT: Dialect = Dialect::Postgres;

const SQLSTATE_UNDEFINED_TABLE: &str = "42P01";
const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";
const SQLSTATE_UNDEFINED_COLUMN: &str = "42703";
const SQLSTATE_INVALID_REGEX: &str = "2201B";

/// Postgres implementation of the [`EventStore`].
///
/// The store is protected by an [`Arc`] that allows it to be cloneable still
/// having the same memory reference.
pub struct PgEventStore {
    inner: Arc<InnerPgStore>,
}

pub(super) struct InnerPgStore {
    pool: Pool<Postgres>,
    strategy: Box<dyn PersistenceStrategy>,
    write_lock: Box<dyn WriteLockStrategy<PgConnection>>,
    event_streams_table: String,
    projections_table: String,
    load_batch_size: i64,
    disable_transaction_handling: bool,
    statements: StoreStatements,
    projection_statements: ProjectionStatements,
}

impl Clone for PgEventStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for PgEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgEventStore")
            .field("event_streams_table", &self.inner.event_streams_table)
            .field("load_batch_size", &self.inner.load_batch_size)
            .finish()
    }
}

impl PgEventStore {
    pub fn builder(pool: Pool<Postgres>) -> PgEventStoreBuilder {
        PgEventStoreBuilder::new(pool)
    }

    pub(super) fn from_inner(inner: InnerPgStore) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.inner.pool
    }

    async fn insert_stream_row(
        &self,
        name: &StreamName,
        table: &str,
        metadata: &Map<String, Value>,
    ) -> Result<(), Error> {
        let result = sqlx::query(&self.inner.statements.insert_stream)
            .bind(name.as_str())
            .bind(table)
            .bind(Json(Value::Object(metadata.clone())))
            .bind(name.category())
            .execute(&self.inner.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(SQLSTATE_UNIQUE_VIOLATION) =>
            {
                Err(Error::StreamExistsAlready(name.clone()))
            }
            Err(err) => Err(runtime_error(err)),
        }
    }

    async fn create_schema_and_append(
        &self,
        name: &StreamName,
        table: &str,
        events: Vec<Event>,
    ) -> Result<(), Error> {
        for statement in self.inner.strategy.create_schema(table) {
            sqlx::query(&statement)
                .execute(&self.inner.pool)
                .await
                .map_err(runtime_error)?;
        }
        self.append_to(name, events).await
    }

    async fn insert_events(
        &self,
        conn: &mut PgConnection,
        sql: &str,
        values: Vec<SqlValue>,
    ) -> Result<(), sqlx::Error> {
        if self.inner.disable_transaction_handling {
            bind_values(sqlx::query(sql), values)
                .execute(&mut *conn)
                .await?;
            return Ok(());
        }
        let mut tx = conn.begin().await?;
        bind_values(sqlx::query(sql), values)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    async fn remove_stream_and_table(
        &self,
        conn: &mut PgConnection,
        stream_name: &StreamName,
        drop_sql: &str,
    ) -> Result<(), Error> {
        let result = sqlx::query(&self.inner.statements.delete_stream)
            .bind(stream_name.as_str())
            .execute(&mut *conn)
            .await
            .map_err(runtime_error)?;
        if result.rows_affected() == 0 {
            return Err(Error::StreamNotFound(stream_name.clone()));
        }
        sqlx::query(drop_sql)
            .execute(&mut *conn)
            .await
            .map_err(runtime_error)?;
        Ok(())
    }

    async fn stream_names_page(
        &self,
        conditions: Vec<String>,
        params: Vec<SqlValue>,
        next_index: usize,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StreamName>, Error> {
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT real_stream_name FROM {}{} ORDER BY real_stream_name ASC LIMIT {} OFFSET {}",
            self.inner.event_streams_table,
            where_clause,
            DIALECT.placeholder(next_index),
            DIALECT.placeholder(next_index + 1)
        );
        let rows = bind_values(sqlx::query(&sql), params)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.inner.pool)
            .await
            .map_err(classify_enumeration_error)?;
        rows.into_iter()
            .map(|row| Ok(StreamName::new(row.try_get::<String, _>(0)?)))
            .collect()
    }

    async fn category_names_page(
        &self,
        condition: Option<(String, SqlValue)>,
        next_index: usize,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, Error> {
        let (extra, params) = match condition {
            Some((condition, param)) => (format!(" AND {condition}"), vec![param]),
            None => (String::new(), Vec::new()),
        };
        let sql = format!(
            "SELECT category FROM {} WHERE category IS NOT NULL{} \
             GROUP BY category ORDER BY category ASC LIMIT {} OFFSET {}",
            self.inner.event_streams_table,
            extra,
            DIALECT.placeholder(next_index),
            DIALECT.placeholder(next_index + 1)
        );
        let rows = bind_values(sqlx::query(&sql), params)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>(0).map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    #[tracing::instrument(skip_all, fields(stream = %stream.name), err)]
    async fn create(&self, stream: Stream) -> Result<(), Error> {
        let Stream {
            name,
            metadata,
            events,
        } = stream;
        let table = self.inner.strategy.table_name(&name);
        self.insert_stream_row(&name, &table, &metadata).await?;

        if let Err(err) = self.create_schema_and_append(&name, &table, events).await {
            let drop_sql = format!("DROP TABLE IF EXISTS {}", DIALECT.quote(&table));
            let _ = sqlx::query(&drop_sql).execute(&self.inner.pool).await;
            let _ = sqlx::query(&self.inner.statements.delete_stream)
                .bind(name.as_str())
                .execute(&self.inner.pool)
                .await;
            return Err(err);
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(stream = %stream_name, events = events.len()), err)]
    async fn append_to(&self, stream_name: &StreamName, events: Vec<Event>) -> Result<(), Error> {
        if events.is_empty() {
            return Ok(());
        }
        let inner = &self.inner;
        let values = inner.strategy.prepare_data(&events)?;
        let table = inner.strategy.table_name(stream_name);
        let sql = insert_sql(DIALECT, &table, inner.strategy.column_names(), events.len());

        let mut conn = inner.pool.acquire().await?;
        let lock_name = write_lock_name(&table);
        if !inner.write_lock.acquire(&mut *conn, &lock_name).await? {
            return Err(Error::Concurrency(format!(
                "failed to acquire write lock for stream '{stream_name}'"
            )));
        }
        let result = self.insert_events(&mut *conn, &sql, values).await;
        let _ = inner.write_lock.release(&mut *conn, &lock_name).await;

        result.map_err(|err| classify_append_error(err, stream_name))
    }

    async fn load(
        &self,
        stream_name: &StreamName,
        from_number: i64,
        count: Option<i64>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventIterator, Error> {
        if count == Some(0) {
            return Ok(EventIterator::empty());
        }
        let inner = &self.inner;
        let table = inner.strategy.table_name(stream_name);
        let query = build_stream_query(
            DIALECT,
            &table,
            matcher,
            inner.strategy.indexed_metadata_fields(),
            None,
            false,
        )?;

        let first_limit = count
            .unwrap_or(inner.load_batch_size)
            .min(inner.load_batch_size);
        let first = fetch_page(
            &inner.pool,
            &query.select_sql,
            &query.params,
            from_number,
            first_limit,
        )
        .await
        .map_err(|err| classify_load_error(err, stream_name))?;

        let spec = PageSpec {
            pool: inner.pool.clone(),
            select_sql: query.select_sql,
            params: query.params,
            batch_size: inner.load_batch_size,
            count,
            reverse: false,
        };
        Ok(EventIterator::new(paged_stream(spec, first, first_limit)))
    }

    async fn load_reverse(
        &self,
        stream_name: &StreamName,
        from_number: Option<i64>,
        count: Option<i64>,
        matcher: Option<&MetadataMatcher>,
    ) -> Result<EventIterator, Error> {
        if count == Some(0) {
            return Ok(EventIterator::empty());
        }
        let inner = &self.inner;
        let from_number = from_number.unwrap_or(i64::MAX);
        let table = inner.strategy.table_name(stream_name);
        let query = build_stream_query(
            DIALECT,
            &table,
            matcher,
            inner.strategy.indexed_metadata_fields(),
            None,
            true,
        )?;

        let row = bind_values(sqlx::query(&query.count_sql), query.params.clone())
            .bind(from_number)
            .fetch_one(&inner.pool)
            .await
            .map_err(|err| classify_load_error(err, stream_name))?;
        let db_count: i64 = row.try_get(0)?;
        let total = count.map_or(db_count, |count| db_count.min(count));
        if total == 0 {
            return Ok(EventIterator::empty());
        }

        let first_limit = count
            .unwrap_or(inner.load_batch_size)
            .min(inner.load_batch_size);
        let first = fetch_page(
            &inner.pool,
            &query.select_sql,
            &query.params,
            from_number,
            first_limit,
        )
        .await
        .map_err(|err| classify_load_error(err, stream_name))?;

        let spec = PageSpec {
            pool: inner.pool.clone(),
            select_sql: query.select_sql,
            params: query.params,
            batch_size: inner.load_batch_size,
            count,
            reverse: true,
        };
        Ok(EventIterator::new(paged_stream(spec, first, first_limit)).with_total(total))
    }

    #[tracing::instrument(skip_all, fields(stream = %stream_name), err)]
    async fn delete(&self, stream_name: &StreamName) -> Result<(), Error> {
        let table = self.inner.strategy.table_name(stream_name);
        let drop_sql = format!("DROP TABLE IF EXISTS {}", DIALECT.quote(&table));

        let mut conn = self.inner.pool.acquire().await?;
        if self.inner.disable_transaction_handling {
            return self
                .remove_stream_and_table(&mut *conn, stream_name, &drop_sql)
                .await;
        }
        let mut tx = conn.begin().await?;
        self.remove_stream_and_table(&mut *tx, stream_name, &drop_sql)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn has_stream(&self, stream_name: &StreamName) -> Result<bool, Error> {
        let row = sqlx::query(&self.inner.statements.has_stream)
            .bind(stream_name.as_str())
            .fetch_optional(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        Ok(row.is_some())
    }

    async fn fetch_stream_metadata(
        &self,
        stream_name: &StreamName,
    ) -> Result<Map<String, Value>, Error> {
        let row = sqlx::query(&self.inner.statements.fetch_metadata)
            .bind(stream_name.as_str())
            .fetch_optional(&self.inner.pool)
            .await
            .map_err(runtime_error)?
            .ok_or_else(|| Error::StreamNotFound(stream_name.clone()))?;
        let metadata: Value = row.try_get("metadata")?;
        match metadata {
            Value::Object(map) => Ok(map),
            other => Err(Error::UnexpectedValue(format!(
                "stream metadata is not a JSON object: {other}"
            ))),
        }
    }

    async fn update_stream_metadata(
        &self,
        stream_name: &StreamName,
        new_metadata: Map<String, Value>,
    ) -> Result<(), Error> {
        let result = sqlx::query(&self.inner.statements.update_metadata)
            .bind(Json(Value::Object(new_metadata)))
            .bind(stream_name.as_str())
            .execute(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        if result.rows_affected() != 1 {
            return Err(Error::StreamNotFound(stream_name.clone()));
        }
        Ok(())
    }

    async fn fetch_stream_names(
        &self,
        filter: Option<&str>,
        matcher: Option<&MetadataMatcher>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StreamName>, Error> {
        let mut next_index = 1;
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        if let Some(filter) = filter {
            conditions.push(format!(
                "real_stream_name = {}",
                DIALECT.placeholder(next_index)
            ));
            params.push(SqlValue::Text(filter.to_string()));
            next_index += 1;
        }
        if let Some(matcher) = matcher {
            let clause = matcher_conditions(DIALECT, matcher, None, &mut next_index)?;
            conditions.extend(clause.conditions);
            params.extend(clause.params);
        }
        self.stream_names_page(conditions, params, next_index, limit, offset)
            .await
    }

    async fn fetch_stream_names_regex(
        &self,
        pattern: &str,
        matcher: Option<&MetadataMatcher>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StreamName>, Error> {
        validate_regex(pattern)?;
        let mut next_index = 2;
        let mut conditions = vec![format!(
            "real_stream_name {} {}",
            DIALECT.regex_operator(),
            DIALECT.placeholder(1)
        )];
        let mut params = vec![SqlValue::Text(pattern.to_string())];
        if let Some(matcher) = matcher {
            let clause = matcher_conditions(DIALECT, matcher, None, &mut next_index)?;
            conditions.extend(clause.conditions);
            params.extend(clause.params);
        }
        self.stream_names_page(conditions, params, next_index, limit, offset)
            .await
    }

    async fn fetch_category_names(
        &self,
        filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, Error> {
        let condition = filter.map(|filter| {
            (
                format!("category = {}", DIALECT.placeholder(1)),
                SqlValue::Text(filter.to_string()),
            )
        });
        let next_index = if condition.is_some() { 2 } else { 1 };
        self.category_names_page(condition, next_index, limit, offset)
            .await
    }

    async fn fetch_category_names_regex(
        &self,
        pattern: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, Error> {
        validate_regex(pattern)?;
        let condition = Some((
            format!("category {} {}", DIALECT.regex_operator(), DIALECT.placeholder(1)),
            SqlValue::Text(pattern.to_string()),
        ));
        self.category_names_page(condition, 2, limit, offset).await
    }
}

#[async_trait]
impl ProjectionStore for PgEventStore {
    async fn create_projection(&self, name: &str) -> Result<(), Error> {
        sqlx::query(&self.inner.projection_statements.create)
            .bind(name)
            .bind(Json(json!({})))
            .bind(Json(json!({})))
            .bind(Status::Idle.as_str())
            .execute(&self.inner.pool)
            .await
            .map_err(|_| Error::ProjectionNotCreated(name.to_string()))?;
        Ok(())
    }

    async fn projection_exists(&self, name: &str) -> Result<bool, Error> {
        let row = sqlx::query(&self.inner.projection_statements.exists)
            .bind(name)
            .fetch_optional(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        Ok(row.is_some())
    }

    async fn acquire_projection_lock(
        &self,
        name: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<(), Error> {
        let result = sqlx::query(&self.inner.projection_statements.acquire_lock)
            .bind(locked_until)
            .bind(Status::Running.as_str())
            .bind(name)
            .bind(now)
            .execute(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        if result.rows_affected() != 1 {
            return Err(Error::Runtime(
                "Another projection process is already running".to_string(),
            ));
        }
        Ok(())
    }

    async fn renew_projection_lock(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
    ) -> Result<(), Error> {
        let result = sqlx::query(&self.inner.projection_statements.renew_lock)
            .bind(locked_until)
            .bind(name)
            .execute(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        if result.rows_affected() != 1 {
            return Err(Error::Runtime(format!(
                "unable to renew the lock for projection '{name}'"
            )));
        }
        Ok(())
    }

    async fn start_again_projection(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(&self.inner.projection_statements.start_again)
            .bind(Status::Running.as_str())
            .bind(locked_until)
            .bind(name)
            .execute(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        Ok(())
    }

    async fn release_projection_lock(&self, name: &str, status: Status) -> Result<(), Error> {
        sqlx::query(&self.inner.projection_statements.release_lock)
            .bind(status.as_str())
            .bind(name)
            .execute(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        Ok(())
    }

    async fn persist_projection(
        &self,
        name: &str,
        position: &Value,
        state: &Value,
        locked_until: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(&self.inner.projection_statements.persist)
            .bind(Json(position.clone()))
            .bind(Json(state.clone()))
            .bind(locked_until)
            .bind(name)
            .execute(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        Ok(())
    }

    async fn update_projection(
        &self,
        name: &str,
        position: &Value,
        state: &Value,
        status: Status,
    ) -> Result<(), Error> {
        sqlx::query(&self.inner.projection_statements.update)
            .bind(Json(position.clone()))
            .bind(Json(state.clone()))
            .bind(status.as_str())
            .bind(name)
            .execute(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        Ok(())
    }

    async fn update_projection_status(&self, name: &str, status: Status) -> Result<u64, Error> {
        let result = sqlx::query(&self.inner.projection_statements.update_status)
            .bind(status.as_str())
            .bind(name)
            .execute(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_projection_row(&self, name: &str) -> Result<(), Error> {
        sqlx::query(&self.inner.projection_statements.delete)
            .bind(name)
            .execute(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        Ok(())
    }

    async fn load_projection(&self, name: &str) -> Result<Option<(Value, Value)>, Error> {
        let row = sqlx::query(&self.inner.projection_statements.load)
            .bind(name)
            .fetch_optional(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        match row {
            Some(row) => {
                let position: Option<Json<Value>> = row.try_get("position")?;
                let state: Option<Json<Value>> = row.try_get("state")?;
                Ok(Some((
                    position.map_or_else(|| json!({}), |json| json.0),
                    state.map_or_else(|| json!({}), |json| json.0),
                )))
            }
            None => Ok(None),
        }
    }

    async fn fetch_projection_status(&self, name: &str) -> Result<Option<Status>, Error> {
        let row = sqlx::query(&self.inner.projection_statements.fetch_status)
            .bind(name)
            .fetch_optional(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        match row {
            Some(row) => row.try_get::<String, _>("status")?.parse().map(Some),
            None => Ok(None),
        }
    }

    async fn fetch_projection_names(
        &self,
        filter: Option<&str>,
        regex: bool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, Error> {
        let mut next_index = 1;
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        if let Some(filter) = filter {
            let operator = if regex { DIALECT.regex_operator() } else { "=" };
            conditions.push(format!("name {operator} {}", DIALECT.placeholder(next_index)));
            params.push(SqlValue::Text(filter.to_string()));
            next_index += 1;
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT name FROM {}{where_clause} ORDER BY name ASC LIMIT {} OFFSET {}",
            self.inner.projections_table,
            DIALECT.placeholder(next_index),
            DIALECT.placeholder(next_index + 1)
        );
        let rows = bind_values(sqlx::query(&sql), params)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.inner.pool)
            .await
            .map_err(classify_projection_names_error)?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>(0).map_err(Error::from))
            .collect()
    }

    async fn fetch_real_stream_names(
        &self,
        sources: &SourceStreams,
    ) -> Result<Vec<StreamName>, Error> {
        match sources {
            SourceStreams::Streams(streams) => Ok(streams.clone()),
            SourceStreams::All => {
                let rows = sqlx::query(&self.inner.statements.non_internal_stream_names)
                    .fetch_all(&self.inner.pool)
                    .await
                    .map_err(runtime_error)?;
                rows.into_iter()
                    .map(|row| Ok(StreamName::new(row.try_get::<String, _>(0)?)))
                    .collect()
            }
            SourceStreams::Categories(categories) => {
                let placeholders: Vec<String> = (1..=categories.len())
                    .map(|index| DIALECT.placeholder(index))
                    .collect();
                let sql = format!(
                    "SELECT real_stream_name FROM {} WHERE category IN ({})",
                    self.inner.event_streams_table,
                    placeholders.join(", ")
                );
                let mut query = sqlx::query(&sql);
                for category in categories {
                    query = query.bind(category);
                }
                let rows = query
                    .fetch_all(&self.inner.pool)
                    .await
                    .map_err(runtime_error)?;
                rows.into_iter()
                    .map(|row| Ok(StreamName::new(row.try_get::<String, _>(0)?)))
                    .collect()
            }
        }
    }
}

pub(crate) fn bind_values<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    values: Vec<SqlValue>,
) -> Query<'q, Postgres, PgArguments> {
    for value in values {
        query = match value {
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Int(v) => query.bind(v),
            SqlValue::Uuid(v) => query.bind(v),
            SqlValue::Json(v) => query.bind(Json(v)),
            SqlValue::Timestamp(v) => query.bind(v),
        };
    }
    query
}

fn classify_append_error(err: sqlx::Error, stream_name: &StreamName) -> Error {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some(SQLSTATE_UNDEFINED_TABLE) => {
                return Error::StreamNotFound(stream_name.clone());
            }
            Some(SQLSTATE_UNIQUE_VIOLATION) => {
                return Error::Concurrency(
                    "an event with the same id or aggregate version already exists".to_string(),
                );
            }
            _ => return runtime_db_message(db.as_ref()),
        }
    }
    Error::Sqlx(err)
}

fn classify_load_error(err: sqlx::Error, stream_name: &StreamName) -> Error {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(SQLSTATE_UNDEFINED_COLUMN) {
            return Error::UnexpectedValue(
                "Unknown field given in metadata matcher".to_string(),
            );
        }
        return Error::StreamNotFound(stream_name.clone());
    }
    Error::Sqlx(err)
}

fn classify_enumeration_error(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(SQLSTATE_UNDEFINED_COLUMN) {
            return Error::UnexpectedValue(
                "Unknown field given in metadata matcher".to_string(),
            );
        }
    }
    runtime_error(err)
}

/// Postgres validates regex patterns server side; a pattern syntax error is
/// reported as an invalid argument like the client side validation elsewhere.
fn classify_projection_names_error(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(SQLSTATE_INVALID_REGEX) {
            return Error::InvalidArgument("invalid regex pattern given".to_string());
        }
    }
    runtime_error(err)
}

fn runtime_db_message(db: &(dyn sqlx::error::DatabaseError + 'static)) -> Error {
    Error::Runtime(format!(
        "SQLSTATE[{}]: {}",
        db.code().unwrap_or_else(|| "HY000".into()),
        db.message()
    ))
}
