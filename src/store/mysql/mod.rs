//! MySql event store, also serving MariaDb through its own strategies, lock
//! strategy and registry DDL.

pub use builder::MySqlEventStoreBuilder;

mod builder;
mod iterator;
pub mod migrations;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::mysql::MySqlArguments;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Connection, MySql, MySqlConnection, Pool, Row};

use crate::error::{runtime_error, Error};
use crate::event::Event;
use crate::json as json_codec;
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

const SQLSTATE_UNDEFINED_TABLE: &str = "42S02";
const SQLSTATE_CONSTRAINT_VIOLATION: &str = "23000";
const SQLSTATE_UNDEFINED_COLUMN: &str = "42S22";

/// MySql/MariaDb implementation of the [`EventStore`].
///
/// The store is protected by an [`Arc`] that allows it to be cloneable still
/// having the same memory reference.
pub struct MySqlEventStore {
    inner: Arc<InnerMySqlStore>,
}

pub(super) struct InnerMySqlStore {
    pool: Pool<MySql>,
    dialect: Dialect,
    strategy: Box<dyn PersistenceStrategy>,
    write_lock: Box<dyn WriteLockStrategy<MySqlConnection>>,
    event_streams_table: String,
    projections_table: String,
    load_batch_size: i64,
    disable_transaction_handling: bool,
    statements: StoreStatements,
    projection_statements: ProjectionStatements,
}

impl Clone for MySqlEventStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for MySqlEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlEventStore")
            .field("dialect", &self.inner.dialect)
            .field("event_streams_table", &self.inner.event_streams_table)
            .field("load_batch_size", &self.inner.load_batch_size)
            .finish()
    }
}

impl MySqlEventStore {
    /// Builder for a store talking to MySql.
    pub fn builder(pool: Pool<MySql>) -> MySqlEventStoreBuilder {
        MySqlEventStoreBuilder::new(pool)
    }

    /// Builder for a store talking to MariaDb.
    pub fn mariadb_builder(pool: Pool<MySql>) -> MySqlEventStoreBuilder {
        MySqlEventStoreBuilder::mariadb(pool)
    }

    pub(super) fn from_inner(inner: InnerMySqlStore) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn pool(&self) -> &Pool<MySql> {
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
            .bind(json_codec::encode(&Value::Object(metadata.clone()))?)
            .bind(name.category())
            .execute(&self.inner.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(SQLSTATE_CONSTRAINT_VIOLATION) =>
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
        conn: &mut MySqlConnection,
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

    async fn stream_names_page(
        &self,
        conditions: Vec<String>,
        params: Vec<SqlValue>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StreamName>, Error> {
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT real_stream_name FROM {}{} ORDER BY real_stream_name ASC LIMIT ? OFFSET ?",
            self.inner.event_streams_table, where_clause
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
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, Error> {
        let (extra, params) = match condition {
            Some((condition, param)) => (format!(" AND {condition}"), vec![param]),
            None => (String::new(), Vec::new()),
        };
        let sql = format!(
            "SELECT category FROM {} WHERE category IS NOT NULL{} \
             GROUP BY category ORDER BY category ASC LIMIT ? OFFSET ?",
            self.inner.event_streams_table, extra
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
impl EventStore for MySqlEventStore {
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
            let drop_sql = format!("DROP TABLE IF EXISTS `{table}`");
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
        let sql = insert_sql(
            inner.dialect,
            &table,
            inner.strategy.column_names(),
            events.len(),
        );

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
            inner.dialect,
            &table,
            matcher,
            inner.strategy.indexed_metadata_fields(),
            inner.strategy.index_name(),
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
            inner.dialect,
            &table,
            matcher,
            inner.strategy.indexed_metadata_fields(),
            inner.strategy.index_name(),
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

    /// DDL is not transactional on MySql; the registry row is removed first
    /// and the table drop commits implicitly.
    #[tracing::instrument(skip_all, fields(stream = %stream_name), err)]
    async fn delete(&self, stream_name: &StreamName) -> Result<(), Error> {
        let result = sqlx::query(&self.inner.statements.delete_stream)
            .bind(stream_name.as_str())
            .execute(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
        if result.rows_affected() == 0 {
            return Err(Error::StreamNotFound(stream_name.clone()));
        }
        let table = self.inner.strategy.table_name(stream_name);
        sqlx::query(&format!("DROP TABLE IF EXISTS `{table}`"))
            .execute(&self.inner.pool)
            .await
            .map_err(runtime_error)?;
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
        let raw: String = row.try_get_unchecked("metadata")?;
        json_codec::decode_object(&raw)
    }

    async fn update_stream_metadata(
        &self,
        stream_name: &StreamName,
        new_metadata: Map<String, Value>,
    ) -> Result<(), Error> {
        let result = sqlx::query(&self.inner.statements.update_metadata)
            .bind(json_codec::encode(&Value::Object(new_metadata))?)
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
            conditions.push("real_stream_name = ?".to_string());
            params.push(SqlValue::Text(filter.to_string()));
            next_index += 1;
        }
        if let Some(matcher) = matcher {
            let clause =
                matcher_conditions(self.inner.dialect, matcher, None, &mut next_index)?;
            conditions.extend(clause.conditions);
            params.extend(clause.params);
        }
        self.stream_names_page(conditions, params, limit, offset).await
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
        let mut conditions = vec!["real_stream_name REGEXP ?".to_string()];
        let mut params = vec![SqlValue::Text(pattern.to_string())];
        if let Some(matcher) = matcher {
            let clause =
                matcher_conditions(self.inner.dialect, matcher, None, &mut next_index)?;
            conditions.extend(clause.conditions);
            params.extend(clause.params);
        }
        self.stream_names_page(conditions, params, limit, offset).await
    }

    async fn fetch_category_names(
        &self,
        filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, Error> {
        let condition = filter.map(|filter| {
            (
                "category = ?".to_string(),
                SqlValue::Text(filter.to_string()),
            )
        });
        self.category_names_page(condition, limit, offset).await
    }

    async fn fetch_category_names_regex(
        &self,
        pattern: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, Error> {
        validate_regex(pattern)?;
        let condition = Some((
            "category REGEXP ?".to_string(),
            SqlValue::Text(pattern.to_string()),
        ));
        self.category_names_page(condition, limit, offset).await
    }
}

#[async_trait]
impl ProjectionStore for MySqlEventStore {
    async fn create_projection(&self, name: &str) -> Result<(), Error> {
        sqlx::query(&self.inner.projection_statements.create)
            .bind(name)
            .bind("{}")
            .bind("{}")
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
            .bind(json_codec::encode(position)?)
            .bind(json_codec::encode(state)?)
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
            .bind(json_codec::encode(position)?)
            .bind(json_codec::encode(state)?)
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
                let position: Option<String> = row.try_get_unchecked("position")?;
                let state: Option<String> = row.try_get_unchecked("state")?;
                Ok(Some((
                    position.map_or_else(|| Ok(json!({})), |raw| json_codec::decode(&raw))?,
                    state.map_or_else(|| Ok(json!({})), |raw| json_codec::decode(&raw))?,
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

    /// The pattern is validated client side; MySql reports regex syntax
    /// errors inconsistently across versions.
    async fn fetch_projection_names(
        &self,
        filter: Option<&str>,
        regex: bool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, Error> {
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        if let Some(filter) = filter {
            if regex {
                validate_regex(filter)?;
                conditions.push("name REGEXP ?".to_string());
            } else {
                conditions.push("name = ?".to_string());
            }
            params.push(SqlValue::Text(filter.to_string()));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT name FROM {}{where_clause} ORDER BY name ASC LIMIT ? OFFSET ?",
            self.inner.projections_table
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
                let placeholders = vec!["?"; categories.len()].join(", ");
                let sql = format!(
                    "SELECT real_stream_name FROM {} WHERE category IN ({placeholders})",
                    self.inner.event_streams_table
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
    mut query: Query<'q, MySql, MySqlArguments>,
    values: Vec<SqlValue>,
) -> Query<'q, MySql, MySqlArguments> {
    for value in values {
        query = match value {
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Int(v) => query.bind(v),
            SqlValue::Uuid(v) => query.bind(v.to_string()),
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
            Some(SQLSTATE_CONSTRAINT_VIOLATION) => {
                return Error::Concurrency(
                    "an event with the same id or aggregate version already exists".to_string(),
                );
            }
            _ => {
                return Error::Runtime(format!(
                    "SQLSTATE[{}]: {}",
                    db.code().unwrap_or_else(|| "HY000".into()),
                    db.message()
                ));
            }
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
