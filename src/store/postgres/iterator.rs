//! Lazy batch-paged iteration over a stream table.
//!
//! The first page is fetched eagerly by the store so statement errors are
//! classified at call time; every following page re-executes the bounded
//! select with the range start rebound to the last seen sequence number.

use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::error::{runtime_error, Error};
use crate::event::RecordedEvent;
use crate::sql::SqlValue;

use super::bind_values;

pub(super) struct PageSpec {
    pub pool: Pool<Postgres>,
    pub select_sql: String,
    pub params: Vec<SqlValue>,
    pub batch_size: i64,
    pub count: Option<i64>,
    pub reverse: bool,
}

pub(super) async fn fetch_page(
    pool: &Pool<Postgres>,
    select_sql: &str,
    params: &[SqlValue],
    from_number: i64,
    limit: i64,
) -> Result<Vec<RecordedEvent>, sqlx::Error> {
    let rows = bind_values(sqlx::query(select_sql), params.to_vec())
        .bind(from_number)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(map_row).collect()
}

fn map_row(row: PgRow) -> Result<RecordedEvent, sqlx::Error> {
    let metadata: Value = row.try_get("metadata")?;
    let mut event = RecordedEvent {
        no: row.try_get("no")?,
        event_id: row.try_get::<Uuid, _>("event_id")?,
        event_name: row.try_get("event_name")?,
        payload: row.try_get("payload")?,
        metadata: metadata.as_object().cloned().unwrap_or_default(),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    };
    event.inject_position();
    Ok(event)
}

pub(super) fn paged_stream(
    spec: PageSpec,
    first: Vec<RecordedEvent>,
    first_limit: i64,
) -> BoxStream<'static, Result<RecordedEvent, Error>> {
    Box::pin(stream! {
        let mut page = first;
        let mut limit = first_limit;
        let mut consumed: i64 = 0;
        loop {
            let page_len = page.len() as i64;
            let mut last_no = None;
            for event in page.drain(..) {
                last_no = Some(event.no);
                consumed += 1;
                yield Ok(event);
            }
            if page_len < limit {
                break;
            }
            if spec.count.is_some_and(|count| consumed >= count) {
                break;
            }
            let Some(last_no) = last_no else { break };
            let from_number = if spec.reverse { last_no - 1 } else { last_no + 1 };
            limit = match spec.count {
                Some(count) => spec.batch_size.min(count - consumed),
                None => spec.batch_size,
            };
            if limit <= 0 {
                break;
            }
            match fetch_page(&spec.pool, &spec.select_sql, &spec.params, from_number, limit).await {
                Ok(next) => page = next,
                Err(err) => {
                    yield Err(runtime_error(err));
                    break;
                }
            }
            if page.is_empty() {
                break;
            }
        }
    })
}
