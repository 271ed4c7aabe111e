//! Lazy batch-paged iteration over a stream table, MySql flavor. JSON lands
//! in text columns (LONGTEXT on MariaDb), so rows are decoded through the
//! canonical codec rather than driver level JSON support.

use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use sqlx::mysql::MySqlRow;
use sqlx::{MySql, Pool, Row};
use uuid::Uuid;

use crate::error::{runtime_error, Error};
use crate::event::RecordedEvent;
use crate::json;
use crate::sql::SqlValue;

use super::bind_values;

pub(super) struct PageSpec {
    pub pool: Pool<MySql>,
    pub select_sql: String,
    pub params: Vec<SqlValue>,
    pub batch_size: i64,
    pub count: Option<i64>,
    pub reverse: bool,
}

pub(super) async fn fetch_page(
    pool: &Pool<MySql>,
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

fn map_row(row: MySqlRow) -> Result<RecordedEvent, sqlx::Error> {
    let event_id: String = row.try_get("event_id")?;
    let event_id = Uuid::parse_str(&event_id)
        .map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
    let payload: String = row.try_get_unchecked("payload")?;
    let metadata: String = row.try_get_unchecked("metadata")?;

    let mut event = RecordedEvent {
        no: row.try_get("no")?,
        event_id,
        event_name: row.try_get("event_name")?,
        payload: json::decode(&payload).map_err(into_decode_error)?,
        metadata: json::decode_object(&metadata).map_err(into_decode_error)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    };
    event.inject_position();
    Ok(event)
}

fn into_decode_error(err: Error) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
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
