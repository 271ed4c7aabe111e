//! Dialect aware Sql building: identifier quoting, parameter placeholders,
//! metadata matcher translation and the statements shared by every store
//! operating on the `event_streams` and `projections` tables.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Error;
use crate::matcher::{FieldType, MetadataMatcher, Operator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    MariaDb,
}

impl Dialect {
    /// Quotes a possibly schema-qualified identifier.
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::Postgres => ident
                .split('.')
                .map(|part| format!("\"{part}\""))
                .collect::<Vec<_>>()
                .join("."),
            Dialect::MySql | Dialect::MariaDb => format!("`{ident}`"),
        }
    }

    /// Positional bind placeholder. `index` is 1-based.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::MySql | Dialect::MariaDb => "?".to_string(),
        }
    }

    pub(crate) fn regex_operator(&self) -> &'static str {
        match self {
            Dialect::Postgres => "~",
            Dialect::MySql | Dialect::MariaDb => "REGEXP",
        }
    }

    /// Expression extracting a metadata field as text.
    pub(crate) fn json_text(&self, column: &str, field: &str) -> String {
        match self {
            Dialect::Postgres => format!("{column}->>'{field}'"),
            Dialect::MySql | Dialect::MariaDb => {
                format!("json_value({column}, '$.{field}')")
            }
        }
    }

    /// Booleans are inlined rather than bound: `json_value` yields numerics
    /// for booleans on MySql and MariaDb, while `->>` yields the text
    /// `true`/`false` on Postgres.
    pub(crate) fn bool_literal(&self, value: bool) -> &'static str {
        match (self, value) {
            (Dialect::Postgres, true) => "'true'",
            (Dialect::Postgres, false) => "'false'",
            (_, true) => "1",
            (_, false) => "0",
        }
    }
}

/// A value bound to a prepared statement, in placeholder order.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Uuid(Uuid),
    Json(Value),
    Timestamp(DateTime<Utc>),
}

/// Rendered WHERE conditions plus the parameters they bind.
#[derive(Debug, Default)]
pub(crate) struct WhereClause {
    pub conditions: Vec<String>,
    pub params: Vec<SqlValue>,
}

/// Translates a metadata matcher into Sql conditions.
///
/// `indexed_fields` is the strategy's indexed-metadata projection; a metadata
/// field found there is rewritten onto its real column and treated as a
/// message property. `next_index` is the running placeholder counter, shared
/// with the rest of the statement being built.
pub(crate) fn matcher_conditions(
    dialect: Dialect,
    matcher: &MetadataMatcher,
    indexed_fields: Option<&[(&'static str, &'static str)]>,
    next_index: &mut usize,
) -> Result<WhereClause, Error> {
    let mut clause = WhereClause::default();

    for m in matcher.matches() {
        let indexed = match m.field_type {
            FieldType::Metadata => indexed_fields
                .and_then(|fields| fields.iter().find(|(from, _)| *from == m.field))
                .map(|(_, to)| *to),
            FieldType::MessageProperty => None,
        };

        let (lhs, target) = match (m.field_type, indexed) {
            (FieldType::Metadata, None) => (
                dialect.json_text("metadata", &m.field),
                ParamTarget::Metadata,
            ),
            (FieldType::Metadata, Some(column)) => (column.to_string(), ParamTarget::Indexed),
            (FieldType::MessageProperty, _) => {
                (m.field.clone(), ParamTarget::column(&m.field))
            }
        };

        match m.operator {
            Operator::In | Operator::NotIn => {
                let values = m.value.as_array().expect("validated at construction");
                let mut group = Vec::with_capacity(values.len());
                for value in values {
                    match value {
                        Value::Bool(b) => group.push(dialect.bool_literal(*b).to_string()),
                        other => {
                            group.push(dialect.placeholder(*next_index));
                            *next_index += 1;
                            clause.params.push(bind_param(dialect, target, other)?);
                        }
                    }
                }
                clause
                    .conditions
                    .push(format!("{lhs} {} ({})", m.operator.sql(), group.join(", ")));
            }
            Operator::Regex => {
                let placeholder = dialect.placeholder(*next_index);
                *next_index += 1;
                clause.params.push(bind_param(dialect, target, &m.value)?);
                clause
                    .conditions
                    .push(format!("{lhs} {} {placeholder}", dialect.regex_operator()));
            }
            _ => match &m.value {
                Value::Bool(b) => clause
                    .conditions
                    .push(format!("{lhs} {} {}", m.operator.sql(), dialect.bool_literal(*b))),
                other => {
                    let placeholder = dialect.placeholder(*next_index);
                    *next_index += 1;
                    clause.params.push(bind_param(dialect, target, other)?);
                    clause
                        .conditions
                        .push(format!("{lhs} {} {placeholder}", m.operator.sql()));
                }
            },
        }
    }

    Ok(clause)
}

/// What a bound matcher value targets; decides the parameter type.
#[derive(Debug, Clone, Copy)]
enum ParamTarget {
    /// JSON extraction result, always compared as text.
    Metadata,
    /// A column materialized from metadata by the strategy.
    Indexed,
    No,
    CreatedAt,
    EventId,
    Other,
}

impl ParamTarget {
    fn column(field: &str) -> Self {
        match field {
            "no" => ParamTarget::No,
            "created_at" => ParamTarget::CreatedAt,
            "event_id" => ParamTarget::EventId,
            _ => ParamTarget::Other,
        }
    }
}

fn bind_param(dialect: Dialect, target: ParamTarget, value: &Value) -> Result<SqlValue, Error> {
    match target {
        ParamTarget::Metadata => Ok(SqlValue::Text(text_repr(value))),
        ParamTarget::Indexed => Ok(match value.as_i64() {
            Some(n) => SqlValue::Int(n),
            None => SqlValue::Text(text_repr(value)),
        }),
        ParamTarget::No => value.as_i64().map(SqlValue::Int).ok_or_else(|| {
            Error::InvalidArgument("'no' comparisons require an integer value".to_string())
        }),
        ParamTarget::CreatedAt => {
            let raw = value.as_str().ok_or_else(|| {
                Error::InvalidArgument("'created_at' comparisons require a timestamp string".to_string())
            })?;
            Ok(SqlValue::Timestamp(parse_timestamp(raw)?))
        }
        ParamTarget::EventId => {
            let raw = value.as_str().ok_or_else(|| {
                Error::InvalidArgument("'event_id' comparisons require a uuid string".to_string())
            })?;
            match dialect {
                Dialect::Postgres => Uuid::parse_str(raw).map(SqlValue::Uuid).map_err(|_| {
                    Error::InvalidArgument(format!("'{raw}' is not a valid uuid"))
                }),
                _ => Ok(SqlValue::Text(raw.to_string())),
            }
        }
        ParamTarget::Other => Ok(SqlValue::Text(text_repr(value))),
    }
}

fn text_repr(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, Error> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| Error::InvalidArgument(format!("'{raw}' is not a valid timestamp")))
}

/// Select and count statements for one stream table, with matcher parameters
/// already rendered. `from_number` and `limit` are bound after `params` by
/// the paging iterator; the count statement takes `from_number` only.
#[derive(Debug, Clone)]
pub(crate) struct StreamQuery {
    pub select_sql: String,
    pub count_sql: String,
    pub params: Vec<SqlValue>,
}

pub(crate) fn build_stream_query(
    dialect: Dialect,
    table: &str,
    matcher: Option<&MetadataMatcher>,
    indexed_fields: Option<&[(&'static str, &'static str)]>,
    index_hint: Option<&str>,
    reverse: bool,
) -> Result<StreamQuery, Error> {
    let mut next_index = 1;
    let clause = match matcher {
        Some(matcher) => matcher_conditions(dialect, matcher, indexed_fields, &mut next_index)?,
        None => WhereClause::default(),
    };

    let mut conditions = clause.conditions;
    let comparison = if reverse { "<=" } else { ">=" };
    conditions.push(format!(
        "no {comparison} {}",
        dialect.placeholder(next_index)
    ));

    let quoted = dialect.quote(table);
    let hint = match index_hint {
        Some(index) => format!(" USE INDEX ({index})"),
        None => String::new(),
    };
    let order = if reverse { "DESC" } else { "ASC" };
    let where_clause = conditions.join(" AND ");

    let select_sql = format!(
        "SELECT * FROM {quoted}{hint} WHERE {where_clause} ORDER BY no {order} LIMIT {}",
        dialect.placeholder(next_index + 1)
    );
    let count_sql = format!("SELECT COUNT(*) FROM {quoted} WHERE {where_clause}");

    Ok(StreamQuery {
        select_sql,
        count_sql,
        params: clause.params,
    })
}

/// Multi-row insert statement with one placeholder group per event.
pub(crate) fn insert_sql(
    dialect: Dialect,
    table: &str,
    columns: &[&'static str],
    rows: usize,
) -> String {
    let mut groups = Vec::with_capacity(rows);
    let mut index = 1;
    for _ in 0..rows {
        let group: Vec<String> = columns
            .iter()
            .map(|_| {
                let placeholder = dialect.placeholder(index);
                index += 1;
                placeholder
            })
            .collect();
        groups.push(format!("({})", group.join(", ")));
    }
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        dialect.quote(table),
        columns.join(", "),
        groups.join(", ")
    )
}

/// Statements over the central `event_streams` registry.
#[derive(Debug, Clone)]
pub(crate) struct StoreStatements {
    pub insert_stream: String,
    pub delete_stream: String,
    pub has_stream: String,
    pub fetch_metadata: String,
    pub update_metadata: String,
    pub non_internal_stream_names: String,
}

impl StoreStatements {
    pub fn new(dialect: Dialect, event_streams_table: &str) -> Self {
        let table = event_streams_table;
        Self {
            insert_stream: format!(
                "INSERT INTO {table} (real_stream_name, stream_name, metadata, category) VALUES ({}, {}, {}, {})",
                dialect.placeholder(1),
                dialect.placeholder(2),
                dialect.placeholder(3),
                dialect.placeholder(4)
            ),
            delete_stream: format!(
                "DELETE FROM {table} WHERE real_stream_name = {}",
                dialect.placeholder(1)
            ),
            has_stream: format!(
                "SELECT 1 FROM {table} WHERE real_stream_name = {}",
                dialect.placeholder(1)
            ),
            fetch_metadata: format!(
                "SELECT metadata FROM {table} WHERE real_stream_name = {}",
                dialect.placeholder(1)
            ),
            update_metadata: format!(
                "UPDATE {table} SET metadata = {} WHERE real_stream_name = {}",
                dialect.placeholder(1),
                dialect.placeholder(2)
            ),
            non_internal_stream_names: format!(
                "SELECT real_stream_name FROM {table} WHERE real_stream_name NOT LIKE '$%'"
            ),
        }
    }
}

/// Statements over the `projections` registry.
#[derive(Debug, Clone)]
pub(crate) struct ProjectionStatements {
    pub create: String,
    pub exists: String,
    pub acquire_lock: String,
    pub renew_lock: String,
    pub start_again: String,
    pub release_lock: String,
    pub persist: String,
    pub update: String,
    pub update_status: String,
    pub delete: String,
    pub load: String,
    pub fetch_status: String,
}

impl ProjectionStatements {
    pub fn new(dialect: Dialect, projections_table: &str) -> Self {
        let table = projections_table;
        let create = match dialect {
            Dialect::Postgres => format!(
                "INSERT INTO {table} (name, position, state, status, locked_until) \
                 VALUES ({}, {}, {}, {}, NULL) ON CONFLICT (name) DO NOTHING",
                dialect.placeholder(1),
                dialect.placeholder(2),
                dialect.placeholder(3),
                dialect.placeholder(4)
            ),
            Dialect::MySql | Dialect::MariaDb => format!(
                "INSERT IGNORE INTO {table} (name, position, state, status, locked_until) \
                 VALUES (?, ?, ?, ?, NULL)"
            ),
        };
        Self {
            create,
            exists: format!(
                "SELECT 1 FROM {table} WHERE name = {}",
                dialect.placeholder(1)
            ),
            acquire_lock: format!(
                "UPDATE {table} SET locked_until = {}, status = {} \
                 WHERE name = {} AND (locked_until IS NULL OR locked_until < {})",
                dialect.placeholder(1),
                dialect.placeholder(2),
                dialect.placeholder(3),
                dialect.placeholder(4)
            ),
            renew_lock: format!(
                "UPDATE {table} SET locked_until = {} WHERE name = {}",
                dialect.placeholder(1),
                dialect.placeholder(2)
            ),
            start_again: format!(
                "UPDATE {table} SET status = {}, locked_until = {} WHERE name = {}",
                dialect.placeholder(1),
                dialect.placeholder(2),
                dialect.placeholder(3)
            ),
            release_lock: format!(
                "UPDATE {table} SET status = {}, locked_until = NULL WHERE name = {}",
                dialect.placeholder(1),
                dialect.placeholder(2)
            ),
            persist: format!(
                "UPDATE {table} SET position = {}, state = {}, locked_until = {} WHERE name = {}",
                dialect.placeholder(1),
                dialect.placeholder(2),
                dialect.placeholder(3),
                dialect.placeholder(4)
            ),
            update: format!(
                "UPDATE {table} SET position = {}, state = {}, status = {} WHERE name = {}",
                dialect.placeholder(1),
                dialect.placeholder(2),
                dialect.placeholder(3),
                dialect.placeholder(4)
            ),
            update_status: format!(
                "UPDATE {table} SET status = {} WHERE name = {}",
                dialect.placeholder(1),
                dialect.placeholder(2)
            ),
            delete: format!(
                "DELETE FROM {table} WHERE name = {}",
                dialect.placeholder(1)
            ),
            load: format!(
                "SELECT position, state FROM {table} WHERE name = {}",
                dialect.placeholder(1)
            ),
            fetch_status: format!(
                "SELECT status FROM {table} WHERE name = {}",
                dialect.placeholder(1)
            ),
        }
    }
}
