//! Persistent response store.
//!
//! A backing table holds one cached response per URL. This module owns the
//! row model, the SQL for one table (point-select, upsert, delete, batched
//! TTL cleanup, DDL), and the timestamp encoding. `engine` builds the
//! concurrent per-database machinery on top, `repository` aggregates
//! engines, and `discovery` finds backing tables by introspection.

pub mod discovery;
pub mod engine;
pub mod repository;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_orm::{ConnectionTrait, DbBackend, FromQueryResult, Statement};

use crate::error::{AppError, AppResult};
use crate::headers::Headers;

/// Columns a table must expose to qualify as a backing table.
pub const REQUIRED_COLUMNS: &[&str] =
    &["url", "status", "body", "header", "request_time", "response_time"];

/// `database_id` value meaning "any database may take this write".
pub const FREE_CHOICE: i32 = -1;

/// Rows deleted per cleanup sweep.
const CLEANUP_BATCH_SIZE: u32 = 1000;

/// One cached upstream response, keyed by URL within a backing table.
///
/// `database_id`/`table_name` locate the row once it has been read from or
/// routed to a store; a freshly fetched entry carries `FREE_CHOICE` and an
/// empty table name.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub body: Bytes,
    pub header: Headers,
    pub request_time: DateTime<Utc>,
    pub response_time: DateTime<Utc>,
    pub database_id: i32,
    pub table_name: String,
}

impl CachedResponse {
    /// A routing-free entry as produced by an upstream fetch.
    #[must_use]
    pub fn new(
        status: u16,
        body: Bytes,
        header: Headers,
        request_time: DateTime<Utc>,
        response_time: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            body,
            header,
            request_time,
            response_time,
            database_id: FREE_CHOICE,
            table_name: String::new(),
        }
    }
}

/// Whether `name` is acceptable as a backing (or sink) table name.
#[must_use]
pub fn valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// DDL for one backing table.
#[must_use]
pub fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table}(\n\
         \turl TEXT PRIMARY KEY,\n\
         \tstatus INTEGER,\n\
         \tbody BLOB,\n\
         \theader JSON,\n\
         \trequest_time TIMESTAMP,\n\
         \tresponse_time TIMESTAMP\n\
         )"
    )
}

/// Validate names and create any missing backing tables.
///
/// # Errors
///
/// `AppError::Config` on an invalid table name, `AppError::Storage` when the
/// DDL fails.
pub async fn create_response_tables<C: ConnectionTrait>(
    conn: &C,
    tables: &[String],
) -> AppResult<()> {
    for table in tables {
        if !valid_table_name(table) {
            return Err(AppError::Config(format!("table name {table:?} is invalid")));
        }
        conn.execute(Statement::from_string(DbBackend::Sqlite, create_table_sql(table)))
            .await?;
    }
    Ok(())
}

pub(crate) fn read_sql(table: &str) -> String {
    format!(
        "SELECT status, body, header, request_time, response_time FROM {table} WHERE url = ?"
    )
}

pub(crate) fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table}(url, status, body, header, request_time, response_time) \
         VALUES(?, ?, ?, ?, ?, ?) \
         ON CONFLICT(url) DO UPDATE SET \
         status = excluded.status, \
         body = excluded.body, \
         header = excluded.header, \
         request_time = excluded.request_time, \
         response_time = excluded.response_time"
    )
}

pub(crate) fn delete_sql(table: &str) -> String {
    format!("DELETE FROM {table} WHERE url = ?")
}

pub(crate) fn cleanup_sql(table: &str) -> String {
    format!(
        "DELETE FROM {table} WHERE rowid IN (\
         SELECT rowid FROM {table} \
         WHERE unixepoch() - unixepoch(response_time) > ? \
         ORDER BY rowid LIMIT {CLEANUP_BATCH_SIZE})"
    )
}

#[derive(Debug, FromQueryResult)]
struct ResponseRow {
    status: i32,
    body: Vec<u8>,
    header: String,
    request_time: String,
    response_time: String,
}

/// Point lookup by primary key.
///
/// # Errors
///
/// `AppError::NotFound` when no row exists, `AppError::Storage` on driver
/// failures, `AppError::Decode` on an unreadable timestamp. A malformed
/// header column degrades to an empty header map instead of failing.
pub async fn read_one<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    url: &str,
) -> AppResult<CachedResponse> {
    let row = conn
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            read_sql(table),
            [url.into()],
        ))
        .await?
        .ok_or(AppError::NotFound)?;

    let row = ResponseRow::from_query_result(&row, "")
        .map_err(|e| AppError::Decode(format!("response row in {table}: {e}")))?;

    let header = Headers::from_json(&row.header).unwrap_or_else(|e| {
        tracing::debug!(table, url, error = %e, "unreadable header column");
        Headers::default()
    });

    Ok(CachedResponse {
        status: u16::try_from(row.status).unwrap_or_default(),
        body: Bytes::from(row.body),
        header,
        request_time: parse_timestamp(&row.request_time)?,
        response_time: parse_timestamp(&row.response_time)?,
        database_id: FREE_CHOICE,
        table_name: table.to_string(),
    })
}

/// Insert or replace the row for `url`, updating every non-key column.
///
/// # Errors
///
/// `AppError::Storage` on bind/execute failures.
pub async fn upsert<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    url: &str,
    entry: &CachedResponse,
) -> AppResult<()> {
    conn.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        upsert_sql(table),
        [
            url.into(),
            i32::from(entry.status).into(),
            entry.body.to_vec().into(),
            entry.header.to_json().into(),
            format_timestamp(entry.request_time).into(),
            format_timestamp(entry.response_time).into(),
        ],
    ))
    .await?;
    Ok(())
}

/// Remove the row for `url`, if any.
///
/// # Errors
///
/// `AppError::Storage` on execute failures.
pub async fn delete_by_url<C: ConnectionTrait>(conn: &C, table: &str, url: &str) -> AppResult<()> {
    conn.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        delete_sql(table),
        [url.into()],
    ))
    .await?;
    Ok(())
}

/// Delete one batch of rows whose `response_time` is older than
/// `ttl_seconds`, returning how many were removed. Callers repeat until a
/// sweep deletes zero rows.
///
/// # Errors
///
/// `AppError::Storage` on execute failures.
pub async fn cleanup_once<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    ttl_seconds: i64,
) -> AppResult<u64> {
    let result = conn
        .execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            cleanup_sql(table),
            [ttl_seconds.into()],
        ))
        .await?;
    Ok(result.rows_affected())
}

/// RFC 3339 with fixed nine-digit nanoseconds and a `Z` suffix, so string
/// order matches chronological order.
#[must_use]
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a persisted timestamp.
///
/// # Errors
///
/// `AppError::Decode` when the text is not RFC 3339.
pub fn parse_timestamp(text: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|e| AppError::Decode(format!("timestamp {text:?}: {e}")))
}
