//! libSQL (embedded SQLite) backend.

mod activity;
mod billing;
mod dashboard;
mod files;
mod matters;
mod notices;
mod tasks;
mod users;

use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use libsql::Value;
use libsql::params::Params;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::{Database, Visibility};
use crate::error::DatabaseError;

/// File-backed libSQL database. Each operation opens its own connection.
pub struct LibSqlBackend {
    db: libsql::Database,
}

impl LibSqlBackend {
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;
        tracing::debug!("Opened libSQL database at {}", path.display());
        Ok(Self { db })
    }

    pub(crate) async fn connect(&self) -> Result<libsql::Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .await?;
        Ok(conn)
    }
}

#[async_trait::async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        conn.execute_batch(super::libsql_migrations::SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }
}

// ==================== Row helpers ====================

pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    match row.get_value(idx) {
        Ok(Value::Text(s)) => Some(s),
        _ => None,
    }
}

pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or_default()
}

pub(crate) fn get_bool(row: &libsql::Row, idx: i32) -> bool {
    get_i64(row, idx) != 0
}

pub(crate) fn opt_text(value: Option<&str>) -> Value {
    match value {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

pub(crate) fn opt_text_owned(value: Option<String>) -> Value {
    match value {
        Some(s) => Value::Text(s),
        None => Value::Null,
    }
}

pub(crate) fn opt_uuid(value: Option<Uuid>) -> Value {
    opt_text_owned(value.map(|id| id.to_string()))
}

pub(crate) fn opt_date(value: Option<NaiveDate>) -> Value {
    opt_text_owned(value.map(|d| d.to_string()))
}

pub(crate) fn opt_ts(value: Option<DateTime<Utc>>) -> Value {
    opt_text_owned(value.map(|ts| fmt_ts(&ts)))
}

pub(crate) fn bool_value(value: bool) -> Value {
    Value::Integer(i64::from(value))
}

/// Fixed-width RFC 3339 so stored timestamps compare lexically.
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .map(|naive| naive.and_utc()),
    }
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    parse_timestamp(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

pub(crate) fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    raw.as_deref().map(parse_ts).transpose()
}

pub(crate) fn parse_date_opt(raw: Option<String>) -> Result<Option<NaiveDate>, DatabaseError> {
    raw.as_deref().map(parse_date).transpose()
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| DatabaseError::Serialization(format!("invalid date '{}': {}", raw, e)))
}

pub(crate) fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("invalid {} uuid: {}", field, e)))
}

pub(crate) fn parse_uuid_opt(raw: Option<String>, field: &str) -> Result<Option<Uuid>, DatabaseError> {
    raw.as_deref().map(|value| parse_uuid(value, field)).transpose()
}

pub(crate) fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, DatabaseError> {
    raw.parse::<Decimal>()
        .map_err(|e| DatabaseError::Serialization(format!("invalid {} decimal: {}", field, e)))
}

/// Split a `GROUP_CONCAT` of uuids back into a list.
pub(crate) fn parse_uuid_list(raw: Option<String>, field: &str) -> Result<Vec<Uuid>, DatabaseError> {
    match raw {
        Some(joined) if !joined.is_empty() => joined
            .split(',')
            .map(|part| parse_uuid(part, field))
            .collect(),
        _ => Ok(Vec::new()),
    }
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, DatabaseError> {
    let raw = if raw.trim().is_empty() { "[]" } else { raw };
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// `%term%` pattern with LIKE wildcards escaped (use with `ESCAPE '\'`).
pub(crate) fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.trim().to_lowercase().chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

// ==================== Dynamic query building ====================

/// Positional arguments for queries assembled at runtime.
#[derive(Default)]
pub(crate) struct QueryArgs {
    values: Vec<Value>,
    clauses: Vec<String>,
}

impl QueryArgs {
    /// Push a bound value and return its `?N` placeholder.
    pub(crate) fn bind(&mut self, value: Value) -> String {
        self.values.push(value);
        format!("?{}", self.values.len())
    }

    pub(crate) fn text(&mut self, value: impl Into<String>) -> String {
        self.bind(Value::Text(value.into()))
    }

    pub(crate) fn int(&mut self, value: i64) -> String {
        self.bind(Value::Integer(value))
    }

    pub(crate) fn clause(&mut self, clause: String) {
        self.clauses.push(clause);
    }

    pub(crate) fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub(crate) fn params(&self) -> Params {
        Params::Positional(self.values.clone())
    }

    /// Append `LIMIT`/`OFFSET` placeholders and return the SQL suffix.
    pub(crate) fn page_sql(&mut self, page: crate::db::Page) -> String {
        let limit = self.int(page.limit);
        let offset = self.int(page.offset);
        format!(" LIMIT {} OFFSET {}", limit, offset)
    }
}

/// Restrict a matter id column to the matters a caller may see.
pub(crate) fn matter_scope(args: &mut QueryArgs, visibility: Visibility, column: &str) {
    match visibility {
        Visibility::All => {}
        Visibility::Member(user_id) => {
            let user = args.text(user_id.to_string());
            args.clause(format!(
                "({column} IN (SELECT matter_id FROM matter_members WHERE user_id = {user}) \
                 OR {column} IN (SELECT sc.matter_id FROM tasks sc \
                    JOIN task_assignees sca ON sca.task_id = sc.id WHERE sca.user_id = {user}))"
            ));
        }
        Visibility::Client(user_id) => {
            let user = args.text(user_id.to_string());
            args.clause(format!(
                "{column} IN (SELECT id FROM matters WHERE client_id = {user})"
            ));
        }
    }
}

/// Restrict tasks: members see their own assignments and tasks on their matters.
pub(crate) fn task_scope(args: &mut QueryArgs, visibility: Visibility) {
    match visibility {
        Visibility::Member(user_id) => {
            let user = args.text(user_id.to_string());
            args.clause(format!(
                "(t.id IN (SELECT task_id FROM task_assignees WHERE user_id = {user}) \
                 OR t.matter_id IN (SELECT matter_id FROM matter_members WHERE user_id = {user}))"
            ));
        }
        other => matter_scope(args, other, "t.matter_id"),
    }
}

/// Run `SELECT COUNT(*)` built from the same clauses as a list query.
pub(crate) async fn count_rows(
    conn: &libsql::Connection,
    from_sql: &str,
    args: &QueryArgs,
) -> Result<i64, DatabaseError> {
    let sql = format!("SELECT COUNT(*) FROM {}{}", from_sql, args.where_sql());
    let row = conn.query(&sql, args.params()).await?.next().await?;
    Ok(row.map(|row| get_i64(&row, 0)).unwrap_or(0))
}

/// Run a closure-produced future inside BEGIN/COMMIT, rolling back on error.
macro_rules! in_transaction {
    ($conn:expr, $body:expr) => {{
        $conn.execute("BEGIN IMMEDIATE", ()).await?;
        let result = $body.await;
        match result {
            Ok(value) => {
                $conn.execute("COMMIT", ()).await?;
                Ok(value)
            }
            Err(err) => {
                let _ = $conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }};
}
pub(crate) use in_transaction;

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{fmt_ts, like_pattern, parse_timestamp, parse_uuid_list};

    #[test]
    fn timestamps_round_trip_and_accept_sqlite_format() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("ts");
        assert_eq!(parse_timestamp(&fmt_ts(&ts)).expect("parse"), ts);
        assert_eq!(parse_timestamp("2026-03-04 05:06:07").expect("parse"), ts);
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern(" 50%_Off "), "%50\\%\\_off%");
    }

    #[test]
    fn uuid_list_handles_null_and_empty() {
        assert!(parse_uuid_list(None, "x").expect("none").is_empty());
        assert!(parse_uuid_list(Some(String::new()), "x").expect("empty").is_empty());
        let id = uuid::Uuid::new_v4();
        assert_eq!(
            parse_uuid_list(Some(format!("{id},{id}")), "x").expect("two"),
            vec![id, id]
        );
    }
}
