use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ErrorCode, OpenFlags, ToSql};

use crate::error::PollError;
use crate::query::{MetricQuery, QueryResult, QuerySource, RawValue, SqlParam};

use super::DataSource;

/// Read-only SQLite database.
///
/// rusqlite is blocking, so every call runs on the blocking pool.
pub struct SqlSource {
    path: String,
    conn: Arc<Mutex<Connection>>,
}

impl SqlSource {
    /// Open the database file read-only.
    pub async fn open(path: &str) -> Result<Self, PollError> {
        let owned = path.to_string();
        let conn = tokio::task::spawn_blocking(move || {
            Connection::open_with_flags(
                &owned,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        })
        .await
        .map_err(|e| PollError::Connection(format!("open task failed: {}", e)))?
        .map_err(|e| open_error(path, e))?;

        Ok(Self {
            path: path.to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl DataSource for SqlSource {
    async fn fetch(&mut self, query: &MetricQuery) -> Result<Vec<QueryResult>, PollError> {
        let QuerySource::Sql { statement, params } = &query.source else {
            return Err(PollError::Config(format!(
                "query '{}' is not a SQL query",
                query.name
            )));
        };

        let conn = self.conn.clone();
        let statement = statement.clone();
        let params = params.clone();

        let task = tokio::task::spawn_blocking(move || {
            run_statement(&conn.lock(), &statement, &params)
        });
        let rows = task
            .await
            .map_err(|e| PollError::query(&query.name, format!("worker failed: {}", e)))?
            .map_err(|e| query_error(&query.name, e))?;

        tracing::trace!(
            database = %self.path,
            query = %query.name,
            rows = rows.len(),
            "Query done"
        );
        Ok(rows)
    }
}

fn run_statement(
    conn: &Connection,
    statement: &str,
    params: &[SqlParam],
) -> rusqlite::Result<Vec<QueryResult>> {
    let mut stmt = conn.prepare(statement)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut results = Vec::new();

    while let Some(row) = rows.next()? {
        let mut result = QueryResult::new();
        for (i, column) in columns.iter().enumerate() {
            if let Some(value) = raw_value(row.get_ref(i)?) {
                result.insert(column.clone(), value);
            }
        }
        results.push(result);
    }

    Ok(results)
}

fn raw_value(value: ValueRef<'_>) -> Option<RawValue> {
    match value {
        ValueRef::Null => Some(RawValue::Null),
        ValueRef::Integer(v) => Some(RawValue::Int(v)),
        ValueRef::Real(v) => Some(RawValue::Float(v)),
        ValueRef::Text(t) => Some(RawValue::Text(String::from_utf8_lossy(t).into_owned())),
        ValueRef::Blob(_) => None,
    }
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlParam::Int(v) => ToSqlOutput::from(*v),
            SqlParam::Float(v) => ToSqlOutput::from(*v),
            SqlParam::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

fn sqlite_code(err: &rusqlite::Error) -> Option<ErrorCode> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => Some(e.code),
        _ => None,
    }
}

fn open_error(path: &str, err: rusqlite::Error) -> PollError {
    match sqlite_code(&err) {
        Some(ErrorCode::PermissionDenied) | Some(ErrorCode::AuthorizationForStatementDenied) => {
            PollError::Auth(format!("{}: {}", path, err))
        }
        _ => PollError::Connection(format!("{}: {}", path, err)),
    }
}

fn query_error(query: &str, err: rusqlite::Error) -> PollError {
    match sqlite_code(&err) {
        Some(ErrorCode::CannotOpen) | Some(ErrorCode::NotADatabase) => {
            PollError::Connection(err.to_string())
        }
        Some(ErrorCode::PermissionDenied) => PollError::Auth(err.to_string()),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            PollError::Timeout(0)
        }
        _ => PollError::query(query, err.to_string()),
    }
}
