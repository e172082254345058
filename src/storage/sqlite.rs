use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument};

use super::{QueryResult, Row, StorageDriver};
use crate::common::{Error, Result};

/// A storage driver backed by SQLite.
///
/// One connection per node, guarded by a mutex: SQLite serializes writers
/// anyway and every statement runs to completion before the lock is released.
pub struct SqliteDriver {
    conn: Mutex<Connection>,
}

impl SqliteDriver {
    /// Opens (or creates) a SQLite database at the given file path.
    #[instrument(skip_all, fields(path = %path))]
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        debug!("Opened SQLite storage at {}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        debug!("Opened in-memory SQLite storage");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("storage connection lock poisoned".into()))
    }

    fn json_to_sql(value: &Value) -> SqlValue {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }

    fn sql_to_json(value: ValueRef<'_>) -> Value {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) => Value::Number(n.into()),
            ValueRef::Real(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
        }
    }
}

impl StorageDriver for SqliteDriver {
    #[instrument(skip_all, fields(query = %query))]
    fn execute(&self, query: &str, params: &[Value]) -> Result<QueryResult> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(query)?;
        let bound: Vec<SqlValue> = params.iter().map(Self::json_to_sql).collect();

        if stmt.column_count() == 0 {
            let rows_affected = stmt.execute(params_from_iter(bound.iter()))?;
            debug!(rows_affected, "statement executed");
            return Ok(QueryResult::Affected { rows_affected });
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(bound.iter()))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut map = Row::new();
            for (i, column) in columns.iter().enumerate() {
                map.insert(column.clone(), Self::sql_to_json(row.get_ref(i)?));
            }
            result.push(map);
        }

        debug!("query returned {} rows", result.len());
        Ok(QueryResult::Rows(result))
    }
}
