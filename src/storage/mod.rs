//! Local storage driver interface
//!
//! The coordination engine only needs `execute(query, params)`. Any
//! relational backend that is transactional for a single statement can sit
//! behind [`StorageDriver`]; the SQLite driver is the one shipped here.

pub mod sqlite;

use crate::common::{Result, StorageConfig};
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub use sqlite::SqliteDriver;

/// A row as column name → value
pub type Row = Map<String, Value>;

/// Trait for local storage backends
pub trait StorageDriver: Send + Sync {
    fn execute(&self, query: &str, params: &[Value]) -> Result<QueryResult>;
}

/// Outcome of one statement
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// The statement produced a result set
    Rows(Vec<Row>),
    /// The statement modified data
    Affected { rows_affected: usize },
}

impl QueryResult {
    /// Wire form: rows as an array of objects, writes as
    /// `{"status": "OK", "rows_affected": n}`.
    pub fn to_json(&self) -> Value {
        match self {
            QueryResult::Rows(rows) => {
                Value::Array(rows.iter().cloned().map(Value::Object).collect())
            }
            QueryResult::Affected { rows_affected } => {
                json!({"status": "OK", "rows_affected": rows_affected})
            }
        }
    }

    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            QueryResult::Rows(rows) => Some(rows),
            QueryResult::Affected { .. } => None,
        }
    }
}

/// Async handle over a shared driver
///
/// Drivers are blocking; every call runs on Tokio's blocking pool.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn StorageDriver>,
}

impl Storage {
    pub fn new(backend: Arc<dyn StorageDriver>) -> Self {
        Self { backend }
    }

    /// Open the backend named in the node's storage config.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let driver = match config {
            StorageConfig::Sqlite { path } => SqliteDriver::open(path)?,
            StorageConfig::Memory => SqliteDriver::open_memory()?,
        };
        Ok(Self::new(Arc::new(driver)))
    }

    pub fn new_memory() -> Result<Self> {
        Self::open(&StorageConfig::Memory)
    }

    pub async fn execute(&self, query: &str, params: &[Value]) -> Result<QueryResult> {
        let backend = self.backend.clone();
        let query = query.to_string();
        let params = params.to_vec();
        tokio::task::spawn_blocking(move || backend.execute(&query, &params)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_json() {
        let mut row = Row::new();
        row.insert("id".into(), json!(1));
        let rows = QueryResult::Rows(vec![row]);
        assert_eq!(rows.to_json(), json!([{"id": 1}]));
        assert_eq!(rows.rows().map(|r| r.len()), Some(1));

        let affected = QueryResult::Affected { rows_affected: 2 };
        assert_eq!(affected.to_json(), json!({"status": "OK", "rows_affected": 2}));
        assert!(affected.rows().is_none());
    }

    #[tokio::test]
    async fn test_storage_handle_runs_driver() {
        let storage = Storage::new_memory().unwrap();
        storage
            .execute("CREATE TABLE t (id INTEGER)", &[])
            .await
            .unwrap();
        storage
            .execute("INSERT INTO t VALUES (?1)", &[json!(7)])
            .await
            .unwrap();

        let result = storage.execute("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(result.to_json(), json!([{"id": 7}]));
    }
}
