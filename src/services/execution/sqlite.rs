// SQLite shard executor
//
// rusqlite is synchronous: the connection sits behind an async mutex and every call
// runs on the blocking pool. Blocking work cannot be aborted, so dropping a pending
// call interrupts the statement on the connection instead.

use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{Connection, InterruptHandle};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

use super::executor::ShardExecutor;
use crate::api::middleware::AppError;
use crate::models::{QueryResult, Value};

pub struct SqliteShardExecutor {
    name: String,
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

/// Interrupts the connection's running statement when dropped while armed
///
/// `running` is cleared by the blocking task before it releases the connection,
/// under the same lock the interrupt takes, so a later statement is never hit.
struct InterruptOnDrop {
    handle: Arc<InterruptHandle>,
    running: Arc<StdMutex<bool>>,
    armed: bool,
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if *running {
            tracing::debug!("Interrupting abandoned SQLite statement");
            self.handle.interrupt();
        }
    }
}

impl SqliteShardExecutor {
    fn with_connection(name: &str, conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            name: name.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        }
    }

    pub fn in_memory(name: &str) -> Result<Self, AppError> {
        Ok(Self::with_connection(name, Connection::open_in_memory()?))
    }

    pub fn open(name: &str, path: &str) -> Result<Self, AppError> {
        Ok(Self::with_connection(name, Connection::open(path)?))
    }

    /// Run `work` on the blocking pool while holding the connection
    async fn run_blocking<T, F>(&self, work: F) -> Result<T, AppError>
    where
        F: FnOnce(&Connection) -> Result<T, AppError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone().lock_owned().await;
        let running = Arc::new(StdMutex::new(true));
        let mut interrupt = InterruptOnDrop {
            handle: self.interrupt.clone(),
            running: running.clone(),
            armed: true,
        };

        let result = tokio::task::spawn_blocking(move || {
            let result = work(&conn);
            *running.lock().unwrap_or_else(|p| p.into_inner()) = false;
            drop(conn);
            result
        })
        .await
        .map_err(|e| AppError::Internal(format!("SQLite task failed: {}", e)))?;

        interrupt.armed = false;
        result
    }

    /// Run a batch of statements directly; used to seed shards
    pub async fn execute_batch(&self, sql: &str) -> Result<(), AppError> {
        let sql = sql.to_string();
        self.run_blocking(move |conn| Ok(conn.execute_batch(&sql)?)).await
    }
}

fn to_sqlite(value: &Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::Bool(b) => SqliteValue::Integer(i64::from(*b)),
        Value::Int(v) => SqliteValue::Integer(*v),
        Value::Float(v) => SqliteValue::Real(*v),
        Value::Text(s) => SqliteValue::Text(s.clone()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Float(v),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

#[async_trait::async_trait]
impl ShardExecutor for SqliteShardExecutor {
    async fn query(&self, sql: &str, parameters: &[Value]) -> Result<QueryResult, AppError> {
        let sql = sql.to_string();
        let params: Vec<SqliteValue> = parameters.iter().map(to_sqlite).collect();

        let (columns, rows) = self
            .run_blocking(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
                let width = columns.len();
                let mut cursor = stmt.query(rusqlite::params_from_iter(params.iter()))?;
                let mut rows = Vec::new();
                while let Some(row) = cursor.next()? {
                    let mut values = Vec::with_capacity(width);
                    for idx in 0..width {
                        values.push(from_sqlite(row.get_ref(idx)?));
                    }
                    rows.push(values);
                }
                Ok((columns, rows))
            })
            .await?;

        tracing::debug!("{} returned {} row(s)", self.name, rows.len());
        Ok(QueryResult::from_rows(columns, rows))
    }

    async fn update(&self, sql: &str, parameters: &[Value]) -> Result<u64, AppError> {
        let sql = sql.to_string();
        let params: Vec<SqliteValue> = parameters.iter().map(to_sqlite).collect();

        let affected = self
            .run_blocking(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                Ok(stmt.execute(rusqlite::params_from_iter(params.iter()))?)
            })
            .await?;

        Ok(affected as u64)
    }

    fn data_source(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_query_and_update() {
        let executor = SqliteShardExecutor::in_memory("ds_0").unwrap();
        executor
            .execute_batch("CREATE TABLE t (id INTEGER, name TEXT, score REAL);")
            .await
            .unwrap();
        let affected = executor
            .update(
                "INSERT INTO t (id, name, score) VALUES (?, ?, ?), (2, 'b', NULL)",
                &[Value::Int(1), Value::Text("a".into()), Value::Float(1.5)],
            )
            .await
            .unwrap();
        assert_eq!(affected, 2);

        let result = executor.query("SELECT id, name, score FROM t ORDER BY id", &[]).await.unwrap();
        assert_eq!(result.columns, vec!["id", "name", "score"]);
        let rows: Vec<Vec<Value>> = result.rows.map(|r| r.unwrap()).collect();
        assert_eq!(rows[0], vec![Value::Int(1), Value::Text("a".into()), Value::Float(1.5)]);
        assert_eq!(rows[1][2], Value::Null);
    }

    #[tokio::test]
    async fn test_dropped_query_frees_connection() {
        let executor = SqliteShardExecutor::in_memory("ds_0").unwrap();
        let slow = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 200000000) \
                    SELECT COUNT(*) FROM c";
        let abandoned = tokio::time::timeout(Duration::from_millis(50), executor.query(slow, &[])).await;
        assert!(abandoned.is_err());

        let started = Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(2), executor.query("SELECT 1", &[]))
            .await
            .expect("connection still busy with the abandoned statement")
            .unwrap();
        assert_eq!(result.columns.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_completed_query_is_not_interrupted_later() {
        let executor = SqliteShardExecutor::in_memory("ds_0").unwrap();
        executor.execute_batch("CREATE TABLE t (id INTEGER);").await.unwrap();
        executor.query("SELECT 1", &[]).await.unwrap();
        let affected = executor.update("INSERT INTO t VALUES (1), (2)", &[]).await.unwrap();
        assert_eq!(affected, 2);
    }

    #[tokio::test]
    async fn test_error_surfaces_as_database_error() {
        let executor = SqliteShardExecutor::in_memory("ds_0").unwrap();
        let result = executor.query("SELECT * FROM missing", &[]).await;
        assert!(matches!(result, Err(AppError::Database(_))));
    }
}
