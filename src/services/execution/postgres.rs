// PostgreSQL shard executor using connection pooling

use deadpool_postgres::Pool;
use tokio_postgres::types::Type;
use tokio_postgres::{CancelToken, NoTls, Row};

use super::executor::ShardExecutor;
use crate::api::middleware::AppError;
use crate::models::{QueryResult, Value};
use crate::services::rewrite::splice_parameters;
use crate::validation::locate_placeholders;

pub struct PostgresShardExecutor {
    name: String,
    pool: Pool,
}

impl PostgresShardExecutor {
    pub fn new(name: &str, pool: Pool) -> Self {
        Self {
            name: name.to_string(),
            pool,
        }
    }

    async fn client(&self) -> Result<deadpool_postgres::Client, AppError> {
        self.pool
            .get()
            .await
            .map_err(|e| AppError::Connection(format!("Failed to get connection from pool: {}", e)))
    }
}

/// Holds a pooled client for one statement
///
/// Dropped before `finish`, it sends a server-side cancel and detaches the client
/// from the pool, so the cancel can never reach a statement of a later borrower.
struct StatementGuard {
    client: Option<deadpool_postgres::Client>,
    data_source: String,
}

impl StatementGuard {
    fn new(client: deadpool_postgres::Client, data_source: &str) -> Self {
        Self {
            client: Some(client),
            data_source: data_source.to_string(),
        }
    }

    fn client(&self) -> Result<&deadpool_postgres::Client, AppError> {
        self.client
            .as_ref()
            .ok_or_else(|| AppError::Internal("PostgreSQL client already released".to_string()))
    }

    /// The statement completed; return the client to the pool
    fn finish(mut self) {
        self.client = None;
    }
}

impl Drop for StatementGuard {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        let token: CancelToken = client.cancel_token();
        let detached = deadpool_postgres::Client::take(client);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let data_source = std::mem::take(&mut self.data_source);
        runtime.spawn(async move {
            match token.cancel_query(NoTls).await {
                Ok(()) => tracing::debug!("Cancelled abandoned statement on '{}'", data_source),
                Err(e) => tracing::warn!("Failed to cancel statement on '{}': {}", data_source, e),
            }
            drop(detached);
        });
    }
}

/// Replace `?` and `$n` placeholders with SQL literals
///
/// Values are bound as literals so untyped parameters never clash with the
/// server's inferred column types.
pub fn inline_placeholders(sql: &str, parameters: &[Value]) -> Result<String, AppError> {
    if parameters.is_empty() {
        return Ok(sql.to_string());
    }
    let markers = locate_placeholders(sql)?;
    splice_parameters(sql, &markers, parameters)
}

fn convert_row(row: &Row) -> Vec<Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| match *column.type_() {
            Type::INT2 => row.try_get::<_, Option<i16>>(idx).ok().flatten().map(|v| Value::Int(v.into())),
            Type::INT4 => row.try_get::<_, Option<i32>>(idx).ok().flatten().map(|v| Value::Int(v.into())),
            Type::INT8 => row.try_get::<_, Option<i64>>(idx).ok().flatten().map(Value::Int),
            Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx).ok().flatten().map(|v| Value::Float(v.into())),
            Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).ok().flatten().map(Value::Float),
            Type::BOOL => row.try_get::<_, Option<bool>>(idx).ok().flatten().map(Value::Bool),
            Type::TIMESTAMP => row
                .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::Text(v.to_string())),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::Text(v.to_rfc3339())),
            Type::DATE => row
                .try_get::<_, Option<chrono::NaiveDate>>(idx)
                .ok()
                .flatten()
                .map(|v| Value::Text(v.to_string())),
            _ => match row.try_get::<_, Option<String>>(idx) {
                Ok(v) => v.map(Value::Text),
                Err(_) => Some(Value::Text(format!("<{}>", column.type_().name()))),
            },
        }
        .unwrap_or(Value::Null))
        .collect()
}

#[async_trait::async_trait]
impl ShardExecutor for PostgresShardExecutor {
    async fn query(&self, sql: &str, parameters: &[Value]) -> Result<QueryResult, AppError> {
        let sql = inline_placeholders(sql, parameters)?;
        let guard = StatementGuard::new(self.client().await?, &self.name);
        let result = async {
            let client = guard.client()?;
            let statement = client.prepare(&sql).await?;
            let columns: Vec<String> = statement.columns().iter().map(|c| c.name().to_string()).collect();
            let rows = client.query(&statement, &[]).await?;
            Ok::<_, AppError>((columns, rows))
        }
        .await;
        guard.finish();
        let (columns, rows) = result?;
        let rows: Vec<Vec<Value>> = rows.iter().map(convert_row).collect();
        tracing::debug!("{} returned {} row(s)", self.name, rows.len());
        Ok(QueryResult::from_rows(columns, rows))
    }

    async fn update(&self, sql: &str, parameters: &[Value]) -> Result<u64, AppError> {
        let sql = inline_placeholders(sql, parameters)?;
        let guard = StatementGuard::new(self.client().await?, &self.name);
        let affected = async { Ok::<_, AppError>(guard.client()?.execute(sql.as_str(), &[]).await?) }.await;
        guard.finish();
        affected
    }

    fn data_source(&self) -> &str {
        &self.name
    }
}
