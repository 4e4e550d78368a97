// Shard executor abstraction
//
// One executor per physical data source. Executors own their connections; the
// dispatcher only decides when and how concurrently they are used.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::postgres::PostgresShardExecutor;
use super::sqlite::SqliteShardExecutor;
use crate::api::middleware::AppError;
use crate::models::{QueryResult, Value};
use super::pool::ConnectionPoolManager;

/// Executes physical SQL against one data source
#[async_trait::async_trait]
pub trait ShardExecutor: Send + Sync {
    /// Run a query and return its columns and rows
    async fn query(&self, sql: &str, parameters: &[Value]) -> Result<QueryResult, AppError>;

    /// Run a statement and return the affected row count
    async fn update(&self, sql: &str, parameters: &[Value]) -> Result<u64, AppError>;

    /// Data source name
    fn data_source(&self) -> &str;
}

/// Data source name → executor
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn ShardExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn ShardExecutor>) {
        self.executors.insert(executor.data_source().to_string(), executor);
    }

    /// Build executors for every configured data source
    ///
    /// # Arguments
    /// * `data_sources` - name → URL (`sqlite::memory:`, `sqlite://path`, `postgres://...`)
    /// * `pools` - pool manager backing PostgreSQL data sources
    pub async fn from_urls(
        data_sources: &BTreeMap<String, String>,
        pools: &ConnectionPoolManager,
    ) -> Result<Self, AppError> {
        let mut registry = Self::new();
        for (name, url) in data_sources {
            let executor: Arc<dyn ShardExecutor> = if url == "sqlite::memory:" || url == "sqlite://:memory:" {
                Arc::new(SqliteShardExecutor::in_memory(name)?)
            } else if let Some(path) = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:")) {
                Arc::new(SqliteShardExecutor::open(name, path)?)
            } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
                let pool = pools.get_or_create_pool(name, url).await?;
                Arc::new(PostgresShardExecutor::new(name, pool))
            } else {
                return Err(AppError::Configuration(format!(
                    "Data source '{}' has an unsupported URL scheme",
                    name
                )));
            };
            tracing::info!("Registered data source '{}'", name);
            registry.register(executor);
        }
        Ok(registry)
    }

    pub fn get(&self, data_source: &str) -> Result<Arc<dyn ShardExecutor>, AppError> {
        self.executors
            .get(data_source)
            .cloned()
            .ok_or_else(|| AppError::Configuration(format!("No executor for data source '{}'", data_source)))
    }

    pub fn contains(&self, data_source: &str) -> bool {
        self.executors.contains_key(data_source)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(|k| k.as_str()).collect();
        names.sort();
        names
    }
}
