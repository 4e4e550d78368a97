// Bounded, cancellable dispatch of execution units
//
// Every data source gets one or more lanes. A lane is a task that runs its units
// one after another; each unit holds a permit of the global semaphore while it
// talks to its executor, so saturated dispatchers queue instead of spawning more work.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

use super::cancellation::CancellationToken;
use super::executor::{ExecutorRegistry, ShardExecutor};
use crate::api::middleware::AppError;
use crate::models::{ConnectionMode, ExecutionUnit, QueryResult};

type UnitOp<T> = Arc<dyn Fn(Arc<dyn ShardExecutor>, ExecutionUnit) -> BoxFuture<'static, Result<T, AppError>> + Send + Sync>;

pub struct ExecutionDispatcher {
    executors: ExecutorRegistry,
    semaphore: Arc<Semaphore>,
    max_connections_per_query: usize,
    default_timeout: Duration,
}

impl ExecutionDispatcher {
    /// # Arguments
    /// * `max_concurrent_units` - global cap on units talking to executors at once
    /// * `max_connections_per_query` - units per data source above which lanes are shared
    pub fn new(
        executors: ExecutorRegistry,
        max_concurrent_units: usize,
        max_connections_per_query: usize,
        default_timeout: Duration,
    ) -> Self {
        Self {
            executors,
            semaphore: Arc::new(Semaphore::new(max_concurrent_units.max(1))),
            max_connections_per_query: max_connections_per_query.max(1),
            default_timeout,
        }
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Connection mode for a data source that receives `unit_count` units
    pub fn connection_mode(&self, unit_count: usize) -> ConnectionMode {
        if unit_count <= self.max_connections_per_query {
            ConnectionMode::MemoryStrictly
        } else {
            ConnectionMode::ConnectionStrictly
        }
    }

    /// Run queries; results come back in unit order
    pub async fn query(
        &self,
        units: Vec<ExecutionUnit>,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Vec<QueryResult>, AppError> {
        let op: UnitOp<QueryResult> = Arc::new(|executor: Arc<dyn ShardExecutor>, unit: ExecutionUnit| {
            async move { executor.query(&unit.sql, &unit.parameters).await }.boxed()
        });
        self.dispatch(units, cancel, timeout, op).await
    }

    /// Run updates; affected counts come back in unit order
    pub async fn update(
        &self,
        units: Vec<ExecutionUnit>,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Vec<u64>, AppError> {
        let op: UnitOp<u64> = Arc::new(|executor: Arc<dyn ShardExecutor>, unit: ExecutionUnit| {
            async move { executor.update(&unit.sql, &unit.parameters).await }.boxed()
        });
        self.dispatch(units, cancel, timeout, op).await
    }

    /// Split unit indexes into lanes, grouped by data source
    fn lanes(&self, units: &[ExecutionUnit]) -> Vec<Vec<usize>> {
        let mut by_source: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (index, unit) in units.iter().enumerate() {
            by_source.entry(unit.data_source.as_str()).or_default().push(index);
        }

        let mut lanes = Vec::new();
        for indexes in by_source.into_values() {
            let shared = indexes
                .iter()
                .any(|i| units[*i].connection_mode == ConnectionMode::ConnectionStrictly);
            if shared {
                let count = self.max_connections_per_query.min(indexes.len());
                let mut shared_lanes = vec![Vec::new(); count];
                for (position, index) in indexes.into_iter().enumerate() {
                    shared_lanes[position % count].push(index);
                }
                lanes.extend(shared_lanes);
            } else {
                lanes.extend(indexes.into_iter().map(|i| vec![i]));
            }
        }
        lanes
    }

    async fn dispatch<T: Send + 'static>(
        &self,
        units: Vec<ExecutionUnit>,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
        op: UnitOp<T>,
    ) -> Result<Vec<T>, AppError> {
        if units.is_empty() {
            return Ok(Vec::new());
        }
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        // Resolve every executor up front so a misconfigured unit fails before any I/O
        let mut executors = Vec::with_capacity(units.len());
        for unit in &units {
            executors.push(self.executors.get(&unit.data_source)?);
        }

        let lanes = self.lanes(&units);
        let timeout = timeout.unwrap_or(self.default_timeout);
        debug!("Dispatching {} unit(s) over {} lane(s)", units.len(), lanes.len());

        let mut tasks: JoinSet<Result<Vec<(usize, T)>, AppError>> = JoinSet::new();
        for lane in lanes {
            let work: Vec<(usize, Arc<dyn ShardExecutor>, ExecutionUnit)> = lane
                .into_iter()
                .map(|i| (i, executors[i].clone(), units[i].clone()))
                .collect();
            let semaphore = self.semaphore.clone();
            let op = op.clone();
            tasks.spawn(async move {
                let mut done = Vec::with_capacity(work.len());
                for (index, executor, unit) in work {
                    let _permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| AppError::Internal(format!("Dispatcher semaphore closed: {}", e)))?;
                    let data_source = unit.data_source.clone();
                    let sql = unit.sql.clone();
                    let value = op(executor, unit)
                        .await
                        .map_err(|e| AppError::shard(data_source, sql, e))?;
                    done.push((index, value));
                }
                Ok(done)
            });
        }

        let mut slots: Vec<Option<T>> = (0..units.len()).map(|_| None).collect();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    debug!("Dispatch cancelled, aborted outstanding units");
                    return Err(AppError::Cancelled);
                }
                _ = &mut deadline => {
                    tasks.abort_all();
                    error!("Dispatch timed out after {:?}", timeout);
                    return Err(AppError::Timeout(timeout.as_secs()));
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(values))) => {
                        for (index, value) in values {
                            slots[index] = Some(value);
                        }
                    }
                    Some(Ok(Err(err))) => {
                        tasks.abort_all();
                        error!("Shard execution failed: {}", err);
                        return Err(err);
                    }
                    Some(Err(join_error)) => {
                        tasks.abort_all();
                        return Err(AppError::Internal(format!("Shard task failed: {}", join_error)));
                    }
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| AppError::Internal(format!("Execution unit #{} produced no result", index)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Value;
    use crate::services::execution::SqliteShardExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sleeps, then answers with its own name; tracks peak concurrency
    struct SlowExecutor {
        name: String,
        delay: Duration,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl ShardExecutor for SlowExecutor {
        async fn query(&self, sql: &str, _parameters: &[Value]) -> Result<QueryResult, AppError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(QueryResult::from_rows(
                vec!["sql".to_string()],
                vec![vec![Value::Text(sql.to_string())]],
            ))
        }

        async fn update(&self, _sql: &str, _parameters: &[Value]) -> Result<u64, AppError> {
            tokio::time::sleep(self.delay).await;
            Ok(1)
        }

        fn data_source(&self) -> &str {
            &self.name
        }
    }

    fn slow_registry(names: &[&str], delay: Duration) -> (ExecutorRegistry, Arc<AtomicUsize>) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = ExecutorRegistry::new();
        for name in names {
            registry.register(Arc::new(SlowExecutor {
                name: name.to_string(),
                delay,
                active: active.clone(),
                peak: peak.clone(),
            }));
        }
        (registry, peak)
    }

    fn unit(ds: &str, sql: &str, mode: ConnectionMode) -> ExecutionUnit {
        ExecutionUnit {
            data_source: ds.to_string(),
            sql: sql.to_string(),
            parameters: vec![],
            connection_mode: mode,
        }
    }

    #[tokio::test]
    async fn test_results_keep_unit_order() {
        let (registry, _) = slow_registry(&["ds_0", "ds_1"], Duration::from_millis(5));
        let dispatcher = ExecutionDispatcher::new(registry, 8, 4, Duration::from_secs(5));
        let units = vec![
            unit("ds_1", "a", ConnectionMode::MemoryStrictly),
            unit("ds_0", "b", ConnectionMode::MemoryStrictly),
            unit("ds_1", "c", ConnectionMode::MemoryStrictly),
        ];
        let results = dispatcher.query(units, &CancellationToken::new(), None).await.unwrap();
        let sqls: Vec<Value> = results
            .into_iter()
            .map(|mut r| r.rows.next().unwrap().unwrap().remove(0))
            .collect();
        assert_eq!(sqls, vec![Value::Text("a".into()), Value::Text("b".into()), Value::Text("c".into())]);
    }

    #[tokio::test]
    async fn test_semaphore_bounds_concurrency() {
        let (registry, peak) = slow_registry(&["ds_0", "ds_1", "ds_2", "ds_3"], Duration::from_millis(20));
        let dispatcher = ExecutionDispatcher::new(registry, 2, 4, Duration::from_secs(5));
        let units = (0..8)
            .map(|i| unit(&format!("ds_{}", i % 4), "q", ConnectionMode::MemoryStrictly))
            .collect();
        dispatcher.query(units, &CancellationToken::new(), None).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_connection_strictly_shares_lanes() {
        let (registry, peak) = slow_registry(&["ds_0"], Duration::from_millis(10));
        let dispatcher = ExecutionDispatcher::new(registry, 16, 1, Duration::from_secs(5));
        assert_eq!(dispatcher.connection_mode(1), ConnectionMode::MemoryStrictly);
        assert_eq!(dispatcher.connection_mode(3), ConnectionMode::ConnectionStrictly);
        let units = (0..3)
            .map(|_| unit("ds_0", "q", ConnectionMode::ConnectionStrictly))
            .collect();
        let results = dispatcher.query(units, &CancellationToken::new(), None).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_aborts() {
        let (registry, _) = slow_registry(&["ds_0"], Duration::from_secs(10));
        let dispatcher = ExecutionDispatcher::new(registry, 4, 1, Duration::from_secs(30));
        let result = dispatcher
            .update(
                vec![unit("ds_0", "q", ConnectionMode::MemoryStrictly)],
                &CancellationToken::new(),
                Some(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(AppError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_cancellation_aborts() {
        let (registry, _) = slow_registry(&["ds_0"], Duration::from_secs(10));
        let dispatcher = ExecutionDispatcher::new(registry, 4, 1, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = dispatcher
            .query(vec![unit("ds_0", "q", ConnectionMode::MemoryStrictly)], &cancel, None)
            .await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancellation_stops_source_statement() {
        let executor = Arc::new(SqliteShardExecutor::in_memory("ds_0").unwrap());
        let mut registry = ExecutorRegistry::new();
        registry.register(executor.clone());
        let dispatcher = ExecutionDispatcher::new(registry, 4, 1, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let slow = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 200000000) \
                    SELECT COUNT(*) FROM c";
        let result = dispatcher
            .query(vec![unit("ds_0", slow, ConnectionMode::MemoryStrictly)], &cancel, None)
            .await;
        assert!(matches!(result, Err(AppError::Cancelled)));

        // The shard is usable right away instead of finishing the abandoned scan first
        let follow_up = tokio::time::timeout(Duration::from_secs(2), executor.query("SELECT 1", &[])).await;
        assert!(matches!(follow_up, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn test_shard_failure_carries_identity() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(SqliteShardExecutor::in_memory("ds_0").unwrap()));
        let dispatcher = ExecutionDispatcher::new(registry, 4, 1, Duration::from_secs(5));
        let result = dispatcher
            .query(
                vec![unit("ds_0", "SELECT * FROM orders_0", ConnectionMode::MemoryStrictly)],
                &CancellationToken::new(),
                None,
            )
            .await;
        match result {
            Err(AppError::ShardExecution { data_source, sql, .. }) => {
                assert_eq!(data_source, "ds_0");
                assert_eq!(sql, "SELECT * FROM orders_0");
            }
            other => panic!("unexpected {:?}", other.map(|r| r.len())),
        }
    }

    #[tokio::test]
    async fn test_unknown_data_source_fails_before_io() {
        let dispatcher = ExecutionDispatcher::new(ExecutorRegistry::new(), 4, 1, Duration::from_secs(5));
        let result = dispatcher
            .update(vec![unit("ds_9", "q", ConnectionMode::MemoryStrictly)], &CancellationToken::new(), None)
            .await;
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }
}
