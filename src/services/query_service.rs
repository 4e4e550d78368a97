// Statement kernel
//
// Runs one statement through bind → key generation → condition extraction →
// routing → federation decision → rewrite, then dispatches and merges, or hands
// the statement to the federation engine. One rule snapshot is taken at the start
// and carried through the whole statement.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::api::middleware::AppError;
use crate::config::EngineConfig;
use crate::models::{BoundStatement, ExecutionUnit, RouteContext, StatementKind, Value};
use crate::services::condition_extractor::{ConditionExtractor, GeneratedKeys};
use crate::services::execution::{CancellationToken, ExecutionDispatcher};
use crate::services::federation::{FederationDecider, FederationDecision, FederationEngine};
use crate::services::merge::{MergeContext, MergeEngine, MergedCursor};
use crate::services::rewrite::{inline_parameters, RewriteContext, RewriteEngine, RewrittenUnit};
use crate::services::router::ShardingRouter;
use crate::services::rule_registry::{RuleRegistry, RuleSnapshot};
use crate::validation::SqlBinder;

#[derive(Debug, Clone)]
pub struct KernelSettings {
    pub sql_show: bool,
    pub federation_enabled: bool,
    pub preferred_data_source: Option<String>,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            sql_show: false,
            federation_enabled: true,
            preferred_data_source: None,
        }
    }
}

impl From<&EngineConfig> for KernelSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            sql_show: config.sql_show,
            federation_enabled: config.sql_federation_enabled,
            preferred_data_source: config.unicast_preferred_data_source.clone(),
        }
    }
}

/// Routing counters, readable while statements run
#[derive(Debug, Default)]
pub struct RouteStatistics {
    statements: AtomicU64,
    full_scans: AtomicU64,
    federated: AtomicU64,
    empty_routes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteStatisticsSnapshot {
    pub statements: u64,
    pub full_scans: u64,
    pub federated: u64,
    pub empty_routes: u64,
}

impl RouteStatistics {
    fn record(&self, prepared: &PreparedStatement) {
        self.statements.fetch_add(1, Ordering::Relaxed);
        if prepared.context.route.full_scan {
            self.full_scans.fetch_add(1, Ordering::Relaxed);
        }
        if prepared.context.decision.use_federation {
            self.federated.fetch_add(1, Ordering::Relaxed);
        } else if prepared.context.route.is_empty() {
            self.empty_routes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RouteStatisticsSnapshot {
        RouteStatisticsSnapshot {
            statements: self.statements.load(Ordering::Relaxed),
            full_scans: self.full_scans.load(Ordering::Relaxed),
            federated: self.federated.load(Ordering::Relaxed),
            empty_routes: self.empty_routes.load(Ordering::Relaxed),
        }
    }
}

/// Everything derived for one statement, passed explicitly between stages
#[derive(Debug, Clone)]
pub struct StatementContext {
    pub statement: BoundStatement,
    pub parameters: Vec<Value>,
    pub rules: RuleSnapshot,
    pub generated_keys: Option<GeneratedKeys>,
    pub route: RouteContext,
    pub decision: FederationDecision,
}

/// A statement ready to run: physical units, or a federation decision
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub context: StatementContext,
    /// Empty when the statement is federated or routes nowhere
    pub units: Vec<RewrittenUnit>,
    /// Merge shape of a direct query
    pub merge: Option<MergeContext>,
}

impl PreparedStatement {
    pub fn is_query(&self) -> bool {
        self.context.statement.kind == StatementKind::Select
    }

    /// Physical units with the connection mode their data source gets
    fn execution_units(&self, dispatcher: &ExecutionDispatcher) -> Vec<ExecutionUnit> {
        let per_source = self.context.route.units_per_data_source();
        self.units
            .iter()
            .map(|unit| {
                let data_source = unit.unit.data_source_name();
                ExecutionUnit {
                    data_source: data_source.to_string(),
                    sql: unit.sql.clone(),
                    parameters: unit.parameters.clone(),
                    connection_mode: dispatcher.connection_mode(per_source.get(data_source).copied().unwrap_or(1)),
                }
            })
            .collect()
    }

    /// Column labels of a query that reached no unit
    fn empty_columns(&self) -> Vec<String> {
        self.context
            .statement
            .root()
            .projections
            .iter()
            .map(|p| p.label().unwrap_or(&p.text).to_string())
            .collect()
    }
}

pub enum ExecutionOutcome {
    Query(MergedCursor),
    Update { affected_rows: u64 },
}

pub struct QueryService {
    rules: Arc<RuleRegistry>,
    dispatcher: Arc<ExecutionDispatcher>,
    federation: Arc<dyn FederationEngine>,
    router: ShardingRouter,
    settings: KernelSettings,
    statistics: RouteStatistics,
}

impl QueryService {
    pub fn new(
        rules: Arc<RuleRegistry>,
        dispatcher: Arc<ExecutionDispatcher>,
        federation: Arc<dyn FederationEngine>,
        settings: KernelSettings,
    ) -> Self {
        Self {
            rules,
            dispatcher,
            federation,
            router: ShardingRouter::new(settings.preferred_data_source.clone()),
            settings,
            statistics: RouteStatistics::default(),
        }
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    pub fn statistics(&self) -> RouteStatisticsSnapshot {
        self.statistics.snapshot()
    }

    /// Data sources with a registered executor
    pub fn data_sources(&self) -> Vec<&str> {
        self.dispatcher.executors().names()
    }

    /// Bind, route and rewrite a statement without touching any data source
    ///
    /// # Arguments
    /// * `sql` - Logical SQL text
    /// * `parameters` - Placeholder values in order
    ///
    /// # Returns
    /// * `Result<PreparedStatement, AppError>` - Physical units or the federation decision
    pub fn prepare(&self, sql: &str, parameters: &[Value]) -> Result<PreparedStatement, AppError> {
        let statement = SqlBinder::new().bind(sql)?;
        if parameters.len() != statement.parameter_count {
            return Err(AppError::Validation(format!(
                "Statement has {} placeholder(s) but {} parameter(s) were given",
                statement.parameter_count,
                parameters.len()
            )));
        }

        let snapshot = self.rules.snapshot();
        let rules = snapshot.model.as_ref();
        let generated_keys = GeneratedKeys::generate(&statement, rules)?;
        let conditions = ConditionExtractor::new().extract(&statement, parameters, rules, generated_keys.as_ref())?;
        let route = self.router.route(&statement, &conditions, rules)?;
        let decision = FederationDecider::new().decide(&statement, &route, rules);

        let (units, merge) = if decision.use_federation {
            info!(
                "Statement federated: {}",
                decision.reason.as_deref().unwrap_or("unspecified")
            );
            (Vec::new(), None)
        } else {
            let units = RewriteEngine::new().rewrite(&RewriteContext {
                statement: &statement,
                parameters,
                route: &route,
                generated_keys: generated_keys.as_ref(),
            })?;
            let merge = if statement.kind == StatementKind::Select || statement.kind.is_dml() {
                Some(MergeContext::new(&statement, parameters, units.len(), rules)?)
            } else {
                None
            };
            (units, merge)
        };

        if self.settings.sql_show {
            info!("Logic SQL: {}", inline_parameters(&statement, parameters).unwrap_or_else(|_| sql.to_string()));
            for unit in &units {
                info!("Actual SQL: {} ::: {} ::: {:?}", unit.unit.data_source_name(), unit.sql, unit.parameters);
            }
        }

        Ok(PreparedStatement {
            context: StatementContext {
                statement,
                parameters: parameters.to_vec(),
                rules: snapshot,
                generated_keys,
                route,
                decision,
            },
            units,
            merge,
        })
    }

    /// Run a statement to completion of its dispatch
    ///
    /// # Arguments
    /// * `sql` - Logical SQL text
    /// * `parameters` - Placeholder values in order
    /// * `cancel` - Token that aborts in-flight units and the returned cursor
    /// * `timeout` - Overrides the dispatcher's default statement timeout
    pub async fn execute(
        &self,
        sql: &str,
        parameters: &[Value],
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutcome, AppError> {
        let prepared = self.prepare(sql, parameters)?;
        self.statistics.record(&prepared);
        let context = &prepared.context;

        if context.decision.use_federation {
            if !self.settings.federation_enabled {
                return Err(AppError::Unsupported(format!(
                    "Statement needs the federation engine ({}) but federation is disabled",
                    context.decision.reason.as_deref().unwrap_or("unspecified")
                )));
            }
            let result = self
                .federation
                .execute(&context.statement, &context.parameters, &context.decision, cancel, timeout)
                .await?;
            return Ok(ExecutionOutcome::Query(
                MergedCursor::from_result(result).with_cancellation(cancel.clone()),
            ));
        }

        if prepared.units.is_empty() {
            debug!("Statement routed to no unit");
            return Ok(if prepared.is_query() {
                let merge = prepared.merge.clone().unwrap_or_default();
                ExecutionOutcome::Query(MergeEngine::new().merge_empty(
                    prepared.empty_columns(),
                    &merge,
                    Some(cancel.clone()),
                )?)
            } else {
                ExecutionOutcome::Update { affected_rows: 0 }
            });
        }

        let units = prepared.execution_units(&self.dispatcher);
        let merge = prepared.merge.clone().unwrap_or_default();
        if prepared.is_query() {
            let results = self.dispatcher.query(units, cancel, timeout).await?;
            let cursor = MergeEngine::new().merge(results, &merge, Some(cancel.clone()))?;
            Ok(ExecutionOutcome::Query(cursor))
        } else {
            let counts = self.dispatcher.update(units, cancel, timeout).await?;
            let affected_rows = if prepared.merge.is_some() {
                MergeEngine::new().merge_updates(&counts, &merge)
            } else {
                // DDL and session statements report per-unit status only
                0
            };
            Ok(ExecutionOutcome::Update { affected_rows })
        }
    }

    /// Units grouped by data source, for previews
    pub fn units_by_data_source(prepared: &PreparedStatement) -> BTreeMap<String, Vec<&RewrittenUnit>> {
        let mut grouped: BTreeMap<String, Vec<&RewrittenUnit>> = BTreeMap::new();
        for unit in &prepared.units {
            grouped
                .entry(unit.unit.data_source_name().to_string())
                .or_default()
                .push(unit);
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuleConfig;
    use crate::services::execution::{ExecutorRegistry, SqliteShardExecutor};
    use crate::services::federation::{DataFusionFederationEngine, FederationSessionFactory};
    use crate::test_support::{orders_rules, seeded_shards, seeded_shards_at, OrderRow};

    const ORDERS: &[OrderRow] = &[
        (10, 1, "paid", 10),
        (3, 2, "new", 20),
        (7, 3, "paid", 30),
        (1, 4, "paid", 5),
        (12, 5, "new", 1),
        (2, 6, "paid", 4),
        (9, 7, "new", 8),
        (4, 8, "paid", 2),
    ];

    fn orders_config() -> RuleConfig {
        orders_rules().config().clone()
    }

    fn build(registry: ExecutorRegistry, config: RuleConfig, settings: KernelSettings) -> QueryService {
        let dispatcher = Arc::new(ExecutionDispatcher::new(registry, 8, 1, Duration::from_secs(10)));
        let federation = Arc::new(DataFusionFederationEngine::new(
            dispatcher.clone(),
            FederationSessionFactory::default(),
        ));
        QueryService::new(
            Arc::new(RuleRegistry::from_config(config).unwrap()),
            dispatcher,
            federation,
            settings,
        )
    }

    async fn service() -> QueryService {
        build(seeded_shards(ORDERS).await, orders_config(), KernelSettings::default())
    }

    async fn query(service: &QueryService, sql: &str, parameters: &[Value]) -> Vec<Vec<Value>> {
        match service
            .execute(sql, parameters, &CancellationToken::new(), None)
            .await
            .unwrap()
        {
            ExecutionOutcome::Query(cursor) => cursor.collect_rows().unwrap(),
            ExecutionOutcome::Update { .. } => panic!("{} did not return rows", sql),
        }
    }

    async fn update(service: &QueryService, sql: &str, parameters: &[Value]) -> u64 {
        match service
            .execute(sql, parameters, &CancellationToken::new(), None)
            .await
            .unwrap()
        {
            ExecutionOutcome::Update { affected_rows } => affected_rows,
            ExecutionOutcome::Query(_) => panic!("{} returned rows", sql),
        }
    }

    fn ints(rows: &[Vec<Value>], column: usize) -> Vec<i64> {
        rows.iter().map(|r| r[column].as_i64().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_equality_routes_to_one_shard() {
        let service = service().await;
        let prepared = service.prepare("SELECT * FROM orders WHERE user_id = 7", &[]).unwrap();
        assert_eq!(prepared.units.len(), 1);
        assert_eq!(prepared.units[0].unit.data_source_name(), "ds_3");
        assert_eq!(prepared.units[0].unit.actual_table("orders"), Some("orders_3"));

        let rows = query(&service, "SELECT order_id FROM orders WHERE user_id = ?", &[Value::Int(7)]).await;
        assert_eq!(ints(&rows, 0), vec![9]);
    }

    #[tokio::test]
    async fn test_global_order_with_limit() {
        let service = service().await;
        let rows = query(&service, "SELECT * FROM orders ORDER BY order_id LIMIT 5", &[]).await;
        assert_eq!(ints(&rows, 0), vec![1, 2, 3, 4, 7]);

        let rows = query(&service, "SELECT order_id FROM orders ORDER BY order_id DESC LIMIT ?, ?", &[Value::Int(1), Value::Int(2)]).await;
        assert_eq!(ints(&rows, 0), vec![10, 9]);
    }

    #[tokio::test]
    async fn test_group_counts_sum_across_shards() {
        // user 1 is denormalised into two shards
        let placed = vec![
            (1, (1, 1, "paid", 10)),
            (3, (2, 1, "paid", 20)),
            (3, (3, 3, "new", 5)),
            (2, (4, 2, "new", 7)),
        ];
        let service = build(seeded_shards_at(&placed).await, orders_config(), KernelSettings::default());
        let rows = query(&service, "SELECT user_id, COUNT(*) FROM orders GROUP BY user_id", &[]).await;
        assert_eq!(
            rows,
            vec![
                vec![Value::Int(1), Value::Int(2)],
                vec![Value::Int(2), Value::Int(1)],
                vec![Value::Int(3), Value::Int(1)],
            ]
        );
    }

    #[tokio::test]
    async fn test_avg_rebuilt_across_shards() {
        let service = service().await;
        let rows = query(&service, "SELECT status, AVG(amount) FROM orders GROUP BY status ORDER BY status", &[]).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Text("new".into()));
        // (20 + 1 + 8) / 3, not the mean of per-shard means
        assert_eq!(rows[0][1], Value::Float(29.0 / 3.0));
        assert_eq!(rows[0].len(), 2);
    }

    #[tokio::test]
    async fn test_unbound_join_goes_to_federation() {
        let service = service().await;
        let prepared = service
            .prepare("SELECT o.order_id FROM orders o JOIN users u ON o.order_id = u.user_id", &[])
            .unwrap();
        assert!(prepared.context.decision.use_federation);
        assert!(prepared.units.is_empty());

        let rows = query(&service, "SELECT COUNT(DISTINCT status) FROM orders", &[]).await;
        assert_eq!(rows, vec![vec![Value::Int(2)]]);
        assert_eq!(service.statistics().federated, 1);
    }

    #[tokio::test]
    async fn test_unmatched_delete_affects_nothing() {
        let config: RuleConfig = serde_json::from_value(serde_json::json!({
            "data_sources": ["ds_0", "ds_1", "ds_2"],
            "tables": [{
                "logic_table": "orders",
                "actual_data_nodes": "ds_${0..2}.orders_${0..2}",
                "database_strategy": {"sharding_column": "user_id", "algorithm_name": "mod4"},
                "table_strategy": {"sharding_column": "user_id", "algorithm_name": "mod4"}
            }],
            "sharding_algorithms": {"mod4": {"type": "MOD", "sharding_count": 4}}
        }))
        .unwrap();
        let mut registry = ExecutorRegistry::new();
        for ds in ["ds_0", "ds_1", "ds_2"] {
            registry.register(Arc::new(SqliteShardExecutor::in_memory(ds).unwrap()));
        }
        let service = build(registry, config, KernelSettings::default());
        assert_eq!(update(&service, "DELETE FROM orders WHERE user_id = 999", &[]).await, 0);
        assert_eq!(service.statistics().empty_routes, 1);
    }

    #[tokio::test]
    async fn test_bare_aggregates_over_contradictory_route() {
        let service = service().await;
        let prepared = service
            .prepare("SELECT COUNT(*) FROM orders WHERE user_id = 1 AND user_id = 2", &[])
            .unwrap();
        assert!(prepared.units.is_empty());

        let rows = query(&service, "SELECT COUNT(*) FROM orders WHERE user_id = 1 AND user_id = 2", &[]).await;
        assert_eq!(rows, vec![vec![Value::Int(0)]]);

        let rows = query(
            &service,
            "SELECT COUNT(*) AS n, SUM(amount), MAX(amount) AS top FROM orders WHERE user_id = ? AND user_id = ?",
            &[Value::Int(1), Value::Int(2)],
        )
        .await;
        assert_eq!(rows, vec![vec![Value::Int(0), Value::Null, Value::Null]]);

        // Grouped and plain queries over nothing stay empty
        let rows = query(&service, "SELECT status, COUNT(*) FROM orders WHERE user_id = 1 AND user_id = 2 GROUP BY status", &[]).await;
        assert!(rows.is_empty());
        let rows = query(&service, "SELECT * FROM orders WHERE user_id = 1 AND user_id = 2", &[]).await;
        assert!(rows.is_empty());
        assert_eq!(service.statistics().empty_routes, 4);
    }

    #[tokio::test]
    async fn test_insert_generates_keys_then_reads_back() {
        let service = service().await;
        let inserted = update(
            &service,
            "INSERT INTO orders (user_id, status, amount) VALUES (?, 'new', 3), (6, 'paid', 4)",
            &[Value::Int(1)],
        )
        .await;
        assert_eq!(inserted, 2);

        let rows = query(&service, "SELECT COUNT(*) FROM orders", &[]).await;
        assert_eq!(rows, vec![vec![Value::Int(ORDERS.len() as i64 + 2)]]);
        let rows = query(&service, "SELECT order_id FROM orders WHERE user_id = 1 AND amount = 3", &[]).await;
        assert!(rows[0][0].as_i64().unwrap() > 1_000_000);
    }

    #[tokio::test]
    async fn test_update_counts() {
        let service = service().await;
        assert_eq!(update(&service, "UPDATE orders SET amount = amount + 1 WHERE status = 'new'", &[]).await, 3);
        assert_eq!(update(&service, "UPDATE dict SET label = 'x' WHERE code = 'paid'", &[]).await, 1);
    }

    #[tokio::test]
    async fn test_federation_disabled_is_unsupported() {
        let settings = KernelSettings {
            federation_enabled: false,
            ..Default::default()
        };
        let service = build(seeded_shards(ORDERS).await, orders_config(), settings);
        let result = service
            .execute("SELECT COUNT(DISTINCT status) FROM orders", &[], &CancellationToken::new(), None)
            .await;
        assert!(matches!(result, Err(AppError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_parameter_count_checked() {
        let service = service().await;
        let result = service.prepare("SELECT * FROM orders WHERE user_id = ?", &[]);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_cancelled_statement() {
        let service = service().await;
        let token = CancellationToken::new();
        token.cancel();
        let result = service.execute("SELECT * FROM orders", &[], &token, None).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn test_rule_swap_applies_to_next_statement() {
        let service = service().await;
        let held = service.prepare("SELECT * FROM orders", &[]).unwrap();
        let mut config = orders_config();
        config.broadcast_tables.push("audit".to_string());
        let version = service.rules().swap(config).unwrap();
        assert_eq!(held.context.rules.version, 1);
        let next = service.prepare("SELECT * FROM orders", &[]).unwrap();
        assert_eq!(next.context.rules.version, version);
        assert_eq!(held.units.len(), next.units.len());
    }

    #[tokio::test]
    async fn test_full_scans_counted() {
        let service = service().await;
        query(&service, "SELECT * FROM orders", &[]).await;
        query(&service, "SELECT * FROM orders WHERE user_id = 1", &[]).await;
        let stats = service.statistics();
        assert_eq!(stats.statements, 2);
        assert_eq!(stats.full_scans, 1);
    }
}
