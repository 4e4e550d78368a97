// DataFusion federation engine
//
// Scans every node of every referenced table through the shard executors,
// registers each logic table as an in-memory table and runs the logical SQL on
// DataFusion. Routing, rewriting and merging are bypassed entirely.

use async_trait::async_trait;
use datafusion::datasource::MemTable;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::convert::{batches_to_rows, rows_to_batch};
use super::decider::FederationDecision;
use super::session::FederationSessionFactory;
use crate::api::middleware::AppError;
use crate::models::{BoundStatement, ExecutionUnit, QueryResult, Value};
use crate::services::execution::{CancellationToken, ExecutionDispatcher};
use crate::services::rewrite::{apply_tokens, ParameterRewriter, PlaceholderStyle, SqlToken};

/// Answers statements the merge path cannot
#[async_trait]
pub trait FederationEngine: Send + Sync {
    async fn execute(
        &self,
        statement: &BoundStatement,
        parameters: &[Value],
        decision: &FederationDecision,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<QueryResult, AppError>;
}

/// Logical SQL as DataFusion sees it: parameters inlined, schema qualifiers dropped
pub fn federation_sql(statement: &BoundStatement, parameters: &[Value]) -> Result<String, AppError> {
    let mut tokens: Vec<SqlToken> = statement
        .scopes
        .iter()
        .flat_map(|s| s.tables.iter())
        .filter_map(|t| t.schema)
        .map(|(start, stop)| SqlToken::new(start, stop, ""))
        .collect();
    let inlined = ParameterRewriter::new(PlaceholderStyle::Inline).rewrite(
        &statement.parameter_markers,
        parameters,
        &tokens,
    )?;
    tokens.extend(inlined);
    apply_tokens(&statement.sql, tokens)
}

/// Rows of one logic table gathered from all of its nodes
#[derive(Default)]
struct TableScan {
    columns: Option<Vec<String>>,
    rows: Vec<Vec<Value>>,
}

pub struct DataFusionFederationEngine {
    dispatcher: Arc<ExecutionDispatcher>,
    sessions: FederationSessionFactory,
}

impl DataFusionFederationEngine {
    pub fn new(dispatcher: Arc<ExecutionDispatcher>, sessions: FederationSessionFactory) -> Self {
        Self { dispatcher, sessions }
    }

    async fn scan(
        &self,
        decision: &FederationDecision,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<BTreeMap<String, TableScan>, AppError> {
        let mut per_source: BTreeMap<&str, usize> = BTreeMap::new();
        for node in decision.data_nodes.values().flatten() {
            *per_source.entry(node.data_source.as_str()).or_insert(0) += 1;
        }

        let mut owners = Vec::new();
        let mut units = Vec::new();
        for (table, nodes) in &decision.data_nodes {
            for node in nodes {
                owners.push(table.clone());
                units.push(ExecutionUnit {
                    data_source: node.data_source.clone(),
                    sql: format!("SELECT * FROM {}", node.table),
                    parameters: Vec::new(),
                    connection_mode: self
                        .dispatcher
                        .connection_mode(per_source.get(node.data_source.as_str()).copied().unwrap_or(1)),
                });
            }
        }
        debug!("Federation scans {} node(s)", units.len());

        let results = self.dispatcher.query(units, cancel, timeout).await?;
        let mut scans: BTreeMap<String, TableScan> = decision
            .data_nodes
            .keys()
            .map(|t| (t.clone(), TableScan::default()))
            .collect();
        for (table, result) in owners.into_iter().zip(results) {
            let scan = scans.entry(table.clone()).or_default();
            match &scan.columns {
                Some(columns) if columns.len() != result.columns.len() => {
                    return Err(AppError::Configuration(format!(
                        "Nodes of table '{}' disagree on their columns: {:?} vs {:?}",
                        table, columns, result.columns
                    )));
                }
                Some(_) => {}
                None => scan.columns = Some(result.columns.clone()),
            }
            for row in result.rows {
                scan.rows.push(row?);
            }
        }
        Ok(scans)
    }
}

#[async_trait]
impl FederationEngine for DataFusionFederationEngine {
    async fn execute(
        &self,
        statement: &BoundStatement,
        parameters: &[Value],
        decision: &FederationDecision,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<QueryResult, AppError> {
        let sql = federation_sql(statement, parameters)?;
        info!(
            "Federating ({}): {}",
            decision.reason.as_deref().unwrap_or("requested"),
            sql
        );

        let scans = self.scan(decision, cancel, timeout).await?;
        let session = self.sessions.create_session()?;
        for (table, scan) in scans {
            let Some(columns) = scan.columns else {
                return Err(AppError::Configuration(format!("Table '{}' has no data node", table)));
            };
            let batch = rows_to_batch(&columns, &scan.rows)?;
            let provider = MemTable::try_new(batch.schema(), vec![vec![batch]])?;
            session.register_table(table.to_lowercase().as_str(), Arc::new(provider))?;
        }

        let frame = session.sql(&sql).await?;
        let columns: Vec<String> = frame.schema().fields().iter().map(|f| f.name().clone()).collect();
        let limit = timeout.unwrap_or_else(|| self.dispatcher.default_timeout());
        let batches = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            collected = tokio::time::timeout(limit, frame.collect()) => match collected {
                Ok(batches) => batches?,
                Err(_) => return Err(AppError::Timeout(limit.as_secs())),
            },
        };
        let rows = batches_to_rows(&batches)?;
        debug!("Federation produced {} row(s)", rows.len());
        Ok(QueryResult::from_rows(columns, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::condition_extractor::ConditionExtractor;
    use crate::services::federation::FederationDecider;
    use crate::services::router::ShardingRouter;
    use crate::test_support::{orders_rules, seeded_shards, OrderRow};
    use crate::validation::SqlBinder;

    const ORDERS: &[OrderRow] = &[
        (1, 1, "paid", 10),
        (2, 2, "new", 20),
        (3, 5, "paid", 30),
        (4, 6, "paid", 5),
        (5, 2, "new", 1),
    ];

    async fn federate(sql: &str, parameters: &[Value]) -> Vec<Vec<Value>> {
        let rules = orders_rules();
        let statement = SqlBinder::new().bind(sql).unwrap();
        let conditions = ConditionExtractor::new().extract(&statement, parameters, &rules, None).unwrap();
        let route = ShardingRouter::default().route(&statement, &conditions, &rules).unwrap();
        let decision = FederationDecider::new().decide(&statement, &route, &rules);
        assert!(decision.use_federation, "{} should federate", sql);

        let dispatcher = Arc::new(ExecutionDispatcher::new(
            seeded_shards(ORDERS).await,
            8,
            1,
            Duration::from_secs(10),
        ));
        let engine = DataFusionFederationEngine::new(dispatcher, FederationSessionFactory::default());
        let result = engine
            .execute(&statement, parameters, &decision, &CancellationToken::new(), None)
            .await
            .unwrap();
        result.rows.collect::<Result<Vec<_>, _>>().unwrap()
    }

    #[test]
    fn test_federation_sql_inlines_and_unqualifies() {
        let statement = SqlBinder::new()
            .bind("SELECT * FROM logic_db.orders WHERE status = ? AND user_id > ?")
            .unwrap();
        let sql = federation_sql(&statement, &[Value::Text("it's".into()), Value::Int(3)]).unwrap();
        assert_eq!(sql, "SELECT * FROM orders WHERE status = 'it''s' AND user_id > 3");
    }

    #[tokio::test]
    async fn test_distinct_count_across_shards() {
        let rows = federate("SELECT COUNT(DISTINCT status) AS n FROM orders", &[]).await;
        assert_eq!(rows, vec![vec![Value::Int(2)]]);
    }

    #[tokio::test]
    async fn test_having_sees_global_groups() {
        let rows = federate(
            "SELECT user_id, SUM(amount) AS total FROM orders GROUP BY user_id HAVING SUM(amount) > ? ORDER BY user_id",
            &[Value::Int(10)],
        )
        .await;
        assert_eq!(
            rows,
            vec![vec![Value::Int(2), Value::Int(21)], vec![Value::Int(5), Value::Int(30)]]
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_scan() {
        let rules = orders_rules();
        let statement = SqlBinder::new().bind("SELECT COUNT(DISTINCT status) FROM orders").unwrap();
        let route = ShardingRouter::default()
            .route(&statement, &Default::default(), &rules)
            .unwrap();
        let decision = FederationDecider::new().decide(&statement, &route, &rules);
        let dispatcher = Arc::new(ExecutionDispatcher::new(seeded_shards(ORDERS).await, 8, 1, Duration::from_secs(10)));
        let engine = DataFusionFederationEngine::new(dispatcher, FederationSessionFactory::default());
        let token = CancellationToken::new();
        token.cancel();
        let result = engine.execute(&statement, &[], &decision, &token, None).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }
}
