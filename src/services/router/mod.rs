// Routing engine
//
// `route` is a pure function of (statement, conditions, rules): it never mutates the
// rule model and keeps no state between calls, so equal inputs give equal routes.

mod sharded;

use tracing::{debug, warn};

use crate::api::middleware::AppError;
use crate::models::{BoundStatement, RouteContext, RouteMapper, RouteUnit, RuleModel, ShardingConditions, StatementKind};

#[derive(Debug, Clone, Default)]
pub struct ShardingRouter {
    /// Unicast target when it carries every referenced table
    preferred_data_source: Option<String>,
}

impl ShardingRouter {
    pub fn new(preferred_data_source: Option<String>) -> Self {
        Self { preferred_data_source }
    }

    /// Compute the route units of a statement
    ///
    /// # Returns
    /// Sorted, duplicate-free units. An empty context is a valid result for DML and
    /// queries; DDL that resolves to no node is an `EmptyRoute` error.
    pub fn route(
        &self,
        statement: &BoundStatement,
        conditions: &ShardingConditions,
        rules: &RuleModel,
    ) -> Result<RouteContext, AppError> {
        let tables = statement.table_names();
        let has_sharded = tables.iter().any(|t| rules.is_sharded(t));

        let context = match statement.kind {
            StatementKind::Other => self.broadcast_databases(rules),
            StatementKind::Ddl if tables.is_empty() => self.broadcast_databases(rules),
            StatementKind::Ddl => self.broadcast_tables(&tables, rules),
            StatementKind::Insert if has_sharded => sharded::route_insert(statement, conditions, rules)?,
            _ if has_sharded => sharded::route_sharded(statement, &tables, conditions, rules)?,
            kind if kind.is_dml() && !tables.is_empty() && tables.iter().all(|t| rules.is_broadcast(t)) => {
                self.broadcast_tables(&tables, rules)
            }
            _ => self.unicast(&tables, rules)?,
        };

        if statement.kind == StatementKind::Ddl && context.is_empty() {
            return Err(AppError::EmptyRoute(format!(
                "DDL on {:?} resolved to no data node",
                tables
            )));
        }
        if context.full_scan {
            warn!("Full-scan route over {} unit(s) for tables {:?}", context.len(), tables);
        }
        for unit in context.units() {
            debug!("Route unit {} {:?}", unit.data_source_name(), unit.table_mappers);
        }
        Ok(context)
    }

    /// Every data source, no table mapping
    fn broadcast_databases(&self, rules: &RuleModel) -> RouteContext {
        let mut context = RouteContext::new();
        for ds in rules.data_sources() {
            context.add(RouteUnit::new(ds.clone(), Vec::new()));
        }
        context
    }

    /// Every actual node of every table: sharded tables per node, others per data source
    fn broadcast_tables(&self, tables: &[String], rules: &RuleModel) -> RouteContext {
        let mut context = RouteContext::new();
        for table in tables {
            match rules.table_rule(table) {
                Some(rule) => {
                    for node in &rule.actual_data_nodes {
                        context.add(RouteUnit::new(
                            node.data_source.clone(),
                            vec![RouteMapper::new(table.clone(), node.table.clone())],
                        ));
                    }
                }
                None => {
                    for ds in rules.data_sources_for_table(table) {
                        context.add(RouteUnit::new(ds, vec![RouteMapper::new(table.clone(), table.clone())]));
                    }
                }
            }
        }
        context
    }

    /// One data source carrying every referenced table
    fn unicast(&self, tables: &[String], rules: &RuleModel) -> Result<RouteContext, AppError> {
        let mut candidates: Vec<String> = rules.data_sources().to_vec();
        for table in tables {
            let holders = rules.data_sources_for_table(table);
            candidates.retain(|ds| holders.contains(ds));
        }

        let chosen = match &self.preferred_data_source {
            Some(preferred) if candidates.contains(preferred) => Some(preferred.clone()),
            _ => candidates.into_iter().min(),
        };
        let Some(ds) = chosen else {
            return Err(AppError::AmbiguousRoute(format!(
                "Tables {:?} are not colocated on any single data source",
                tables
            )));
        };

        let mut context = RouteContext::new();
        context.add(RouteUnit::new(
            ds,
            tables.iter().map(|t| RouteMapper::new(t.clone(), t.clone())).collect(),
        ));
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuleConfig;
    use crate::services::condition_extractor::{ConditionExtractor, GeneratedKeys};
    use crate::test_support::{orders_rules, rules_from_json};
    use crate::validation::SqlBinder;
    use crate::models::Value;

    fn route_with(sql: &str, params: &[Value], rules: &RuleModel) -> Result<RouteContext, AppError> {
        let statement = SqlBinder::new().bind(sql)?;
        let keys = GeneratedKeys::generate(&statement, rules)?;
        let conditions = ConditionExtractor::new().extract(&statement, params, rules, keys.as_ref())?;
        ShardingRouter::default().route(&statement, &conditions, rules)
    }

    fn route(sql: &str) -> RouteContext {
        route_with(sql, &[], &orders_rules()).unwrap()
    }

    fn units(ctx: &RouteContext) -> Vec<(String, Vec<String>)> {
        ctx.units()
            .map(|u| {
                (
                    u.data_source_name().to_string(),
                    u.table_mappers.iter().map(|m| m.actual_name.clone()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_single_shard_equality() {
        let ctx = route("SELECT * FROM orders WHERE user_id = 7");
        assert_eq!(units(&ctx), vec![("ds_3".to_string(), vec!["orders_3".to_string()])]);
        assert!(!ctx.full_scan);
    }

    #[test]
    fn test_route_is_deterministic() {
        let sql = "SELECT * FROM orders WHERE user_id IN (1, 2, 5) OR order_id > 10";
        assert_eq!(route(sql), route(sql));
    }

    #[test]
    fn test_in_list_collapses_to_same_shard() {
        let ctx = route("SELECT * FROM orders WHERE user_id IN (1, 5, 9)");
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_full_scan_flagged() {
        let ctx = route("SELECT * FROM orders");
        assert_eq!(ctx.len(), 16);
        assert!(ctx.full_scan);
    }

    #[test]
    fn test_or_branches_union() {
        let ctx = route("SELECT * FROM orders WHERE user_id = 1 OR user_id = 2");
        assert_eq!(
            units(&ctx),
            vec![
                ("ds_1".to_string(), vec!["orders_1".to_string()]),
                ("ds_2".to_string(), vec!["orders_2".to_string()]),
            ]
        );
    }

    #[test]
    fn test_binding_tables_align() {
        let ctx = route("SELECT * FROM orders o JOIN order_items i ON o.order_id = i.order_id");
        assert_eq!(ctx.len(), 16);
        for unit in ctx.units() {
            let o = unit.actual_table("orders").unwrap();
            let i = unit.actual_table("order_items").unwrap();
            assert_eq!(o.trim_start_matches("orders_"), i.trim_start_matches("order_items_"));
        }

        let ctx = route("SELECT * FROM orders o JOIN order_items i ON o.user_id = i.user_id WHERE o.user_id = 2");
        assert_eq!(
            units(&ctx),
            vec![("ds_2".to_string(), vec!["orders_2".to_string(), "order_items_2".to_string()])]
        );
    }

    #[test]
    fn test_binding_mismatch_is_ambiguous() {
        let result = route_with(
            "SELECT * FROM orders o JOIN order_items i ON o.order_id = i.order_id WHERE o.user_id = 1 AND i.user_id = 2",
            &[],
            &orders_rules(),
        );
        assert!(matches!(result, Err(AppError::AmbiguousRoute(_))));
    }

    #[test]
    fn test_unbound_tables_cartesian() {
        let ctx = route("SELECT * FROM orders o, users u WHERE o.user_id = 1 AND u.user_id = 1");
        // users is sharded over ds_${0..3}.users_${0..1} by user_id % 2 on tables
        assert_eq!(
            units(&ctx),
            vec![("ds_1".to_string(), vec!["orders_1".to_string(), "users_1".to_string()])]
        );
    }

    #[test]
    fn test_broadcast_and_unicast() {
        let ctx = route("SELECT * FROM dict");
        assert_eq!(units(&ctx), vec![("ds_0".to_string(), vec!["dict".to_string()])]);

        let ctx = route("UPDATE dict SET label = 'x'");
        assert_eq!(ctx.len(), 4);

        let ctx = route("SELECT * FROM orders o JOIN dict d ON o.status = d.code WHERE o.user_id = 3");
        assert_eq!(
            units(&ctx),
            vec![("ds_3".to_string(), vec!["orders_3".to_string(), "dict".to_string()])]
        );
    }

    #[test]
    fn test_preferred_unicast() {
        let rules = orders_rules();
        let statement = SqlBinder::new().bind("SELECT 1").unwrap();
        let ctx = ShardingRouter::new(Some("ds_2".to_string()))
            .route(&statement, &ShardingConditions::default(), &rules)
            .unwrap();
        assert_eq!(ctx.units().next().unwrap().data_source_name(), "ds_2");
    }

    #[test]
    fn test_ddl_broadcast() {
        let ctx = route("CREATE TABLE orders (order_id BIGINT, user_id INT)");
        assert_eq!(ctx.len(), 16);
        let ctx = route("SET search_path = public");
        assert_eq!(ctx.len(), 4);
        assert!(ctx.units().all(|u| u.table_mappers.is_empty()));
    }

    #[test]
    fn test_insert_rows_routed_individually() {
        let ctx = route("INSERT INTO orders (user_id, status) VALUES (1, 'a'), (2, 'b'), (5, 'c')");
        assert_eq!(ctx.len(), 2);
        let unit = ctx.units().next().unwrap().clone();
        assert_eq!(unit.data_source_name(), "ds_1");
        assert_eq!(ctx.insert_rows(&unit), vec![0, 2]);
    }

    #[test]
    fn test_insert_without_sharding_value_rejected() {
        let result = route_with("INSERT INTO orders (status) VALUES ('a')", &[], &orders_rules());
        assert!(matches!(result, Err(AppError::AmbiguousRoute(_))));
    }

    #[test]
    fn test_unmatched_delete_routes_nowhere() {
        let rules = rules_from_json(serde_json::json!({
            "data_sources": ["ds_0", "ds_1", "ds_2"],
            "tables": [{
                "logic_table": "orders",
                "actual_data_nodes": "ds_${0..2}.orders_${0..2}",
                "database_strategy": {"sharding_column": "user_id", "algorithm_name": "mod4"},
                "table_strategy": {"sharding_column": "user_id", "algorithm_name": "mod4"}
            }],
            "sharding_algorithms": {"mod4": {"type": "MOD", "sharding_count": 4}}
        }));
        let ctx = route_with("DELETE FROM orders WHERE user_id = 999", &[], &rules).unwrap();
        assert!(ctx.is_empty());

        let result = route_with("INSERT INTO orders (user_id) VALUES (999)", &[], &rules);
        assert!(matches!(result, Err(AppError::EmptyRoute(_))));
    }

    #[test]
    fn test_ddl_on_single_table_routes_to_its_data_source() {
        let rules = RuleModel::try_from_config(RuleConfig {
            data_sources: vec!["ds_0".to_string(), "ds_1".to_string()],
            single_tables: [("t".to_string(), "ds_1".to_string())].into_iter().collect(),
            ..Default::default()
        })
        .unwrap();
        let ctx = route_with("DROP TABLE t", &[], &rules).unwrap();
        assert_eq!(units(&ctx), vec![("ds_1".to_string(), vec!["t".to_string()])]);
    }
}
