// Shared fixtures for unit tests

use std::sync::Arc;

use crate::models::{RuleConfig, RuleModel};
use crate::services::execution::{ExecutorRegistry, SqliteShardExecutor};

/// Four data sources, `orders`/`order_items` bound and sharded by `user_id % 4`
/// on both levels, `users` split further by `user_id % 2`, `dict` broadcast.
pub fn orders_rules() -> RuleModel {
    rules_from_json(serde_json::json!({
        "data_sources": ["ds_0", "ds_1", "ds_2", "ds_3"],
        "tables": [
            {
                "logic_table": "orders",
                "actual_data_nodes": "ds_${0..3}.orders_${0..3}",
                "database_strategy": {"sharding_column": "user_id", "algorithm_name": "mod4"},
                "table_strategy": {"sharding_column": "user_id", "algorithm_name": "mod4"},
                "key_generate_strategy": {"column": "order_id", "generator_name": "snowflake"}
            },
            {
                "logic_table": "order_items",
                "actual_data_nodes": "ds_${0..3}.order_items_${0..3}",
                "database_strategy": {"sharding_column": "user_id", "algorithm_name": "mod4"},
                "table_strategy": {"sharding_column": "user_id", "algorithm_name": "mod4"}
            },
            {
                "logic_table": "users",
                "actual_data_nodes": "ds_${0..3}.users_${0..1}",
                "database_strategy": {"sharding_column": "user_id", "algorithm_name": "mod4"},
                "table_strategy": {"sharding_column": "user_id", "algorithm_name": "mod2"}
            }
        ],
        "binding_groups": [["orders", "order_items"]],
        "broadcast_tables": ["dict"],
        "sharding_algorithms": {
            "mod4": {"type": "MOD", "sharding_count": 4},
            "mod2": {"type": "MOD", "sharding_count": 2}
        },
        "key_generators": {
            "snowflake": {"type": "SNOWFLAKE", "worker_id": 1}
        }
    }))
}

pub fn rules_from_json(json: serde_json::Value) -> RuleModel {
    let config: RuleConfig = serde_json::from_value(json).unwrap();
    RuleModel::try_from_config(config).unwrap()
}

/// One `(order_id, user_id, status, amount)` row
pub type OrderRow = (i64, i64, &'static str, i64);

/// In-memory SQLite shards laid out like `orders_rules`, seeded with `orders`
/// rows placed where the router would send them.
pub async fn seeded_shards(orders: &[OrderRow]) -> ExecutorRegistry {
    let placed: Vec<(i64, OrderRow)> = orders.iter().map(|row| (row.1 % 4, *row)).collect();
    seeded_shards_at(&placed).await
}

/// Like `seeded_shards`, but each row lands in `orders_k` of `ds_k` for the given `k`
pub async fn seeded_shards_at(placed: &[(i64, OrderRow)]) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    for ds in 0..4 {
        let executor = SqliteShardExecutor::in_memory(&format!("ds_{}", ds)).unwrap();
        let mut ddl = String::new();
        for t in 0..4 {
            ddl.push_str(&format!(
                "CREATE TABLE orders_{t} (order_id INTEGER PRIMARY KEY, user_id INTEGER, status TEXT, amount INTEGER);\n\
                 CREATE TABLE order_items_{t} (item_id INTEGER PRIMARY KEY, order_id INTEGER, user_id INTEGER, sku TEXT);\n"
            ));
        }
        for t in 0..2 {
            ddl.push_str(&format!("CREATE TABLE users_{t} (user_id INTEGER PRIMARY KEY, name TEXT);\n"));
        }
        ddl.push_str("CREATE TABLE dict (code TEXT PRIMARY KEY, label TEXT);\n");
        ddl.push_str("INSERT INTO dict VALUES ('paid', 'Paid'), ('new', 'New');\n");
        for (shard, (order_id, user_id, status, amount)) in placed {
            if *shard == ds {
                ddl.push_str(&format!(
                    "INSERT INTO orders_{shard} VALUES ({order_id}, {user_id}, '{status}', {amount});\n"
                ));
            }
        }
        executor.execute_batch(&ddl).await.unwrap();
        registry.register(Arc::new(executor));
    }
    registry
}
