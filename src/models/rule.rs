// Sharding rule model
//
// `RuleConfig` is the serialisable form accepted from files and the admin API.
// `RuleModel` is the compiled, validated and immutable form that routing reads.
// A new model replaces the old one wholesale; nothing mutates a model in place.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use crate::api::middleware::AppError;
use crate::services::sharding::{inline, KeyGenerator, KeyGeneratorConfig, ShardingAlgorithm};

/// A concrete (data source, physical table) pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataNode {
    pub data_source: String,
    pub table: String,
}

impl DataNode {
    pub fn new(data_source: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
            table: table.into(),
        }
    }

    /// Parse `ds.table`
    pub fn parse(text: &str) -> Result<Self, AppError> {
        match text.trim().split_once('.') {
            Some((ds, table)) if !ds.is_empty() && !table.is_empty() && !table.contains('.') => {
                Ok(Self::new(ds, table))
            }
            _ => Err(AppError::Configuration(format!(
                "Invalid data node '{}', expected 'data_source.table'",
                text
            ))),
        }
    }
}

impl fmt::Display for DataNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.data_source, self.table)
    }
}

/// Data nodes as an inline expression or an explicit list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataNodesConfig {
    Expression(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingStrategy {
    pub sharding_column: String,
    pub algorithm_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGenerateStrategy {
    pub column: String,
    pub generator_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRuleConfig {
    pub logic_table: String,
    pub actual_data_nodes: DataNodesConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_strategy: Option<ShardingStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_strategy: Option<ShardingStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_generate_strategy: Option<KeyGenerateStrategy>,
}

/// Rule configuration as written by an administrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Every data source name the rules may reference
    pub data_sources: Vec<String>,
    #[serde(default)]
    pub tables: Vec<TableRuleConfig>,
    #[serde(default)]
    pub binding_groups: Vec<Vec<String>>,
    #[serde(default)]
    pub broadcast_tables: Vec<String>,
    #[serde(default)]
    pub sharding_algorithms: BTreeMap<String, ShardingAlgorithm>,
    #[serde(default)]
    pub key_generators: BTreeMap<String, KeyGeneratorConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_database_strategy: Option<ShardingStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_table_strategy: Option<ShardingStrategy>,
    /// Data source hosting unmanaged tables that `single_tables` does not list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_data_source: Option<String>,
    /// Unmanaged table → the one data source holding it
    #[serde(default)]
    pub single_tables: BTreeMap<String, String>,
}

/// Compiled rule for one sharded logic table
#[derive(Debug, Clone, PartialEq)]
pub struct TableRule {
    pub logic_table: String,
    /// In declaration order
    pub actual_data_nodes: Vec<DataNode>,
    /// Effective strategies, defaults already applied
    pub database_strategy: Option<ShardingStrategy>,
    pub table_strategy: Option<ShardingStrategy>,
    pub key_generate_strategy: Option<KeyGenerateStrategy>,
}

impl TableRule {
    /// Data source names in first-appearance order
    pub fn data_source_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for node in &self.actual_data_nodes {
            if !names.contains(&node.data_source.as_str()) {
                names.push(&node.data_source);
            }
        }
        names
    }

    pub fn actual_tables_in(&self, data_source: &str) -> Vec<&str> {
        self.actual_data_nodes
            .iter()
            .filter(|n| n.data_source == data_source)
            .map(|n| n.table.as_str())
            .collect()
    }

    /// Position of a physical table among the tables of its data source
    pub fn index_of(&self, node: &DataNode) -> Option<usize> {
        self.actual_tables_in(&node.data_source)
            .iter()
            .position(|t| *t == node.table)
    }

    pub fn sharding_columns(&self) -> BTreeSet<&str> {
        self.database_strategy
            .iter()
            .chain(self.table_strategy.iter())
            .map(|s| s.sharding_column.as_str())
            .collect()
    }

    pub fn is_sharding_column(&self, column: &str) -> bool {
        self.sharding_columns().contains(column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingGroup {
    pub tables: Vec<String>,
}

/// Immutable, validated rule snapshot
#[derive(Debug)]
pub struct RuleModel {
    config: RuleConfig,
    data_sources: Vec<String>,
    tables: BTreeMap<String, TableRule>,
    binding_groups: Vec<BindingGroup>,
    broadcast_tables: BTreeSet<String>,
    algorithms: BTreeMap<String, ShardingAlgorithm>,
    key_generators: BTreeMap<String, KeyGenerator>,
    single_tables: BTreeMap<String, String>,
    default_data_source: Option<String>,
}

fn lower_strategy(strategy: &Option<ShardingStrategy>) -> Option<ShardingStrategy> {
    strategy.as_ref().map(|s| ShardingStrategy {
        sharding_column: s.sharding_column.to_lowercase(),
        algorithm_name: s.algorithm_name.clone(),
    })
}

impl RuleModel {
    /// Compile and validate a rule configuration
    ///
    /// # Arguments
    /// * `config` - rule configuration; table and column names are case-insensitive
    ///
    /// # Returns
    /// A model ready to be installed, or a `Configuration` error naming the offending rule
    pub fn try_from_config(config: RuleConfig) -> Result<Self, AppError> {
        let mut data_sources = config.data_sources.clone();
        data_sources.sort();
        data_sources.dedup();

        let default_db = lower_strategy(&config.default_database_strategy);
        let default_table = lower_strategy(&config.default_table_strategy);

        let mut tables = BTreeMap::new();
        for table in &config.tables {
            let logic_table = table.logic_table.to_lowercase();
            let expressions = match &table.actual_data_nodes {
                DataNodesConfig::Expression(expr) => inline::expand(expr)?,
                DataNodesConfig::List(list) => list.clone(),
            };
            let mut nodes = Vec::with_capacity(expressions.len());
            for text in expressions {
                let node = DataNode::parse(&text)?;
                if nodes.contains(&node) {
                    return Err(AppError::Configuration(format!(
                        "Duplicate data node '{}' in rule for table '{}'",
                        node, logic_table
                    )));
                }
                nodes.push(node);
            }
            if nodes.is_empty() {
                return Err(AppError::Configuration(format!(
                    "Table '{}' declares no data nodes",
                    logic_table
                )));
            }

            let rule = TableRule {
                logic_table: logic_table.clone(),
                actual_data_nodes: nodes,
                database_strategy: lower_strategy(&table.database_strategy).or_else(|| default_db.clone()),
                table_strategy: lower_strategy(&table.table_strategy).or_else(|| default_table.clone()),
                key_generate_strategy: table.key_generate_strategy.as_ref().map(|k| KeyGenerateStrategy {
                    column: k.column.to_lowercase(),
                    generator_name: k.generator_name.clone(),
                }),
            };
            if tables.insert(logic_table.clone(), rule).is_some() {
                return Err(AppError::Configuration(format!(
                    "Table '{}' has more than one rule",
                    logic_table
                )));
            }
        }

        let binding_groups = config
            .binding_groups
            .iter()
            .map(|group| BindingGroup {
                tables: group.iter().map(|t| t.to_lowercase()).collect(),
            })
            .collect();

        let mut key_generators = BTreeMap::new();
        for (name, generator) in &config.key_generators {
            key_generators.insert(name.clone(), KeyGenerator::from_config(generator)?);
        }

        let model = Self {
            data_sources,
            tables,
            binding_groups,
            broadcast_tables: config.broadcast_tables.iter().map(|t| t.to_lowercase()).collect(),
            algorithms: config.sharding_algorithms.clone(),
            key_generators,
            single_tables: config
                .single_tables
                .iter()
                .map(|(t, ds)| (t.to_lowercase(), ds.clone()))
                .collect(),
            default_data_source: config.default_data_source.clone(),
            config,
        };
        model.validate()?;
        Ok(model)
    }

    /// Check cross-references and binding constraints
    pub fn validate(&self) -> Result<(), AppError> {
        if self.data_sources.is_empty() {
            return Err(AppError::Configuration("Rules declare no data sources".to_string()));
        }
        let known = |ds: &str| self.data_sources.iter().any(|d| d == ds);

        for algorithm in self.algorithms.values() {
            algorithm.validate()?;
        }

        for rule in self.tables.values() {
            for node in &rule.actual_data_nodes {
                if !known(&node.data_source) {
                    return Err(AppError::Configuration(format!(
                        "Table '{}' references unknown data source '{}'",
                        rule.logic_table, node.data_source
                    )));
                }
            }
            for strategy in rule.database_strategy.iter().chain(rule.table_strategy.iter()) {
                if !self.algorithms.contains_key(&strategy.algorithm_name) {
                    return Err(AppError::Configuration(format!(
                        "Table '{}' references unknown sharding algorithm '{}'",
                        rule.logic_table, strategy.algorithm_name
                    )));
                }
            }
            if let Some(key) = &rule.key_generate_strategy {
                if !self.key_generators.contains_key(&key.generator_name) {
                    return Err(AppError::Configuration(format!(
                        "Table '{}' references unknown key generator '{}'",
                        rule.logic_table, key.generator_name
                    )));
                }
            }
        }

        let mut grouped: HashSet<&str> = HashSet::new();
        for group in &self.binding_groups {
            let Some(first) = group.tables.first() else {
                return Err(AppError::Configuration("Empty binding group".to_string()));
            };
            let Some(first_rule) = self.tables.get(first) else {
                return Err(AppError::Configuration(format!(
                    "Binding table '{}' has no sharding rule",
                    first
                )));
            };
            for table in &group.tables {
                if !grouped.insert(table) {
                    return Err(AppError::Configuration(format!(
                        "Table '{}' belongs to more than one binding group",
                        table
                    )));
                }
                let rule = self.tables.get(table).ok_or_else(|| {
                    AppError::Configuration(format!("Binding table '{}' has no sharding rule", table))
                })?;
                if rule.data_source_names() != first_rule.data_source_names()
                    || rule
                        .data_source_names()
                        .iter()
                        .any(|ds| rule.actual_tables_in(ds).len() != first_rule.actual_tables_in(ds).len())
                {
                    return Err(AppError::Configuration(format!(
                        "Binding tables '{}' and '{}' have different data node layouts",
                        first, table
                    )));
                }
                let columns = |r: &TableRule| {
                    (
                        r.database_strategy.as_ref().map(|s| s.algorithm_name.clone()),
                        r.table_strategy.as_ref().map(|s| s.algorithm_name.clone()),
                    )
                };
                if columns(rule) != columns(first_rule) {
                    return Err(AppError::Configuration(format!(
                        "Binding tables '{}' and '{}' use different sharding strategies",
                        first, table
                    )));
                }
            }
        }

        for table in &self.broadcast_tables {
            if self.tables.contains_key(table) {
                return Err(AppError::Configuration(format!(
                    "Broadcast table '{}' must not also be sharded",
                    table
                )));
            }
        }

        for (table, ds) in &self.single_tables {
            if !known(ds) {
                return Err(AppError::Configuration(format!(
                    "Single table '{}' references unknown data source '{}'",
                    table, ds
                )));
            }
        }
        if let Some(ds) = &self.default_data_source {
            if !known(ds) {
                return Err(AppError::Configuration(format!(
                    "Default data source '{}' is unknown",
                    ds
                )));
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    /// Data source names, sorted
    pub fn data_sources(&self) -> &[String] {
        &self.data_sources
    }

    pub fn table_rule(&self, logic_table: &str) -> Option<&TableRule> {
        self.tables.get(logic_table)
    }

    pub fn table_rules(&self) -> impl Iterator<Item = &TableRule> {
        self.tables.values()
    }

    pub fn is_sharded(&self, logic_table: &str) -> bool {
        self.tables.contains_key(logic_table)
    }

    pub fn is_broadcast(&self, logic_table: &str) -> bool {
        self.broadcast_tables.contains(logic_table)
    }

    pub fn binding_group_of(&self, logic_table: &str) -> Option<&BindingGroup> {
        self.binding_groups
            .iter()
            .find(|g| g.tables.iter().any(|t| t == logic_table))
    }

    pub fn binding_groups(&self) -> &[BindingGroup] {
        &self.binding_groups
    }

    /// Whether two tables are the same or bound together
    pub fn is_bound(&self, a: &str, b: &str) -> bool {
        a == b
            || self
                .binding_group_of(a)
                .map(|g| g.tables.iter().any(|t| t == b))
                .unwrap_or(false)
    }

    pub fn algorithm(&self, name: &str) -> Result<&ShardingAlgorithm, AppError> {
        self.algorithms
            .get(name)
            .ok_or_else(|| AppError::Configuration(format!("Unknown sharding algorithm '{}'", name)))
    }

    pub fn key_generator(&self, name: &str) -> Result<&KeyGenerator, AppError> {
        self.key_generators
            .get(name)
            .ok_or_else(|| AppError::Configuration(format!("Unknown key generator '{}'", name)))
    }

    /// Data sources that hold a logic table, sorted
    ///
    /// Unmanaged tables that are neither listed as single tables nor covered by a
    /// default data source are assumed to exist everywhere.
    pub fn data_sources_for_table(&self, logic_table: &str) -> Vec<String> {
        if let Some(rule) = self.tables.get(logic_table) {
            let mut names: Vec<String> = rule.data_source_names().into_iter().map(String::from).collect();
            names.sort();
            return names;
        }
        if self.broadcast_tables.contains(logic_table) {
            return self.data_sources.clone();
        }
        if let Some(ds) = self.single_tables.get(logic_table) {
            return vec![ds.clone()];
        }
        if let Some(ds) = &self.default_data_source {
            return vec![ds.clone()];
        }
        self.data_sources.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_json() -> serde_json::Value {
        serde_json::json!({
            "data_sources": ["ds_0", "ds_1"],
            "tables": [
                {
                    "logic_table": "orders",
                    "actual_data_nodes": "ds_${0..1}.orders_${0..1}",
                    "database_strategy": {"sharding_column": "user_id", "algorithm_name": "db_mod"},
                    "table_strategy": {"sharding_column": "order_id", "algorithm_name": "table_mod"},
                    "key_generate_strategy": {"column": "order_id", "generator_name": "snowflake"}
                },
                {
                    "logic_table": "order_items",
                    "actual_data_nodes": ["ds_0.order_items_0", "ds_0.order_items_1", "ds_1.order_items_0", "ds_1.order_items_1"],
                    "database_strategy": {"sharding_column": "user_id", "algorithm_name": "db_mod"},
                    "table_strategy": {"sharding_column": "order_id", "algorithm_name": "table_mod"}
                }
            ],
            "binding_groups": [["orders", "order_items"]],
            "broadcast_tables": ["dict"],
            "sharding_algorithms": {
                "db_mod": {"type": "MOD", "sharding_count": 2},
                "table_mod": {"type": "MOD", "sharding_count": 2}
            },
            "key_generators": {"snowflake": {"type": "SNOWFLAKE", "worker_id": 1}},
            "single_tables": {"audit_log": "ds_1"}
        })
    }

    fn model() -> RuleModel {
        let config: RuleConfig = serde_json::from_value(config_json()).unwrap();
        RuleModel::try_from_config(config).unwrap()
    }

    #[test]
    fn test_compile_expands_nodes() {
        let model = model();
        let orders = model.table_rule("orders").unwrap();
        assert_eq!(orders.actual_data_nodes.len(), 4);
        assert_eq!(orders.actual_data_nodes[1], DataNode::new("ds_0", "orders_1"));
        assert_eq!(orders.data_source_names(), vec!["ds_0", "ds_1"]);
        assert_eq!(orders.actual_tables_in("ds_1"), vec!["orders_0", "orders_1"]);
        assert!(orders.is_sharding_column("user_id"));
        assert!(model.is_bound("orders", "order_items"));
        assert!(!model.is_bound("orders", "dict"));
    }

    #[test]
    fn test_data_sources_for_table() {
        let model = model();
        assert_eq!(model.data_sources_for_table("dict"), vec!["ds_0", "ds_1"]);
        assert_eq!(model.data_sources_for_table("audit_log"), vec!["ds_1"]);
        assert_eq!(model.data_sources_for_table("unknown"), vec!["ds_0", "ds_1"]);
    }

    #[test]
    fn test_unknown_data_source_rejected() {
        let mut json = config_json();
        json["data_sources"] = serde_json::json!(["ds_0"]);
        let config: RuleConfig = serde_json::from_value(json).unwrap();
        let err = RuleModel::try_from_config(config).unwrap_err();
        assert!(err.to_string().contains("unknown data source 'ds_1'"));
    }

    #[test]
    fn test_binding_group_must_be_disjoint() {
        let mut json = config_json();
        json["binding_groups"] = serde_json::json!([["orders", "order_items"], ["orders"]]);
        let config: RuleConfig = serde_json::from_value(json).unwrap();
        assert!(matches!(
            RuleModel::try_from_config(config),
            Err(AppError::Configuration(_))
        ));
    }

    #[test]
    fn test_binding_layout_mismatch_rejected() {
        let mut json = config_json();
        json["tables"][1]["actual_data_nodes"] = serde_json::json!("ds_${0..1}.order_items_${0..2}");
        let config: RuleConfig = serde_json::from_value(json).unwrap();
        let err = RuleModel::try_from_config(config).unwrap_err();
        assert!(err.to_string().contains("different data node layouts"));
    }

    #[test]
    fn test_broadcast_table_cannot_be_sharded() {
        let mut json = config_json();
        json["broadcast_tables"] = serde_json::json!(["orders"]);
        let config: RuleConfig = serde_json::from_value(json).unwrap();
        assert!(RuleModel::try_from_config(config).is_err());
    }

    #[test]
    fn test_missing_algorithm_rejected() {
        let mut json = config_json();
        json["sharding_algorithms"] = serde_json::json!({"db_mod": {"type": "MOD", "sharding_count": 2}});
        let config: RuleConfig = serde_json::from_value(json).unwrap();
        let err = RuleModel::try_from_config(config).unwrap_err();
        assert!(err.to_string().contains("table_mod"));
    }
}
