// Federation decider
//
// Flags queries whose semantics the per-unit execution plus merge path cannot
// preserve. Rules are evaluated in order and the first match wins.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{BoundStatement, DataNode, RouteContext, RuleModel, StatementKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FederationDecision {
    pub use_federation: bool,
    pub reason: Option<String>,
    /// Logic table → every node the federation engine has to scan
    pub data_nodes: BTreeMap<String, Vec<DataNode>>,
}

impl FederationDecision {
    fn direct() -> Self {
        Self {
            use_federation: false,
            reason: None,
            data_nodes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FederationDecider;

impl FederationDecider {
    pub fn new() -> Self {
        Self
    }

    /// Decide whether `statement` must run on the federation engine
    ///
    /// # Arguments
    /// * `statement` - bound statement
    /// * `route` - units selected by the router
    /// * `rules` - the rule snapshot the route was computed with
    pub fn decide(&self, statement: &BoundStatement, route: &RouteContext, rules: &RuleModel) -> FederationDecision {
        match self.federation_reason(statement, route, rules) {
            Some(reason) => FederationDecision {
                use_federation: true,
                reason: Some(reason),
                data_nodes: collect_data_nodes(statement, rules),
            },
            None => FederationDecision::direct(),
        }
    }

    fn federation_reason(&self, statement: &BoundStatement, route: &RouteContext, rules: &RuleModel) -> Option<String> {
        if statement.kind != StatementKind::Select {
            return None;
        }
        let tables = statement.table_names();
        let sharded: Vec<&String> = tables.iter().filter(|t| rules.is_sharded(t)).collect();
        if sharded.is_empty() {
            return None;
        }

        if statement.contains_correlated_subquery() {
            return Some("correlated subquery".to_string());
        }
        if statement.contains_having() {
            return Some("HAVING clause".to_string());
        }
        if statement.set_operation {
            return Some("set operation".to_string());
        }
        if statement.scopes.iter().any(|s| s.has_partial_distinct_aggregation()) {
            return Some("partial DISTINCT aggregation".to_string());
        }
        if route.len() > 1 && statement.scopes.iter().any(|s| s.has_distinct_aggregation()) {
            return Some("DISTINCT aggregation over several units".to_string());
        }

        if route.len() <= 1 {
            return None;
        }

        let nested_sharded = statement
            .scopes
            .iter()
            .filter(|s| s.parent.is_some())
            .any(|s| s.tables.iter().any(|t| rules.is_sharded(&t.name)));
        if nested_sharded {
            return Some("subquery over a sharded table spanning several units".to_string());
        }

        if statement.contains_join() {
            // binding groups collapse to one member; broadcast and unmanaged tables travel along
            let independent: BTreeSet<&str> = sharded
                .iter()
                .map(|t| {
                    rules
                        .binding_group_of(t)
                        .and_then(|g| g.tables.first())
                        .map(String::as_str)
                        .unwrap_or(t.as_str())
                })
                .collect();
            let data_sources: BTreeSet<String> = sharded
                .iter()
                .flat_map(|t| rules.data_sources_for_table(t))
                .collect();
            if independent.len() > 1 && data_sources.len() > 1 {
                return Some(format!("join across unbound sharded tables {:?}", independent));
            }
        }
        None
    }
}

/// Every node per table: all actual nodes of sharded tables, one copy of the others
fn collect_data_nodes(statement: &BoundStatement, rules: &RuleModel) -> BTreeMap<String, Vec<DataNode>> {
    let mut nodes = BTreeMap::new();
    for table in statement.table_names() {
        let table_nodes = match rules.table_rule(&table) {
            Some(rule) => rule.actual_data_nodes.clone(),
            None => rules
                .data_sources_for_table(&table)
                .into_iter()
                .next()
                .map(|ds| vec![DataNode::new(ds, table.clone())])
                .unwrap_or_default(),
        };
        nodes.insert(table, table_nodes);
    }
    nodes
}
