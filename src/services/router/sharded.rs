// Standard, binding and Cartesian routing for statements that touch sharded tables

use std::collections::{BTreeSet, HashSet};

use crate::api::middleware::AppError;
use crate::models::{
    BoundStatement, ConditionGroup, DataNode, RouteContext, RouteMapper, RouteUnit, RuleModel, ShardingConditions,
    TableRule,
};

/// Nodes of one table, keyed by (data source, position within the data source)
#[derive(Debug, Default)]
struct TableTargets {
    nodes: BTreeSet<(String, usize)>,
    /// Some branch constrained the table
    constrained: bool,
    /// Some branch left the table unconstrained
    full_scan: bool,
}

/// Nodes matching one condition group; the flag tells whether any condition applied
fn nodes_for_group(rule: &TableRule, group: Option<&ConditionGroup>, rules: &RuleModel) -> Result<(Vec<DataNode>, bool), AppError> {
    let table = &rule.logic_table;
    let mut constrained = false;

    let all_data_sources: Vec<String> = rule.data_source_names().into_iter().map(String::from).collect();
    let data_sources = match (&rule.database_strategy, group) {
        (Some(strategy), Some(group)) => match group.find(table, &strategy.sharding_column) {
            Some(condition) => {
                constrained = true;
                rules
                    .algorithm(&strategy.algorithm_name)?
                    .do_sharding(&strategy.sharding_column, &all_data_sources, &condition.values)?
            }
            None => all_data_sources,
        },
        _ => all_data_sources,
    };

    let mut nodes = Vec::new();
    for ds in data_sources {
        let all_tables: Vec<String> = rule.actual_tables_in(&ds).into_iter().map(String::from).collect();
        let tables = match (&rule.table_strategy, group) {
            (Some(strategy), Some(group)) => match group.find(table, &strategy.sharding_column) {
                Some(condition) => {
                    constrained = true;
                    rules
                        .algorithm(&strategy.algorithm_name)?
                        .do_sharding(&strategy.sharding_column, &all_tables, &condition.values)?
                }
                None => all_tables,
            },
            _ => all_tables,
        };
        nodes.extend(tables.into_iter().map(|t| DataNode::new(ds.clone(), t)));
    }
    Ok((nodes, constrained))
}

/// Union of the nodes every referencing scope needs
fn table_targets(
    statement: &BoundStatement,
    rule: &TableRule,
    conditions: &ShardingConditions,
    rules: &RuleModel,
) -> Result<TableTargets, AppError> {
    let mut targets = TableTargets::default();
    let add = |targets: &mut TableTargets, nodes: Vec<DataNode>| {
        for node in nodes {
            if let Some(index) = rule.index_of(&node) {
                targets.nodes.insert((node.data_source, index));
            }
        }
    };

    for scope in statement.scopes_referencing(&rule.logic_table) {
        let groups: Vec<&ConditionGroup> = conditions.groups_for_scope(scope.id).collect();
        if groups.is_empty() {
            let (nodes, _) = nodes_for_group(rule, None, rules)?;
            add(&mut targets, nodes);
            targets.full_scan = true;
            continue;
        }
        for group in groups {
            if group.always_false {
                continue;
            }
            let (nodes, constrained) = nodes_for_group(rule, Some(group), rules)?;
            if constrained {
                targets.constrained = true;
            } else {
                targets.full_scan = true;
            }
            add(&mut targets, nodes);
        }
    }
    Ok(targets)
}

/// Route a binding group (or a lone sharded table) to aligned nodes
///
/// # Returns
/// (data source, mappers for every member) pairs, and the full-scan flag
fn route_binding(
    statement: &BoundStatement,
    members: &[&TableRule],
    conditions: &ShardingConditions,
    rules: &RuleModel,
) -> Result<(Vec<(String, Vec<RouteMapper>)>, bool), AppError> {
    let mut all = Vec::with_capacity(members.len());
    for rule in members {
        all.push(table_targets(statement, rule, conditions, rules)?);
    }

    let constrained: Vec<&TableTargets> = all.iter().filter(|t| t.constrained).collect();
    let (positions, full_scan) = match constrained.split_first() {
        None => (all[0].nodes.clone(), all[0].full_scan),
        Some((first, rest)) => {
            let mut positions = first.nodes.clone();
            for other in rest {
                positions = positions.intersection(&other.nodes).cloned().collect();
            }
            if positions.is_empty() && constrained.iter().all(|t| !t.nodes.is_empty()) {
                let names: Vec<&str> = members.iter().map(|r| r.logic_table.as_str()).collect();
                return Err(AppError::AmbiguousRoute(format!(
                    "Binding tables {:?} resolve to different shards",
                    names
                )));
            }
            (positions, constrained.iter().all(|t| t.full_scan))
        }
    };

    let mut targets = Vec::with_capacity(positions.len());
    for (ds, index) in positions {
        let mut mappers = Vec::with_capacity(members.len());
        for rule in members {
            let actual = rule.actual_tables_in(&ds).get(index).copied().ok_or_else(|| {
                AppError::Configuration(format!(
                    "Binding table '{}' has no node #{} in data source '{}'",
                    rule.logic_table, index, ds
                ))
            })?;
            mappers.push(RouteMapper::new(rule.logic_table.clone(), actual));
        }
        targets.push((ds, mappers));
    }
    Ok((targets, full_scan))
}

/// Route a query, UPDATE or DELETE touching at least one sharded table
pub(super) fn route_sharded(
    statement: &BoundStatement,
    tables: &[String],
    conditions: &ShardingConditions,
    rules: &RuleModel,
) -> Result<RouteContext, AppError> {
    let mut context = RouteContext::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut route_groups: Vec<Vec<(String, Vec<RouteMapper>)>> = Vec::new();

    for table in tables {
        if seen.contains(table.as_str()) {
            continue;
        }
        if rules.is_sharded(table) {
            let members: Vec<&TableRule> = tables
                .iter()
                .filter(|t| rules.is_bound(table, t))
                .filter_map(|t| rules.table_rule(t))
                .collect();
            for member in &members {
                seen.insert(&member.logic_table);
            }
            let (targets, full_scan) = route_binding(statement, &members, conditions, rules)?;
            context.full_scan |= full_scan;
            route_groups.push(targets);
        } else {
            seen.insert(table);
            route_groups.push(
                rules
                    .data_sources_for_table(table)
                    .into_iter()
                    .map(|ds| (ds, vec![RouteMapper::new(table.clone(), table.clone())]))
                    .collect(),
            );
        }
    }

    // Cartesian product within each data source
    let mut groups = route_groups.into_iter();
    let mut combos = groups.next().unwrap_or_default();
    for group in groups {
        combos = combos
            .iter()
            .flat_map(|(ds, mappers)| {
                group.iter().filter(move |(other, _)| other == ds).map(move |(_, more)| {
                    let mut joined = mappers.clone();
                    joined.extend(more.iter().cloned());
                    (ds.clone(), joined)
                })
            })
            .collect();
    }

    for (ds, mappers) in combos {
        context.add(RouteUnit::new(ds, mappers));
    }
    Ok(context)
}

/// Route every VALUES row of an INSERT into a sharded table to exactly one node
pub(super) fn route_insert(
    statement: &BoundStatement,
    conditions: &ShardingConditions,
    rules: &RuleModel,
) -> Result<RouteContext, AppError> {
    let insert = statement
        .insert
        .as_ref()
        .ok_or_else(|| AppError::Internal("INSERT statement without VALUES segment".to_string()))?;
    let rule = rules
        .table_rule(&insert.table)
        .ok_or_else(|| AppError::Internal(format!("No rule for sharded table '{}'", insert.table)))?;

    let mut context = RouteContext::new();
    for group in &conditions.groups {
        let row = group.insert_row.unwrap_or(0);
        let (nodes, _) = nodes_for_group(rule, Some(group), rules)?;
        match nodes.as_slice() {
            [] => {
                return Err(AppError::EmptyRoute(format!(
                    "INSERT row {} into '{}' matches no data node",
                    row + 1,
                    insert.table
                )))
            }
            [node] => context.add_insert_row(
                RouteUnit::new(
                    node.data_source.clone(),
                    vec![RouteMapper::new(insert.table.clone(), node.table.clone())],
                ),
                row,
            ),
            many => {
                return Err(AppError::AmbiguousRoute(format!(
                    "INSERT row {} into '{}' resolves to {} data nodes; every sharding column needs a value",
                    row + 1,
                    insert.table,
                    many.len()
                )))
            }
        }
    }
    Ok(context)
}
