// Condition extractor
//
// Pulls sharding-relevant values out of a bound statement. Predicates are expanded
// into OR-of-AND branches; each branch of each scope becomes one condition group.

use tracing::debug;

use crate::api::middleware::AppError;
use crate::models::{
    BoundStatement, ColumnRef, CompareOp, ConditionGroup, ConditionValues, Predicate, RuleModel, SelectScope,
    ShardingCondition, ShardingConditions, StatementKind, Value, ValueRange,
};

/// Upper bound on OR-of-AND branches per scope; further constraints are dropped,
/// which widens the route but never narrows it
const MAX_BRANCHES: usize = 256;

/// Keys generated for an INSERT that did not supply its key column
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedKeys {
    pub logic_table: String,
    pub column: String,
    /// One value per VALUES row
    pub values: Vec<Value>,
}

impl GeneratedKeys {
    /// Generate keys when the INSERT target has a key generator and omits its column
    pub fn generate(statement: &BoundStatement, rules: &RuleModel) -> Result<Option<Self>, AppError> {
        let Some(insert) = &statement.insert else {
            return Ok(None);
        };
        let Some(strategy) = rules
            .table_rule(&insert.table)
            .and_then(|r| r.key_generate_strategy.as_ref())
        else {
            return Ok(None);
        };
        if insert.columns.is_empty() || insert.column_index(&strategy.column).is_some() {
            return Ok(None);
        }
        let generator = rules.key_generator(&strategy.generator_name)?;
        let values = insert.rows.iter().map(|_| generator.next_key()).collect();
        Ok(Some(Self {
            logic_table: insert.table.clone(),
            column: strategy.column.clone(),
            values,
        }))
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConditionExtractor;

impl ConditionExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract condition groups for every scope of `statement`
    ///
    /// # Arguments
    /// * `statement` - bound statement
    /// * `parameters` - placeholder values, by index
    /// * `rules` - rule snapshot deciding which columns are sharding columns
    /// * `generated_keys` - keys the kernel generated for an INSERT, if any
    pub fn extract(
        &self,
        statement: &BoundStatement,
        parameters: &[Value],
        rules: &RuleModel,
        generated_keys: Option<&GeneratedKeys>,
    ) -> Result<ShardingConditions, AppError> {
        let mut conditions = ShardingConditions::default();

        if statement.kind == StatementKind::Insert {
            if let Some(insert) = &statement.insert {
                self.extract_insert(statement, parameters, rules, generated_keys, &mut conditions)?;
                debug!(
                    "Extracted {} insert condition group(s) for '{}'",
                    conditions.groups.len(),
                    insert.table
                );
            }
            return Ok(conditions);
        }

        for scope in &statement.scopes {
            if scope.tables.is_empty() {
                continue;
            }
            let branches = match &scope.predicate {
                Some(predicate) => dnf(predicate),
                None => vec![Vec::new()],
            };
            for branch in branches {
                conditions
                    .groups
                    .push(self.extract_branch(scope, &branch, parameters, rules));
            }
        }

        debug!("Extracted {} condition group(s)", conditions.groups.len());
        Ok(conditions)
    }

    fn extract_branch(
        &self,
        scope: &SelectScope,
        atoms: &[&Predicate],
        parameters: &[Value],
        rules: &RuleModel,
    ) -> ConditionGroup {
        let mut group = ConditionGroup::new(scope.id);
        let mut joins = Vec::new();

        for atom in atoms {
            let (column, values) = match atom {
                Predicate::Compare { column, op, value } => {
                    let Some(value) = value.resolve(parameters) else {
                        continue;
                    };
                    let values = match op {
                        CompareOp::Eq => ConditionValues::precise(vec![value]),
                        CompareOp::Lt => ConditionValues::Range(ValueRange::at_most(value, false)),
                        CompareOp::LtEq => ConditionValues::Range(ValueRange::at_most(value, true)),
                        CompareOp::Gt => ConditionValues::Range(ValueRange::at_least(value, false)),
                        CompareOp::GtEq => ConditionValues::Range(ValueRange::at_least(value, true)),
                    };
                    (column, values)
                }
                Predicate::In { column, values } => {
                    let Some(values) = values
                        .iter()
                        .map(|v| v.resolve(parameters))
                        .collect::<Option<Vec<_>>>()
                    else {
                        continue;
                    };
                    (column, ConditionValues::precise(values))
                }
                Predicate::Between { column, low, high } => {
                    let (Some(low), Some(high)) = (low.resolve(parameters), high.resolve(parameters)) else {
                        continue;
                    };
                    (column, ConditionValues::Range(ValueRange::closed(low, high)))
                }
                Predicate::ColumnEquals { left, right } => {
                    let (Some(l), Some(r)) = (
                        resolve_sharding_column(scope, left, rules),
                        resolve_sharding_column(scope, right, rules),
                    ) else {
                        continue;
                    };
                    joins.push((l, r));
                    continue;
                }
                _ => continue,
            };

            if let Some((logic_table, column)) = resolve_sharding_column(scope, column, rules) {
                group.add(ShardingCondition {
                    logic_table,
                    column,
                    values,
                });
            }
        }

        // Propagate values across equality joins until nothing changes
        let mut changed = !joins.is_empty();
        while changed {
            changed = false;
            for ((lt, lc), (rt, rc)) in &joins {
                for ((from_t, from_c), (to_t, to_c)) in [((lt, lc), (rt, rc)), ((rt, rc), (lt, lc))] {
                    if group.find(to_t, to_c).is_some() {
                        continue;
                    }
                    if let Some(source) = group.find(from_t, from_c).cloned() {
                        group.add(ShardingCondition {
                            logic_table: to_t.clone(),
                            column: to_c.clone(),
                            values: source.values,
                        });
                        changed = true;
                    }
                }
            }
        }
        group
    }

    fn extract_insert(
        &self,
        statement: &BoundStatement,
        parameters: &[Value],
        rules: &RuleModel,
        generated_keys: Option<&GeneratedKeys>,
        conditions: &mut ShardingConditions,
    ) -> Result<(), AppError> {
        let Some(insert) = &statement.insert else {
            return Ok(());
        };
        let Some(rule) = rules.table_rule(&insert.table) else {
            return Ok(());
        };
        if insert.columns.is_empty() {
            return Err(AppError::InvalidSql(format!(
                "INSERT into sharded table '{}' requires an explicit column list",
                insert.table
            )));
        }

        for (row_index, row) in insert.rows.iter().enumerate() {
            let mut group = ConditionGroup::new(0);
            group.insert_row = Some(row_index);
            for column in rule.sharding_columns() {
                let value = match insert.column_index(column) {
                    Some(idx) => row
                        .values
                        .get(idx)
                        .and_then(|v| v.as_ref())
                        .and_then(|operand| operand.resolve(parameters)),
                    None => generated_keys
                        .filter(|k| k.column == column)
                        .and_then(|k| k.values.get(row_index).cloned()),
                };
                if let Some(value) = value {
                    group.add(ShardingCondition {
                        logic_table: insert.table.clone(),
                        column: column.to_string(),
                        values: ConditionValues::precise(vec![value]),
                    });
                }
            }
            conditions.groups.push(group);
        }
        Ok(())
    }
}

/// Resolve a column reference to (logic table, column) when it is a sharding column
fn resolve_sharding_column(scope: &SelectScope, column: &ColumnRef, rules: &RuleModel) -> Option<(String, String)> {
    let table = match &column.owner {
        Some(owner) => scope.resolve_owner(owner)?.to_string(),
        None => {
            let mut candidates = scope
                .tables
                .iter()
                .map(|t| t.name.as_str())
                .filter(|t| {
                    rules
                        .table_rule(t)
                        .map(|r| r.is_sharding_column(&column.name))
                        .unwrap_or(false)
                });
            let first = candidates.next()?;
            if candidates.any(|other| other != first) {
                return None;
            }
            first.to_string()
        }
    };
    let rule = rules.table_rule(&table)?;
    rule.is_sharding_column(&column.name)
        .then(|| (table, column.name.clone()))
}

/// Expand a predicate into OR-of-AND branches of atoms
fn dnf(predicate: &Predicate) -> Vec<Vec<&Predicate>> {
    match predicate {
        Predicate::And(parts) => {
            let mut acc: Vec<Vec<&Predicate>> = vec![Vec::new()];
            for part in parts {
                let branches = dnf(part);
                if acc.len() * branches.len() > MAX_BRANCHES {
                    continue;
                }
                acc = acc
                    .iter()
                    .flat_map(|prefix| {
                        branches.iter().map(move |b| {
                            let mut combined = prefix.clone();
                            combined.extend(b.iter().copied());
                            combined
                        })
                    })
                    .collect();
            }
            acc
        }
        Predicate::Or(parts) => {
            let branches: Vec<Vec<&Predicate>> = parts.iter().flat_map(dnf).collect();
            if branches.len() > MAX_BRANCHES {
                vec![Vec::new()]
            } else {
                branches
            }
        }
        atom => vec![vec![atom]],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::orders_rules;
    use crate::validation::SqlBinder;

    fn extract(sql: &str, params: &[Value]) -> ShardingConditions {
        let statement = SqlBinder::new().bind(sql).unwrap();
        ConditionExtractor::new()
            .extract(&statement, params, &orders_rules(), None)
            .unwrap()
    }

    #[test]
    fn test_equality_condition() {
        let conditions = extract("SELECT * FROM orders WHERE user_id = 7", &[]);
        assert_eq!(conditions.groups.len(), 1);
        let condition = conditions.groups[0].find("orders", "user_id").unwrap();
        assert_eq!(condition.values(), vec![Value::Int(7)]);
    }

    #[test]
    fn test_parameter_resolution() {
        let conditions = extract("SELECT * FROM orders WHERE user_id IN (?, ?)", &[Value::Int(1), Value::Int(2)]);
        let condition = conditions.groups[0].find("orders", "user_id").unwrap();
        assert_eq!(condition.values(), vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_or_branches_are_not_merged() {
        let conditions = extract("SELECT * FROM orders WHERE (user_id = 1 OR user_id = 2) AND status = 'x'", &[]);
        assert_eq!(conditions.groups.len(), 2);
        assert_eq!(conditions.groups[0].conditions[0].values(), vec![Value::Int(1)]);
        assert_eq!(conditions.groups[1].conditions[0].values(), vec![Value::Int(2)]);
    }

    #[test]
    fn test_contradiction_is_always_false() {
        let conditions = extract("SELECT * FROM orders WHERE user_id = 1 AND user_id = 2", &[]);
        assert!(conditions.is_always_false());
    }

    #[test]
    fn test_non_sharding_column_ignored() {
        let conditions = extract("SELECT * FROM orders WHERE status = 'paid'", &[]);
        assert!(conditions.is_empty());
    }

    #[test]
    fn test_join_propagation() {
        let conditions = extract(
            "SELECT * FROM orders o JOIN order_items i ON o.user_id = i.user_id WHERE o.user_id = 5",
            &[],
        );
        let group = &conditions.groups[0];
        assert_eq!(group.find("order_items", "user_id").unwrap().values(), vec![Value::Int(5)]);
    }

    #[test]
    fn test_insert_rows_and_generated_keys() {
        let statement = SqlBinder::new()
            .bind("INSERT INTO orders (user_id, status) VALUES (1, 'a'), (?, 'b')")
            .unwrap();
        let rules = orders_rules();
        let keys = GeneratedKeys::generate(&statement, &rules).unwrap().unwrap();
        assert_eq!(keys.column, "order_id");
        assert_eq!(keys.values.len(), 2);
        let conditions = ConditionExtractor::new()
            .extract(&statement, &[Value::Int(6)], &rules, Some(&keys))
            .unwrap();
        assert_eq!(conditions.groups.len(), 2);
        assert_eq!(conditions.groups[1].insert_row, Some(1));
        assert_eq!(conditions.groups[1].find("orders", "user_id").unwrap().values(), vec![Value::Int(6)]);
    }

    #[test]
    fn test_dnf_cap_widens() {
        let atom = Predicate::Other;
        let or = Predicate::Or(vec![atom.clone(); 20]);
        let and = Predicate::And(vec![or.clone(), or.clone(), or]);
        let branches = dnf(&and);
        assert!(branches.len() <= MAX_BRANCHES);
    }
}
