// Merge context: what the merger needs to know about a statement's shape

use std::cmp::Ordering;

use crate::api::middleware::AppError;
use crate::models::{AggregationType, BoundStatement, ProjectionKind, RuleModel, StatementKind, Value};
use crate::services::rewrite::{
    group_item_locator, order_item_locator, plan_derived_columns, DerivedKind, KeyLocator,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub locator: KeyLocator,
    pub descending: bool,
    pub nulls_first: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationSpec {
    pub function: AggregationType,
    pub locator: KeyLocator,
    /// Derived (count, sum) columns rebuilding an AVG
    pub avg_parts: Option<(KeyLocator, KeyLocator)>,
}

/// Sort key resolved to a column index
#[derive(Debug, Clone, Copy)]
pub struct ResolvedSortKey {
    pub index: usize,
    pub descending: bool,
    pub nulls_first: Option<bool>,
}

/// Compare two rows on resolved keys
pub fn compare_rows(a: &[Value], b: &[Value], keys: &[ResolvedSortKey]) -> Ordering {
    for key in keys {
        let (x, y) = (&a[key.index], &b[key.index]);
        let ordering = match (x.is_null(), y.is_null(), key.nulls_first) {
            (true, true, _) => Ordering::Equal,
            (true, false, Some(first)) => if first { Ordering::Less } else { Ordering::Greater },
            (false, true, Some(first)) => if first { Ordering::Greater } else { Ordering::Less },
            _ => {
                let natural = x.cmp(y);
                if key.descending {
                    natural.reverse()
                } else {
                    natural
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Resolve locators against the column labels of the shard results
pub fn resolve_locators(locators: &[KeyLocator], columns: &[String]) -> Result<Vec<usize>, AppError> {
    locators
        .iter()
        .map(|l| {
            l.resolve(columns).ok_or_else(|| {
                AppError::MergeInvariant(format!("Key {:?} not found in shard columns {:?}", l, columns))
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeContext {
    pub unit_count: usize,
    pub sort_keys: Vec<SortKey>,
    /// Sort keys of grouped output: ORDER BY keys, else GROUP BY keys
    pub group_sort_keys: Vec<SortKey>,
    pub group_keys: Vec<KeyLocator>,
    pub aggregations: Vec<AggregationSpec>,
    pub distinct: bool,
    pub memory_merge: bool,
    pub offset: u64,
    pub limit: Option<u64>,
    pub paginated: bool,
    /// Trailing derived columns hidden from the client
    pub derived_count: usize,
    /// False when every table is broadcast: each unit reports the same change
    pub sum_update_counts: bool,
}

impl MergeContext {
    /// Derive the merge shape of a statement routed to `unit_count` units
    pub fn new(
        statement: &BoundStatement,
        parameters: &[Value],
        unit_count: usize,
        rules: &RuleModel,
    ) -> Result<Self, AppError> {
        let tables = statement.table_names();
        let sum_update_counts = tables.is_empty() || !tables.iter().all(|t| rules.is_broadcast(t));
        let mut context = MergeContext {
            unit_count,
            sum_update_counts,
            ..Default::default()
        };
        if statement.kind != StatementKind::Select {
            return Ok(context);
        }

        let scope = statement.root();
        let derived = if unit_count > 1 && !statement.set_operation {
            plan_derived_columns(scope)
        } else {
            Vec::new()
        };
        context.derived_count = derived.len();
        context.distinct = scope.distinct;
        context.memory_merge = super::requires_memory_merge(scope);

        for index in 0..scope.order_by.len() {
            if let Some(locator) = order_item_locator(scope, &derived, index) {
                let item = &scope.order_by[index];
                context.sort_keys.push(SortKey {
                    locator,
                    descending: item.descending,
                    nulls_first: item.nulls_first,
                });
            } else if unit_count > 1 {
                return Err(AppError::MergeInvariant(format!(
                    "ORDER BY item {} cannot be located in the result",
                    index + 1
                )));
            }
        }
        for index in 0..scope.group_by.len() {
            match group_item_locator(scope, &derived, index) {
                Some(locator) => context.group_keys.push(locator),
                None if unit_count > 1 => {
                    return Err(AppError::MergeInvariant(format!(
                        "GROUP BY item {} cannot be located in the result",
                        index + 1
                    )))
                }
                None => {}
            }
        }
        context.group_sort_keys = if context.sort_keys.is_empty() {
            context
                .group_keys
                .iter()
                .map(|locator| SortKey {
                    locator: locator.clone(),
                    descending: false,
                    nulls_first: None,
                })
                .collect()
        } else {
            context.sort_keys.clone()
        };

        for (index, projection) in scope.projections.iter().enumerate() {
            let ProjectionKind::Aggregation { function, .. } = projection.kind else {
                continue;
            };
            let locator = match projection.alias.as_deref() {
                Some(alias) => KeyLocator::Label(alias.to_string()),
                None => KeyLocator::Position(index),
            };
            let avg_parts = if function == AggregationType::Avg {
                let count = derived.iter().find(|d| d.kind == DerivedKind::AvgCount { projection: index });
                let sum = derived.iter().find(|d| d.kind == DerivedKind::AvgSum { projection: index });
                count.zip(sum).map(|(c, s)| (c.locator(), s.locator()))
            } else {
                None
            };
            context.aggregations.push(AggregationSpec {
                function,
                locator,
                avg_parts,
            });
        }

        if let Some(pagination) = scope.pagination.as_ref().filter(|_| !statement.set_operation) {
            context.paginated = true;
            context.offset = pagination.offset.as_ref().and_then(|s| s.resolve(parameters)).unwrap_or(0);
            context.limit = pagination.limit.as_ref().and_then(|s| s.resolve(parameters));
        }
        Ok(context)
    }

    /// Whether shard results need any merging work beyond passing rows through
    pub fn is_pass_through(&self, result_count: usize) -> bool {
        result_count <= 1 && self.derived_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::orders_rules;
    use crate::validation::SqlBinder;

    fn context(sql: &str, params: &[Value], units: usize) -> MergeContext {
        let statement = SqlBinder::new().bind(sql).unwrap();
        MergeContext::new(&statement, params, units, &orders_rules()).unwrap()
    }

    #[test]
    fn test_ordered_pagination_shape() {
        let ctx = context("SELECT * FROM orders ORDER BY order_id DESC LIMIT ? OFFSET 2", &[Value::Int(5)], 4);
        assert!(!ctx.memory_merge);
        assert_eq!(ctx.sort_keys.len(), 1);
        assert!(ctx.sort_keys[0].descending);
        assert_eq!((ctx.offset, ctx.limit), (2, Some(5)));
        assert!(ctx.paginated);
    }

    #[test]
    fn test_grouped_shape_with_avg() {
        let ctx = context("SELECT user_id, AVG(amount) AS a FROM orders GROUP BY user_id", &[], 4);
        assert!(ctx.memory_merge);
        assert_eq!(ctx.derived_count, 2);
        assert_eq!(ctx.group_sort_keys.len(), 1);
        assert_eq!(ctx.aggregations[0].locator, KeyLocator::Label("a".to_string()));
        assert!(ctx.aggregations[0].avg_parts.is_some());
    }

    #[test]
    fn test_update_count_accumulation() {
        assert!(context("UPDATE orders SET status = 'x'", &[], 16).sum_update_counts);
        assert!(!context("UPDATE dict SET label = 'x'", &[], 4).sum_update_counts);
    }

    #[test]
    fn test_compare_rows_nulls_and_direction() {
        let keys = [ResolvedSortKey {
            index: 0,
            descending: true,
            nulls_first: Some(false),
        }];
        let a = [Value::Int(1)];
        let b = [Value::Int(2)];
        let n = [Value::Null];
        assert_eq!(compare_rows(&a, &b, &keys), Ordering::Greater);
        assert_eq!(compare_rows(&n, &a, &keys), Ordering::Greater);
    }
}
