use serde::Serialize;
use std::ops::Bound;

use super::statement::ScopeId;
use super::value::Value;

/// Predicate operator a sharding condition was extracted from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionOperator {
    Equal,
    In,
    Between,
    Range,
}

/// Inclusive/exclusive value range over the total order of `Value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRange {
    pub lower: Bound<Value>,
    pub upper: Bound<Value>,
}

impl ValueRange {
    pub fn closed(lower: Value, upper: Value) -> Self {
        Self {
            lower: Bound::Included(lower),
            upper: Bound::Included(upper),
        }
    }

    pub fn at_least(value: Value, inclusive: bool) -> Self {
        Self {
            lower: if inclusive { Bound::Included(value) } else { Bound::Excluded(value) },
            upper: Bound::Unbounded,
        }
    }

    pub fn at_most(value: Value, inclusive: bool) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: if inclusive { Bound::Included(value) } else { Bound::Excluded(value) },
        }
    }

    pub fn contains(&self, value: &Value) -> bool {
        let above = match &self.lower {
            Bound::Included(l) => value >= l,
            Bound::Excluded(l) => value > l,
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(u) => value <= u,
            Bound::Excluded(u) => value < u,
            Bound::Unbounded => true,
        };
        above && below
    }

    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u))
            | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
            _ => false,
        }
    }

    pub fn intersect(&self, other: &ValueRange) -> ValueRange {
        let lower = match (&self.lower, &other.lower) {
            (Bound::Unbounded, b) | (b, Bound::Unbounded) => b.clone(),
            (a, b) => {
                let (av, bv) = (bound_value(a), bound_value(b));
                if av > bv || (av == bv && matches!(a, Bound::Excluded(_))) {
                    a.clone()
                } else {
                    b.clone()
                }
            }
        };
        let upper = match (&self.upper, &other.upper) {
            (Bound::Unbounded, b) | (b, Bound::Unbounded) => b.clone(),
            (a, b) => {
                let (av, bv) = (bound_value(a), bound_value(b));
                if av < bv || (av == bv && matches!(a, Bound::Excluded(_))) {
                    a.clone()
                } else {
                    b.clone()
                }
            }
        };
        ValueRange { lower, upper }
    }

    /// Integer endpoints, when both sides are bounded
    pub fn integer_bounds(&self) -> Option<(i64, i64)> {
        let lower = match &self.lower {
            Bound::Included(v) => v.as_i64()?,
            Bound::Excluded(v) => v.as_i64()?.checked_add(1)?,
            Bound::Unbounded => return None,
        };
        let upper = match &self.upper {
            Bound::Included(v) => v.as_i64()?,
            Bound::Excluded(v) => v.as_i64()?.checked_sub(1)?,
            Bound::Unbounded => return None,
        };
        Some((lower, upper))
    }

    /// Integer endpoints with open sides clamped to the i64 domain
    pub fn clamped_integer_bounds(&self) -> Option<(i64, i64)> {
        let lower = match &self.lower {
            Bound::Included(v) => v.as_i64()?,
            Bound::Excluded(v) => v.as_i64()?.saturating_add(1),
            Bound::Unbounded => i64::MIN,
        };
        let upper = match &self.upper {
            Bound::Included(v) => v.as_i64()?,
            Bound::Excluded(v) => v.as_i64()?.saturating_sub(1),
            Bound::Unbounded => i64::MAX,
        };
        Some((lower, upper))
    }
}

fn bound_value(bound: &Bound<Value>) -> &Value {
    match bound {
        Bound::Included(v) | Bound::Excluded(v) => v,
        Bound::Unbounded => &Value::Null,
    }
}

/// Values a sharding column is constrained to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionValues {
    /// EQUAL / IN: an ordered, duplicate-free list
    Precise(Vec<Value>),
    /// BETWEEN / comparison operators
    Range(ValueRange),
}

impl ConditionValues {
    pub fn precise(values: Vec<Value>) -> Self {
        let mut unique: Vec<Value> = Vec::with_capacity(values.len());
        for value in values {
            if !unique.contains(&value) {
                unique.push(value);
            }
        }
        ConditionValues::Precise(unique)
    }

    /// AND-combine two constraints on the same column
    pub fn intersect(&self, other: &ConditionValues) -> ConditionValues {
        match (self, other) {
            (ConditionValues::Precise(a), ConditionValues::Precise(b)) => {
                ConditionValues::Precise(a.iter().filter(|v| b.contains(v)).cloned().collect())
            }
            (ConditionValues::Precise(values), ConditionValues::Range(range))
            | (ConditionValues::Range(range), ConditionValues::Precise(values)) => {
                ConditionValues::Precise(values.iter().filter(|v| range.contains(v)).cloned().collect())
            }
            (ConditionValues::Range(a), ConditionValues::Range(b)) => ConditionValues::Range(a.intersect(b)),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ConditionValues::Precise(values) => values.is_empty(),
            ConditionValues::Range(range) => range.is_empty(),
        }
    }
}

/// One sharding column constraint for one logic table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingCondition {
    pub logic_table: String,
    pub column: String,
    pub values: ConditionValues,
}

impl ShardingCondition {
    pub fn operator(&self) -> ConditionOperator {
        match &self.values {
            ConditionValues::Precise(values) if values.len() == 1 => ConditionOperator::Equal,
            ConditionValues::Precise(_) => ConditionOperator::In,
            ConditionValues::Range(ValueRange {
                lower: Bound::Included(_),
                upper: Bound::Included(_),
            }) => ConditionOperator::Between,
            ConditionValues::Range(_) => ConditionOperator::Range,
        }
    }

    /// Ordered values: the precise list, or the bounded range endpoints
    pub fn values(&self) -> Vec<Value> {
        match &self.values {
            ConditionValues::Precise(values) => values.clone(),
            ConditionValues::Range(range) => [&range.lower, &range.upper]
                .into_iter()
                .filter_map(|b| match b {
                    Bound::Included(v) | Bound::Excluded(v) => Some(v.clone()),
                    Bound::Unbounded => None,
                })
                .collect(),
        }
    }
}

/// AND-combined conditions from one OR branch of one scope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionGroup {
    pub scope: ScopeId,
    pub conditions: Vec<ShardingCondition>,
    /// INSERT row this group was built from
    pub insert_row: Option<usize>,
    /// Set once an intersection turned empty: the branch can never match
    pub always_false: bool,
}

impl ConditionGroup {
    pub fn new(scope: ScopeId) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    /// Add a condition, intersecting with any existing one on the same table and column
    pub fn add(&mut self, condition: ShardingCondition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.logic_table == condition.logic_table && c.column == condition.column)
        {
            existing.values = existing.values.intersect(&condition.values);
            if existing.values.is_empty() {
                self.always_false = true;
            }
            return;
        }
        if condition.values.is_empty() {
            self.always_false = true;
        }
        self.conditions.push(condition);
    }

    pub fn find(&self, table: &str, column: &str) -> Option<&ShardingCondition> {
        self.conditions
            .iter()
            .find(|c| c.logic_table == table && c.column == column)
    }
}

/// Every condition group extracted from one statement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardingConditions {
    pub groups: Vec<ConditionGroup>,
}

impl ShardingConditions {
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.conditions.is_empty() && !g.always_false)
    }

    /// True when every branch is contradictory
    pub fn is_always_false(&self) -> bool {
        !self.groups.is_empty() && self.groups.iter().all(|g| g.always_false)
    }

    /// Groups relevant to routing a table referenced in `scope`
    pub fn groups_for_scope(&self, scope: ScopeId) -> impl Iterator<Item = &ConditionGroup> {
        self.groups.iter().filter(move |g| g.scope == scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(values: ConditionValues) -> ShardingCondition {
        ShardingCondition {
            logic_table: "orders".to_string(),
            column: "user_id".to_string(),
            values,
        }
    }

    #[test]
    fn test_operator_classification() {
        assert_eq!(condition(ConditionValues::precise(vec![Value::Int(1)])).operator(), ConditionOperator::Equal);
        assert_eq!(
            condition(ConditionValues::precise(vec![Value::Int(1), Value::Int(2)])).operator(),
            ConditionOperator::In
        );
        assert_eq!(
            condition(ConditionValues::Range(ValueRange::closed(Value::Int(1), Value::Int(9)))).operator(),
            ConditionOperator::Between
        );
        assert_eq!(
            condition(ConditionValues::Range(ValueRange::at_least(Value::Int(1), false))).operator(),
            ConditionOperator::Range
        );
    }

    #[test]
    fn test_precise_values_deduplicated_in_order() {
        let values = ConditionValues::precise(vec![Value::Int(3), Value::Int(1), Value::Int(3)]);
        assert_eq!(values, ConditionValues::Precise(vec![Value::Int(3), Value::Int(1)]));
    }

    #[test]
    fn test_and_intersection() {
        let mut group = ConditionGroup::new(0);
        group.add(condition(ConditionValues::precise(vec![Value::Int(1), Value::Int(5), Value::Int(9)])));
        group.add(condition(ConditionValues::Range(ValueRange::at_least(Value::Int(5), true))));
        assert_eq!(group.conditions.len(), 1);
        assert_eq!(group.conditions[0].values(), vec![Value::Int(5), Value::Int(9)]);
        assert!(!group.always_false);

        group.add(condition(ConditionValues::precise(vec![Value::Int(2)])));
        assert!(group.always_false);
    }

    #[test]
    fn test_range_intersection_bounds() {
        let a = ValueRange::at_least(Value::Int(3), false);
        let b = ValueRange::at_most(Value::Int(10), true);
        let both = a.intersect(&b);
        assert_eq!(both.integer_bounds(), Some((4, 10)));
        assert!(ValueRange::closed(Value::Int(5), Value::Int(4)).is_empty());
        assert!(!both.contains(&Value::Int(3)));
    }
}
