// Derived columns and key locators
//
// Multi-unit selects may need columns the client never asked for: SUM/COUNT pairs
// that rebuild AVG, and ORDER BY or GROUP BY keys missing from the projection list.
// The rewriter appends them and the merger reads and then hides them, so both
// sides plan them with the same function.

use crate::models::{AggregationType, OrderByExpr, OrderByItem, ProjectionKind, SelectScope};
use crate::validation::normalize_expression;

/// Where a key or aggregate lives in a shard result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLocator {
    /// Zero-based column position
    Position(usize),
    /// Column label, compared case-insensitively
    Label(String),
}

impl KeyLocator {
    /// Resolve against the column labels of a shard result
    pub fn resolve(&self, columns: &[String]) -> Option<usize> {
        match self {
            KeyLocator::Position(index) => (*index < columns.len()).then_some(*index),
            KeyLocator::Label(label) => columns.iter().position(|c| c.eq_ignore_ascii_case(label)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DerivedKind {
    AvgCount { projection: usize },
    AvgSum { projection: usize },
    OrderBy { item: usize },
    GroupBy { item: usize },
}

/// A column appended to the projection list of every unit
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedColumn {
    pub kind: DerivedKind,
    pub alias: String,
    /// Wrapping function, e.g. `COUNT` for AVG's count half
    pub function: Option<&'static str>,
    /// Byte span of the expression in the original text
    pub start: usize,
    pub stop: usize,
}

impl DerivedColumn {
    pub fn locator(&self) -> KeyLocator {
        KeyLocator::Label(self.alias.clone())
    }
}

/// Alias of a projection, else its position when no wildcard precedes it, else its bare column name.
/// Unaliased labels can repeat (`o.user_id, i.user_id`), so they are the last resort.
fn projection_locator(scope: &SelectScope, index: usize) -> Option<KeyLocator> {
    let projection = scope.projections.get(index)?;
    if let Some(alias) = &projection.alias {
        return Some(KeyLocator::Label(alias.clone()));
    }
    if !scope.projections[..index].iter().any(|p| p.is_wildcard()) {
        return Some(KeyLocator::Position(index));
    }
    projection.label().map(|label| KeyLocator::Label(label.to_string()))
}

/// Find an ORDER BY or GROUP BY item among the projections
pub fn locate_item(scope: &SelectScope, item: &OrderByItem) -> Option<KeyLocator> {
    match &item.expr {
        OrderByExpr::Position(position) => position.checked_sub(1).map(KeyLocator::Position),
        OrderByExpr::Column(column) => {
            for (index, projection) in scope.projections.iter().enumerate() {
                if column.owner.is_none() && projection.alias.as_deref() == Some(column.name.as_str()) {
                    return Some(KeyLocator::Label(column.name.clone()));
                }
                if let ProjectionKind::Column(projected) = &projection.kind {
                    let same_owner = match (&column.owner, &projected.owner) {
                        (Some(a), Some(b)) => scope.resolve_owner(a) == scope.resolve_owner(b),
                        _ => true,
                    };
                    if projected.name == column.name && same_owner {
                        return projection_locator(scope, index);
                    }
                }
            }
            let covered = scope.projections.iter().any(|p| match &p.kind {
                ProjectionKind::Wildcard { owner: None } => true,
                ProjectionKind::Wildcard { owner: Some(owner) } => match &column.owner {
                    Some(column_owner) => scope.resolve_owner(owner) == scope.resolve_owner(column_owner),
                    None => true,
                },
                _ => false,
            });
            covered.then(|| KeyLocator::Label(column.name.clone()))
        }
        OrderByExpr::Expression(text) => scope
            .projections
            .iter()
            .position(|p| normalize_expression(&p.text) == *text || p.alias.as_deref() == Some(text.as_str()))
            .and_then(|index| projection_locator(scope, index)),
    }
}

/// Derived columns a multi-unit select needs, in append order
pub fn plan_derived_columns(scope: &SelectScope) -> Vec<DerivedColumn> {
    let mut derived = Vec::new();

    let mut avg = 0;
    for (index, projection) in scope.projections.iter().enumerate() {
        if let ProjectionKind::Aggregation {
            function: AggregationType::Avg,
            distinct: false,
            argument,
        } = projection.kind
        {
            derived.push(DerivedColumn {
                kind: DerivedKind::AvgCount { projection: index },
                alias: format!("AVG_DERIVED_COUNT_{}", avg),
                function: Some("COUNT"),
                start: argument.0,
                stop: argument.1,
            });
            derived.push(DerivedColumn {
                kind: DerivedKind::AvgSum { projection: index },
                alias: format!("AVG_DERIVED_SUM_{}", avg),
                function: Some("SUM"),
                start: argument.0,
                stop: argument.1,
            });
            avg += 1;
        }
    }

    let mut planned: Vec<(usize, usize)> = Vec::new();
    for (index, item) in scope.order_by.iter().enumerate() {
        if locate_item(scope, item).is_none() && !planned.contains(&(item.start, item.stop)) {
            derived.push(DerivedColumn {
                kind: DerivedKind::OrderBy { item: index },
                alias: format!("ORDER_BY_DERIVED_{}", planned.len()),
                function: None,
                start: item.start,
                stop: item.stop,
            });
            planned.push((item.start, item.stop));
        }
    }

    let mut group_count = 0;
    for (index, item) in scope.group_by.iter().enumerate() {
        if locate_item(scope, item).is_none() {
            derived.push(DerivedColumn {
                kind: DerivedKind::GroupBy { item: index },
                alias: format!("GROUP_BY_DERIVED_{}", group_count),
                function: None,
                start: item.start,
                stop: item.stop,
            });
            group_count += 1;
        }
    }
    derived
}

/// Locator of an ORDER BY item, falling back to its derived column
pub fn order_item_locator(scope: &SelectScope, derived: &[DerivedColumn], index: usize) -> Option<KeyLocator> {
    let item = scope.order_by.get(index)?;
    locate_item(scope, item).or_else(|| {
        derived
            .iter()
            .find(|d| d.kind == DerivedKind::OrderBy { item: index })
            .map(DerivedColumn::locator)
    })
}

/// Locator of a GROUP BY item, falling back to its derived column
pub fn group_item_locator(scope: &SelectScope, derived: &[DerivedColumn], index: usize) -> Option<KeyLocator> {
    let item = scope.group_by.get(index)?;
    locate_item(scope, item).or_else(|| {
        derived
            .iter()
            .find(|d| d.kind == DerivedKind::GroupBy { item: index })
            .map(DerivedColumn::locator)
    })
}
