// Bound statement model
//
// The binder turns SQL text into this structure. Every segment keeps its byte span
// in the original text so the rewriter can splice physical names in place.

use serde::Serialize;

use super::value::Value;

/// Index of a scope in `BoundStatement::scopes`
pub type ScopeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    /// SET, SHOW, BEGIN and friends
    Other,
}

impl StatementKind {
    pub fn is_dml(&self) -> bool {
        matches!(self, StatementKind::Insert | StatementKind::Update | StatementKind::Delete)
    }
}

/// Column reference, optionally qualified by a table name or alias
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub owner: Option<String>,
    pub name: String,
}

impl ColumnRef {
    pub fn new(owner: Option<&str>, name: &str) -> Self {
        Self {
            owner: owner.map(|o| o.to_lowercase()),
            name: name.to_lowercase(),
        }
    }
}

/// Right-hand side of a sharding-relevant predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    /// Zero-based placeholder index
    Parameter(usize),
}

impl Operand {
    /// Resolve against the statement parameters
    pub fn resolve(&self, parameters: &[Value]) -> Option<Value> {
        match self {
            Operand::Literal(v) => Some(v.clone()),
            Operand::Parameter(idx) => parameters.get(*idx).cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    /// Operator seen from the other side: `5 < col` is `col > 5`
    pub fn flip(self) -> Self {
        match self {
            CompareOp::Eq => CompareOp::Eq,
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::LtEq => CompareOp::GtEq,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::GtEq => CompareOp::LtEq,
        }
    }
}

/// Predicate tree, reduced to the shapes routing cares about
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Compare {
        column: ColumnRef,
        op: CompareOp,
        value: Operand,
    },
    In {
        column: ColumnRef,
        values: Vec<Operand>,
    },
    Between {
        column: ColumnRef,
        low: Operand,
        high: Operand,
    },
    ColumnEquals {
        left: ColumnRef,
        right: ColumnRef,
    },
    Other,
}

/// A table reference and where its name sits in the text
#[derive(Debug, Clone, PartialEq)]
pub struct TableSegment {
    /// Lower-cased logic name
    pub name: String,
    pub alias: Option<String>,
    pub start: usize,
    pub stop: usize,
    pub quote: Option<char>,
    /// Span of a schema qualifier including its trailing dot
    pub schema: Option<(usize, usize)>,
}

/// The `owner` part of `owner.column`
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerSegment {
    pub name: String,
    pub start: usize,
    pub stop: usize,
    pub quote: Option<char>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregationType {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregationType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "COUNT" => Some(AggregationType::Count),
            "SUM" => Some(AggregationType::Sum),
            "AVG" => Some(AggregationType::Avg),
            "MIN" => Some(AggregationType::Min),
            "MAX" => Some(AggregationType::Max),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionKind {
    Wildcard { owner: Option<String> },
    Column(ColumnRef),
    Aggregation {
        function: AggregationType,
        distinct: bool,
        /// Byte span of the argument inside the parentheses, DISTINCT excluded
        argument: (usize, usize),
    },
    Expression,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub kind: ProjectionKind,
    pub alias: Option<String>,
    /// Expression text without the alias
    pub text: String,
    pub start: usize,
    pub stop: usize,
}

impl Projection {
    /// Column label a database reports for this projection, when predictable
    pub fn label(&self) -> Option<&str> {
        if let Some(alias) = &self.alias {
            return Some(alias);
        }
        match &self.kind {
            ProjectionKind::Column(column) => Some(&column.name),
            _ => None,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self.kind, ProjectionKind::Wildcard { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderByExpr {
    Column(ColumnRef),
    /// One-based projection position
    Position(usize),
    /// Normalised expression text
    Expression(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub expr: OrderByExpr,
    pub descending: bool,
    pub nulls_first: Option<bool>,
    /// Byte span of the expression
    pub start: usize,
    pub stop: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaginationValue {
    Literal(u64),
    Parameter(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaginationSegment {
    pub value: PaginationValue,
    pub start: usize,
    pub stop: usize,
}

impl PaginationSegment {
    pub fn resolve(&self, parameters: &[Value]) -> Option<u64> {
        match &self.value {
            PaginationValue::Literal(v) => Some(*v),
            PaginationValue::Parameter(idx) => parameters
                .get(*idx)
                .and_then(|v| v.as_i64())
                .map(|v| v.max(0) as u64),
        }
    }
}

/// LIMIT/OFFSET of one select, with the span of the whole clause
#[derive(Debug, Clone, PartialEq)]
pub struct Pagination {
    pub offset: Option<PaginationSegment>,
    pub limit: Option<PaginationSegment>,
    pub start: usize,
    pub stop: usize,
}

/// One SELECT (or the target of a DML/DDL statement)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectScope {
    pub id: ScopeId,
    /// Enclosing scope; a back-reference by index, never ownership
    pub parent: Option<ScopeId>,
    pub tables: Vec<TableSegment>,
    pub owners: Vec<OwnerSegment>,
    pub predicate: Option<Predicate>,
    pub projections: Vec<Projection>,
    /// Byte offset right after the last projection
    pub projections_stop: usize,
    pub distinct: bool,
    pub group_by: Vec<OrderByItem>,
    pub order_by: Vec<OrderByItem>,
    pub having: bool,
    pub pagination: Option<Pagination>,
    pub has_join: bool,
    /// Appears in FROM (derived table) rather than in an expression
    pub derived: bool,
    /// Qualifies columns with a table bound only in an ancestor scope
    pub correlated: bool,
}

impl SelectScope {
    /// Resolve an owner qualifier (alias or table name) to a logic table
    pub fn resolve_owner(&self, owner: &str) -> Option<&str> {
        self.tables
            .iter()
            .find(|t| t.alias.as_deref() == Some(owner))
            .or_else(|| self.tables.iter().find(|t| t.name == owner && t.alias.is_none()))
            .or_else(|| self.tables.iter().find(|t| t.name == owner))
            .map(|t| t.name.as_str())
    }

    pub fn binds_name(&self, name: &str) -> bool {
        self.tables
            .iter()
            .any(|t| t.name == name || t.alias.as_deref() == Some(name))
    }

    pub fn has_aggregation(&self) -> bool {
        self.projections
            .iter()
            .any(|p| matches!(p.kind, ProjectionKind::Aggregation { .. }))
    }

    pub fn has_distinct_aggregation(&self) -> bool {
        self.projections
            .iter()
            .any(|p| matches!(p.kind, ProjectionKind::Aggregation { distinct: true, .. }))
    }

    /// DISTINCT aggregates mixed with plain aggregates over the same select
    pub fn has_partial_distinct_aggregation(&self) -> bool {
        let mut distinct = false;
        let mut plain = false;
        for projection in &self.projections {
            if let ProjectionKind::Aggregation { distinct: d, .. } = projection.kind {
                if d {
                    distinct = true;
                } else {
                    plain = true;
                }
            }
        }
        distinct && plain
    }
}

/// One VALUES row of an INSERT
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRow {
    pub start: usize,
    pub stop: usize,
    /// Per column: a literal or placeholder, `None` for other expressions
    pub values: Vec<Option<Operand>>,
    /// Placeholder indexes inside the row, in text order
    pub parameters: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertSegment {
    pub table: String,
    pub columns: Vec<String>,
    /// Byte offset of the `)` closing the column list
    pub columns_end: Option<usize>,
    pub rows: Vec<InsertRow>,
    pub values_start: usize,
    pub values_stop: usize,
    /// Placeholders outside the VALUES rows (e.g. ON DUPLICATE KEY UPDATE)
    pub other_parameters: Vec<usize>,
}

impl InsertSegment {
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// A placeholder occurrence in the text
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterMarker {
    pub index: usize,
    pub start: usize,
    pub stop: usize,
}

/// Statement produced by the binder
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub kind: StatementKind,
    /// Arena of scopes; scope 0 is the outermost statement
    pub scopes: Vec<SelectScope>,
    pub insert: Option<InsertSegment>,
    pub set_operation: bool,
    pub parameter_markers: Vec<ParameterMarker>,
    pub parameter_count: usize,
}

impl BoundStatement {
    pub fn root(&self) -> &SelectScope {
        &self.scopes[0]
    }

    /// Distinct logic table names in order of first appearance
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for scope in &self.scopes {
            for table in &scope.tables {
                if !names.contains(&table.name) {
                    names.push(table.name.clone());
                }
            }
        }
        names
    }

    pub fn contains_subquery(&self) -> bool {
        self.scopes.iter().any(|s| s.parent.is_some())
    }

    pub fn contains_correlated_subquery(&self) -> bool {
        self.scopes.iter().any(|s| s.correlated)
    }

    pub fn contains_having(&self) -> bool {
        self.scopes.iter().any(|s| s.having)
    }

    pub fn contains_join(&self) -> bool {
        self.scopes.iter().any(|s| s.has_join)
    }

    /// Scopes from `id` up to the outermost one
    pub fn ancestors(&self, id: ScopeId) -> impl Iterator<Item = &SelectScope> {
        let mut next = self.scopes.get(id).and_then(|s| s.parent);
        std::iter::from_fn(move || {
            let scope = self.scopes.get(next?)?;
            next = scope.parent;
            Some(scope)
        })
    }

    /// Scopes that reference `table`
    pub fn scopes_referencing<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a SelectScope> + 'a {
        self.scopes
            .iter()
            .filter(move |s| s.tables.iter().any(|t| t.name == table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(id: ScopeId, parent: Option<ScopeId>, tables: &[(&str, Option<&str>)]) -> SelectScope {
        SelectScope {
            id,
            parent,
            tables: tables
                .iter()
                .map(|(name, alias)| TableSegment {
                    name: name.to_string(),
                    alias: alias.map(|a| a.to_string()),
                    start: 0,
                    stop: 0,
                    quote: None,
                    schema: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_owner_prefers_alias() {
        let s = scope(0, None, &[("orders", Some("o")), ("order_items", None)]);
        assert_eq!(s.resolve_owner("o"), Some("orders"));
        assert_eq!(s.resolve_owner("order_items"), Some("order_items"));
        assert_eq!(s.resolve_owner("x"), None);
    }

    #[test]
    fn test_ancestors_walk_parent_links() {
        let statement = BoundStatement {
            sql: String::new(),
            kind: StatementKind::Select,
            scopes: vec![
                scope(0, None, &[("orders", None)]),
                scope(1, Some(0), &[("order_items", None)]),
                scope(2, Some(1), &[("users", None)]),
            ],
            insert: None,
            set_operation: false,
            parameter_markers: vec![],
            parameter_count: 0,
        };
        let chain: Vec<ScopeId> = statement.ancestors(2).map(|s| s.id).collect();
        assert_eq!(chain, vec![1, 0]);
        assert!(statement.contains_subquery());
        assert_eq!(statement.table_names(), vec!["orders", "order_items", "users"]);
    }

    #[test]
    fn test_compare_flip() {
        assert_eq!(CompareOp::Lt.flip(), CompareOp::Gt);
        assert_eq!(CompareOp::Eq.flip(), CompareOp::Eq);
    }
}
