// Token generators
//
// A closed set, run once per route unit in `TokenGenerator::ORDERED`. Each one
// declares the aids it reads; the engine passes `None` for the rest.

use std::collections::BTreeMap;

use super::derived::plan_derived_columns;
use super::{render_span, ParameterRewriter, PlaceholderStyle, SqlToken};
use crate::api::middleware::AppError;
use crate::models::{BoundStatement, PaginationSegment, PaginationValue, RouteContext, RouteUnit, StatementKind, Value};
use crate::services::condition_extractor::GeneratedKeys;
use crate::services::merge::requires_memory_merge;

/// Contextual inputs a generator asks for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorAids {
    pub parameters: bool,
    pub previous_tokens: bool,
    pub route_context: bool,
    pub generated_keys: bool,
}

pub struct GeneratorInput<'a> {
    pub statement: &'a BoundStatement,
    pub unit: &'a RouteUnit,
    pub parameters: Option<&'a [Value]>,
    pub previous_tokens: Option<&'a [SqlToken]>,
    pub route: Option<&'a RouteContext>,
    pub generated_keys: Option<&'a GeneratedKeys>,
}

impl GeneratorInput<'_> {
    fn parameters(&self) -> &[Value] {
        self.parameters.unwrap_or(&[])
    }

    fn previous_tokens(&self) -> &[SqlToken] {
        self.previous_tokens.unwrap_or(&[])
    }

    fn is_multi_unit(&self) -> bool {
        self.route.map(|r| r.len() > 1).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenGenerator {
    TableName,
    SchemaQualifier,
    Projections,
    Pagination,
    InsertValues,
    GeneratedKeyColumn,
}

impl TokenGenerator {
    pub const ORDERED: [TokenGenerator; 6] = [
        TokenGenerator::TableName,
        TokenGenerator::SchemaQualifier,
        TokenGenerator::Projections,
        TokenGenerator::Pagination,
        TokenGenerator::InsertValues,
        TokenGenerator::GeneratedKeyColumn,
    ];

    pub fn aids(&self) -> GeneratorAids {
        match self {
            TokenGenerator::TableName | TokenGenerator::SchemaQualifier => GeneratorAids::default(),
            TokenGenerator::Projections => GeneratorAids {
                parameters: true,
                previous_tokens: true,
                route_context: true,
                ..Default::default()
            },
            TokenGenerator::Pagination => GeneratorAids {
                parameters: true,
                route_context: true,
                ..Default::default()
            },
            TokenGenerator::InsertValues => GeneratorAids {
                parameters: true,
                previous_tokens: true,
                route_context: true,
                generated_keys: true,
            },
            TokenGenerator::GeneratedKeyColumn => GeneratorAids {
                generated_keys: true,
                ..Default::default()
            },
        }
    }

    /// A failing mandatory generator aborts the rewrite; others degrade to no tokens
    pub fn is_mandatory(&self) -> bool {
        matches!(
            self,
            TokenGenerator::TableName | TokenGenerator::Pagination | TokenGenerator::InsertValues
        )
    }

    pub fn generate(&self, input: &GeneratorInput<'_>) -> Result<Vec<SqlToken>, AppError> {
        match self {
            TokenGenerator::TableName => table_names(input),
            TokenGenerator::SchemaQualifier => Ok(schema_qualifiers(input)),
            TokenGenerator::Projections => projections(input),
            TokenGenerator::Pagination => pagination(input),
            TokenGenerator::InsertValues => insert_values(input),
            TokenGenerator::GeneratedKeyColumn => Ok(generated_key_column(input)),
        }
    }
}

fn quoted(name: &str, quote: Option<char>) -> String {
    match quote {
        Some('[') => format!("[{}]", name),
        Some(q) => format!("{}{}{}", q, name, q),
        None => name.to_string(),
    }
}

fn table_names(input: &GeneratorInput<'_>) -> Result<Vec<SqlToken>, AppError> {
    let statement = input.statement;
    let aliases: Vec<&str> = statement
        .scopes
        .iter()
        .flat_map(|s| s.tables.iter().filter_map(|t| t.alias.as_deref()))
        .collect();

    // Keyed by span: a segment seen from two scopes is still one token
    let mut tokens: BTreeMap<(usize, usize), SqlToken> = BTreeMap::new();
    for scope in &statement.scopes {
        for table in &scope.tables {
            match input.unit.actual_table(&table.name) {
                Some(actual) => {
                    tokens.insert(
                        (table.start, table.stop),
                        SqlToken::new(table.start, table.stop, quoted(actual, table.quote)),
                    );
                }
                None if !input.unit.table_mappers.is_empty() => {
                    return Err(AppError::RewriteInvariant(format!(
                        "Route unit on '{}' has no actual table for '{}'",
                        input.unit.data_source_name(),
                        table.name
                    )));
                }
                None => {}
            }
        }
        for owner in &scope.owners {
            if aliases.contains(&owner.name.as_str()) {
                continue;
            }
            if let Some(actual) = input.unit.actual_table(&owner.name) {
                tokens.insert(
                    (owner.start, owner.stop),
                    SqlToken::new(owner.start, owner.stop, quoted(actual, owner.quote)),
                );
            }
        }
    }
    Ok(tokens.into_values().collect())
}

fn schema_qualifiers(input: &GeneratorInput<'_>) -> Vec<SqlToken> {
    input
        .statement
        .scopes
        .iter()
        .flat_map(|s| s.tables.iter())
        .filter_map(|t| t.schema)
        .map(|(start, stop)| SqlToken::new(start, stop, ""))
        .collect()
}

fn projections(input: &GeneratorInput<'_>) -> Result<Vec<SqlToken>, AppError> {
    let statement = input.statement;
    if statement.kind != StatementKind::Select || statement.set_operation || !input.is_multi_unit() {
        return Ok(Vec::new());
    }
    let scope = statement.root();
    let derived = plan_derived_columns(scope);
    if derived.is_empty() {
        return Ok(Vec::new());
    }

    let rewriter = ParameterRewriter::new(PlaceholderStyle::Positional);
    let mut text = String::new();
    let mut parameters = Vec::new();
    for column in &derived {
        let (expression, values) = render_span(
            &statement.sql,
            column.start,
            column.stop,
            input.previous_tokens(),
            &statement.parameter_markers,
            input.parameters(),
            rewriter,
        )?;
        let expression = match column.function {
            Some(function) => format!("{}({})", function, expression),
            None => expression,
        };
        text.push_str(&format!(", {} AS {}", expression, column.alias));
        parameters.extend(values);
    }
    Ok(vec![SqlToken::with_parameters(
        scope.projections_stop,
        scope.projections_stop,
        text,
        parameters,
    )])
}

fn resolve_segment(segment: &PaginationSegment, parameters: &[Value]) -> Result<u64, AppError> {
    segment.resolve(parameters).ok_or_else(|| {
        AppError::InvalidSql("Pagination parameter is missing or not an integer".to_string())
    })
}

/// Replace a pagination value, keeping a placeholder a placeholder
fn pagination_token(segment: &PaginationSegment, value: u64) -> SqlToken {
    match segment.value {
        PaginationValue::Literal(_) => SqlToken::new(segment.start, segment.stop, value.to_string()),
        PaginationValue::Parameter(_) => SqlToken::with_parameters(
            segment.start,
            segment.stop,
            "?",
            vec![Value::Int(i64::try_from(value).unwrap_or(i64::MAX))],
        ),
    }
}

fn pagination(input: &GeneratorInput<'_>) -> Result<Vec<SqlToken>, AppError> {
    let statement = input.statement;
    if statement.kind != StatementKind::Select || statement.set_operation || !input.is_multi_unit() {
        return Ok(Vec::new());
    }
    let scope = statement.root();
    let Some(clause) = &scope.pagination else {
        return Ok(Vec::new());
    };

    if requires_memory_merge(scope) {
        // Grouped rows are only final after the merge; every shard must return all groups
        return Ok(vec![SqlToken::new(clause.start, clause.stop, "")]);
    }

    let parameters = input.parameters();
    let offset = match &clause.offset {
        Some(segment) => resolve_segment(segment, parameters)?,
        None => 0,
    };
    let mut tokens = Vec::new();
    if let Some(segment) = &clause.offset {
        tokens.push(pagination_token(segment, 0));
    }
    if let Some(segment) = &clause.limit {
        let limit = resolve_segment(segment, parameters)?;
        tokens.push(pagination_token(segment, offset.saturating_add(limit)));
    }
    Ok(tokens)
}

fn insert_values(input: &GeneratorInput<'_>) -> Result<Vec<SqlToken>, AppError> {
    let statement = input.statement;
    let Some(insert) = &statement.insert else {
        return Ok(Vec::new());
    };
    let owned = input.route.map(|r| r.insert_rows(input.unit)).unwrap_or_default();
    let keys = input.generated_keys;
    let all_rows = owned.is_empty() || owned.len() == insert.rows.len();
    if all_rows && keys.is_none() {
        return Ok(Vec::new());
    }
    let rows: Vec<usize> = if owned.is_empty() {
        (0..insert.rows.len()).collect()
    } else {
        owned
    };

    let rewriter = ParameterRewriter::new(PlaceholderStyle::Positional);
    let mut parts = Vec::with_capacity(rows.len());
    let mut parameters = Vec::new();
    for index in rows {
        let row = insert.rows.get(index).ok_or_else(|| {
            AppError::RewriteInvariant(format!("Route owns INSERT row {} that does not exist", index))
        })?;
        let (mut text, values) = render_span(
            &statement.sql,
            row.start,
            row.stop,
            input.previous_tokens(),
            &statement.parameter_markers,
            input.parameters(),
            rewriter,
        )?;
        parameters.extend(values);
        if let Some(keys) = keys {
            let key = keys.values.get(index).cloned().ok_or_else(|| {
                AppError::RewriteInvariant(format!("No generated key for INSERT row {}", index))
            })?;
            // drop the closing parenthesis, append the key, close again
            text.pop();
            if row.parameters.is_empty() {
                text.push_str(&format!(", {})", key.to_sql_literal()));
            } else {
                text.push_str(", ?)");
                parameters.push(key);
            }
        }
        parts.push(text);
    }
    Ok(vec![SqlToken::with_parameters(
        insert.values_start,
        insert.values_stop,
        parts.join(", "),
        parameters,
    )])
}

fn generated_key_column(input: &GeneratorInput<'_>) -> Vec<SqlToken> {
    match (&input.statement.insert, input.generated_keys) {
        (Some(insert), Some(keys)) => insert
            .columns_end
            .map(|position| vec![SqlToken::insert(position, format!(", {}", keys.column))])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}
