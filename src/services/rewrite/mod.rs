// SQL rewriting engine
//
// Generators emit byte-range tokens against the immutable logical text; the
// engine splices them left to right into one physical statement per route unit.

pub mod derived;
pub mod generator;
pub mod parameter;

use serde::Serialize;
use tracing::debug;

use crate::api::middleware::AppError;
use crate::models::{BoundStatement, ParameterMarker, RouteContext, RouteUnit, Value};
use crate::services::condition_extractor::GeneratedKeys;

pub use derived::*;
pub use generator::{GeneratorAids, GeneratorInput, TokenGenerator};
pub use parameter::{ParameterRewriter, PlaceholderStyle};

/// Replacement of the half-open byte range `[start, stop)`
///
/// `parameters` are the values of the `?` placeholders inside `text`, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlToken {
    pub start: usize,
    pub stop: usize,
    pub text: String,
    pub parameters: Vec<Value>,
}

impl SqlToken {
    pub fn new(start: usize, stop: usize, text: impl Into<String>) -> Self {
        Self {
            start,
            stop,
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameters(start: usize, stop: usize, text: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            start,
            stop,
            text: text.into(),
            parameters,
        }
    }

    /// Insertion at `position` that replaces nothing
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Self::new(position, position, text)
    }

    /// Whether `[start, stop)` lies inside a non-empty replaced range
    pub fn covers(&self, start: usize, stop: usize) -> bool {
        self.stop > self.start && start >= self.start && stop <= self.stop
    }
}

/// Splice tokens into `sql`, returning the text and the placeholder values it carries
///
/// Tokens are sorted by `(start, stop)`; overlapping ranges are a generator bug.
pub fn splice(sql: &str, mut tokens: Vec<SqlToken>) -> Result<(String, Vec<Value>), AppError> {
    tokens.sort_by_key(|t| (t.start, t.stop));

    let mut output = String::with_capacity(sql.len() + tokens.iter().map(|t| t.text.len()).sum::<usize>());
    let mut parameters = Vec::new();
    let mut cursor = 0;
    for token in tokens {
        if token.start < cursor || token.stop < token.start || token.stop > sql.len() {
            return Err(AppError::RewriteInvariant(format!(
                "Token [{}, {}) overlaps or leaves the statement (cursor at {}, length {})",
                token.start,
                token.stop,
                cursor,
                sql.len()
            )));
        }
        let piece = sql.get(cursor..token.start).ok_or_else(|| {
            AppError::RewriteInvariant(format!("Token start {} is not a character boundary", token.start))
        })?;
        output.push_str(piece);
        output.push_str(&token.text);
        parameters.extend(token.parameters);
        cursor = token.stop;
    }
    let tail = sql
        .get(cursor..)
        .ok_or_else(|| AppError::RewriteInvariant(format!("Token stop {} is not a character boundary", cursor)))?;
    output.push_str(tail);
    Ok((output, parameters))
}

/// Apply text tokens to `sql`
pub fn apply_tokens(sql: &str, tokens: Vec<SqlToken>) -> Result<String, AppError> {
    splice(sql, tokens).map(|(text, _)| text)
}

/// Render `sql[start..stop)` with the tokens and placeholders that fall inside it
pub fn render_span(
    sql: &str,
    start: usize,
    stop: usize,
    tokens: &[SqlToken],
    markers: &[ParameterMarker],
    parameters: &[Value],
    rewriter: ParameterRewriter,
) -> Result<(String, Vec<Value>), AppError> {
    let fragment = sql
        .get(start..stop)
        .ok_or_else(|| AppError::RewriteInvariant(format!("Span [{}, {}) is not inside the statement", start, stop)))?;
    let shift = |t: &SqlToken| SqlToken {
        start: t.start - start,
        stop: t.stop - start,
        text: t.text.clone(),
        parameters: t.parameters.clone(),
    };
    let mut local: Vec<SqlToken> = tokens
        .iter()
        .filter(|t| t.start >= start && t.stop <= stop && t.stop > t.start)
        .map(shift)
        .collect();
    for marker in markers.iter().filter(|m| m.start >= start && m.stop <= stop) {
        if !local.iter().any(|t| t.covers(marker.start - start, marker.stop - start)) {
            local.push(shift(&rewriter.render(marker, parameters)?));
        }
    }
    splice(fragment, local)
}

/// Replace every placeholder of `sql` with its value as a SQL literal
pub fn splice_parameters(sql: &str, markers: &[ParameterMarker], parameters: &[Value]) -> Result<String, AppError> {
    let tokens = ParameterRewriter::new(PlaceholderStyle::Inline).rewrite(markers, parameters, &[])?;
    apply_tokens(sql, tokens)
}

/// Logical SQL with parameters inlined, for federation and logs
pub fn inline_parameters(statement: &BoundStatement, parameters: &[Value]) -> Result<String, AppError> {
    splice_parameters(&statement.sql, &statement.parameter_markers, parameters)
}

/// Everything the generators may draw on for one statement
pub struct RewriteContext<'a> {
    pub statement: &'a BoundStatement,
    pub parameters: &'a [Value],
    pub route: &'a RouteContext,
    pub generated_keys: Option<&'a GeneratedKeys>,
}

/// Physical SQL for one route unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewrittenUnit {
    pub unit: RouteUnit,
    pub sql: String,
    pub parameters: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct RewriteEngine;

impl RewriteEngine {
    pub fn new() -> Self {
        Self
    }

    /// Tokens of one unit, generators run in their fixed order
    pub fn generate_tokens(&self, context: &RewriteContext<'_>, unit: &RouteUnit) -> Result<Vec<SqlToken>, AppError> {
        let mut tokens: Vec<SqlToken> = Vec::new();
        for generator in TokenGenerator::ORDERED {
            let aids = generator.aids();
            let input = GeneratorInput {
                statement: context.statement,
                unit,
                parameters: aids.parameters.then_some(context.parameters),
                previous_tokens: aids.previous_tokens.then_some(tokens.as_slice()),
                route: aids.route_context.then_some(context.route),
                generated_keys: if aids.generated_keys { context.generated_keys } else { None },
            };
            let produced = match generator.generate(&input) {
                Ok(produced) => produced,
                Err(err) if generator.is_mandatory() => return Err(err),
                Err(err) => {
                    debug!("{:?} skipped for {}: {}", generator, unit.data_source_name(), err);
                    Vec::new()
                }
            };
            tokens.extend(produced);
        }
        Ok(tokens)
    }

    /// Rewrite the statement for every unit of the route
    pub fn rewrite(&self, context: &RewriteContext<'_>) -> Result<Vec<RewrittenUnit>, AppError> {
        let statement = context.statement;
        let rewriter = ParameterRewriter::new(PlaceholderStyle::Positional);
        let mut rewritten = Vec::with_capacity(context.route.len());
        for unit in context.route.units() {
            let mut tokens = self.generate_tokens(context, unit)?;
            tokens.extend(rewriter.rewrite(&statement.parameter_markers, context.parameters, &tokens)?);
            let (sql, parameters) = splice(&statement.sql, tokens)?;
            debug!("Rewrote for {}: {}", unit.data_source_name(), sql);
            rewritten.push(RewrittenUnit {
                unit: unit.clone(),
                sql,
                parameters,
            });
        }
        Ok(rewritten)
    }
}
