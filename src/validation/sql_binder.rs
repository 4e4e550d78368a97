// SQL binder
//
// Turns SQL text into a `BoundStatement`. The sqlparser tokenizer supplies token
// spans, clause structure is recovered from the token stream, and predicates are
// handed to sqlparser's expression parser.

use sqlparser::ast::{BinaryOperator, Expr, UnaryOperator, Value as SqlValue};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Location, Token, Tokenizer};
use std::collections::HashSet;
use std::ops::Range;

use crate::api::middleware::AppError;
use crate::models::{
    AggregationType, BoundStatement, ColumnRef, CompareOp, InsertRow, InsertSegment, Operand,
    OrderByExpr, OrderByItem, OwnerSegment, Pagination, PaginationSegment, PaginationValue,
    ParameterMarker, Predicate, Projection, ProjectionKind, ScopeId, SelectScope, StatementKind,
    TableSegment, Value,
};

/// Words that end a FROM item and can never be a table alias
const NON_ALIAS_WORDS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "FETCH", "FOR", "WINDOW", "JOIN",
    "INNER", "LEFT", "RIGHT", "FULL", "CROSS", "OUTER", "NATURAL", "STRAIGHT_JOIN", "ON", "USING",
    "UNION", "EXCEPT", "INTERSECT", "SET", "VALUES", "VALUE", "LATERAL", "RETURNING",
];

const JOIN_WORDS: &[&str] = &["JOIN", "INNER", "LEFT", "RIGHT", "FULL", "CROSS", "OUTER", "NATURAL", "STRAIGHT_JOIN", "SEMI", "ANTI"];

const SET_OPERATION_WORDS: &[&str] = &["UNION", "INTERSECT", "EXCEPT", "MINUS"];

#[derive(Debug, Clone)]
struct Lexeme {
    token: Token,
    start: usize,
    stop: usize,
    param: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    From,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Limit,
    Offset,
    Tail,
}

/// SQL binder producing bound statements from text
#[derive(Debug, Default, Clone)]
pub struct SqlBinder;

impl SqlBinder {
    pub fn new() -> Self {
        Self
    }

    /// Bind one SQL statement
    ///
    /// # Arguments
    /// * `sql` - statement text, optionally ending with `;`
    ///
    /// # Returns
    /// The bound statement, or `InvalidSql`/`Unsupported` when it cannot be bound
    pub fn bind(&self, sql: &str) -> Result<BoundStatement, AppError> {
        let mut lexemes = lex(sql)?;
        while matches!(lexemes.last().map(|l| &l.token), Some(Token::SemiColon)) {
            lexemes.pop();
        }
        if lexemes.is_empty() {
            return Err(AppError::InvalidSql("SQL statement is empty".to_string()));
        }
        if lexemes.iter().any(|l| l.token == Token::SemiColon) {
            return Err(AppError::InvalidSql(
                "Multiple statements are not allowed; submit one statement at a time".to_string(),
            ));
        }

        let matching = match_parens(&lexemes)?;
        let parameter_markers: Vec<ParameterMarker> = lexemes
            .iter()
            .filter_map(|l| {
                l.param.map(|index| ParameterMarker {
                    index,
                    start: l.start,
                    stop: l.stop,
                })
            })
            .collect();
        let parameter_count = parameter_markers.iter().map(|m| m.index + 1).max().unwrap_or(0);

        let mut ctx = BindContext {
            sql,
            lex: lexemes,
            matching,
            scopes: Vec::new(),
            consumed: HashSet::new(),
            set_operation: false,
        };

        let end = ctx.lex.len();
        let first = ctx.upper(0).unwrap_or_default();
        let (kind, insert) = match first.as_str() {
            "SELECT" | "WITH" => {
                ctx.bind_query(0..end, None, false)?;
                (StatementKind::Select, None)
            }
            _ if ctx.lex[0].token == Token::LParen => {
                ctx.bind_query(0..end, None, false)?;
                (StatementKind::Select, None)
            }
            "INSERT" | "REPLACE" => {
                let insert = ctx.bind_insert(end)?;
                (StatementKind::Insert, Some(insert))
            }
            "UPDATE" => {
                ctx.bind_update(end)?;
                (StatementKind::Update, None)
            }
            "DELETE" => {
                ctx.bind_delete(end)?;
                (StatementKind::Delete, None)
            }
            "CREATE" | "ALTER" | "DROP" | "TRUNCATE" => {
                ctx.bind_ddl(end)?;
                (StatementKind::Ddl, None)
            }
            _ => {
                ctx.scopes.push(SelectScope::default());
                (StatementKind::Other, None)
            }
        };

        ctx.mark_correlated();

        tracing::debug!(
            "Bound {:?} statement with {} scope(s) and {} parameter(s)",
            kind,
            ctx.scopes.len(),
            parameter_count
        );

        Ok(BoundStatement {
            sql: sql.to_string(),
            kind,
            scopes: ctx.scopes,
            insert,
            set_operation: ctx.set_operation,
            parameter_markers,
            parameter_count,
        })
    }
}

/// Placeholders of an SQL text with their byte spans, numbered like the binder numbers them
pub fn locate_placeholders(sql: &str) -> Result<Vec<ParameterMarker>, AppError> {
    Ok(lex(sql)?
        .into_iter()
        .filter_map(|l| {
            l.param.map(|index| ParameterMarker {
                index,
                start: l.start,
                stop: l.stop,
            })
        })
        .collect())
}

/// Tokenize and convert sqlparser locations to byte offsets
fn lex(sql: &str) -> Result<Vec<Lexeme>, AppError> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize_with_location()
        .map_err(|e| AppError::InvalidSql(format!("SQL tokenization error: {}", e)))?;

    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect();
    let to_byte = |loc: Location| -> usize {
        let line = (loc.line.max(1) as usize - 1).min(line_starts.len() - 1);
        let line_start = line_starts[line];
        let column = loc.column.max(1) as usize - 1;
        sql[line_start..]
            .char_indices()
            .nth(column)
            .map(|(offset, _)| line_start + offset)
            .unwrap_or(sql.len())
    };

    let mut next_param = 0usize;
    let mut lexemes = Vec::with_capacity(tokens.len());
    for t in tokens {
        if matches!(t.token, Token::Whitespace(_) | Token::EOF) {
            continue;
        }
        let param = match &t.token {
            Token::Placeholder(p) => {
                let explicit = p.strip_prefix('$').and_then(|n| n.parse::<usize>().ok()).filter(|n| *n > 0);
                match explicit {
                    Some(n) => Some(n - 1),
                    None => {
                        next_param += 1;
                        Some(next_param - 1)
                    }
                }
            }
            _ => None,
        };
        lexemes.push(Lexeme {
            start: to_byte(t.span.start),
            stop: to_byte(t.span.end),
            token: t.token,
            param,
        });
    }
    Ok(lexemes)
}

fn match_parens(lexemes: &[Lexeme]) -> Result<Vec<Option<usize>>, AppError> {
    let mut matching = vec![None; lexemes.len()];
    let mut stack = Vec::new();
    for (i, l) in lexemes.iter().enumerate() {
        match l.token {
            Token::LParen => stack.push(i),
            Token::RParen => {
                let open = stack
                    .pop()
                    .ok_or_else(|| AppError::InvalidSql("Unbalanced ')' in statement".to_string()))?;
                matching[open] = Some(i);
                matching[i] = Some(open);
            }
            _ => {}
        }
    }
    if !stack.is_empty() {
        return Err(AppError::InvalidSql("Unbalanced '(' in statement".to_string()));
    }
    Ok(matching)
}

struct BindContext<'a> {
    sql: &'a str,
    lex: Vec<Lexeme>,
    matching: Vec<Option<usize>>,
    scopes: Vec<SelectScope>,
    /// Token indexes consumed as table or schema names
    consumed: HashSet<usize>,
    set_operation: bool,
}

impl<'a> BindContext<'a> {
    // ---- token helpers ----

    /// Upper-cased text of an unquoted word
    fn upper(&self, i: usize) -> Option<String> {
        match self.lex.get(i).map(|l| &l.token) {
            Some(Token::Word(w)) if w.quote_style.is_none() => Some(w.value.to_uppercase()),
            _ => None,
        }
    }

    fn is_word(&self, i: usize, word: &str) -> bool {
        self.upper(i).as_deref() == Some(word)
    }

    fn is_any_word(&self, i: usize, words: &[&str]) -> bool {
        self.upper(i).map(|w| words.contains(&w.as_str())).unwrap_or(false)
    }

    fn is_token(&self, i: usize, token: &Token) -> bool {
        self.lex.get(i).map(|l| &l.token == token).unwrap_or(false)
    }

    /// Identifier value and quote style of a word token
    fn ident(&self, i: usize) -> Option<(String, Option<char>)> {
        match self.lex.get(i).map(|l| &l.token) {
            Some(Token::Word(w)) => Some((w.value.clone(), w.quote_style)),
            _ => None,
        }
    }

    fn close_of(&self, open: usize) -> Result<usize, AppError> {
        self.matching
            .get(open)
            .copied()
            .flatten()
            .ok_or_else(|| AppError::InvalidSql("Unbalanced parenthesis".to_string()))
    }

    /// Next index at the same nesting depth
    fn step(&self, i: usize) -> usize {
        if self.lex[i].token == Token::LParen {
            self.matching[i].map(|c| c + 1).unwrap_or(i + 1)
        } else {
            i + 1
        }
    }

    fn text(&self, range: &Range<usize>) -> &'a str {
        if range.start >= range.end {
            return "";
        }
        &self.sql[self.lex[range.start].start..self.lex[range.end - 1].stop]
    }

    /// Split a token range at top-level commas
    fn split_commas(&self, range: Range<usize>) -> Vec<Range<usize>> {
        let mut items = Vec::new();
        let mut start = range.start;
        let mut i = range.start;
        while i < range.end {
            if self.lex[i].token == Token::Comma {
                items.push(start..i);
                start = i + 1;
                i += 1;
            } else {
                i = self.step(i);
            }
        }
        if start < range.end {
            items.push(start..range.end);
        }
        items
    }

    fn starts_query(&self, i: usize) -> bool {
        self.is_any_word(i, &["SELECT", "WITH"])
            || (self.is_token(i, &Token::LParen) && self.starts_query(i + 1))
    }

    // ---- queries ----

    /// Bind a query that may be a set operation or a WITH query
    fn bind_query(&mut self, range: Range<usize>, parent: Option<ScopeId>, derived: bool) -> Result<ScopeId, AppError> {
        let range = self.strip_parens(range);

        if self.is_word(range.start, "WITH") {
            return self.bind_with(range, parent, derived);
        }

        let mut branches = Vec::new();
        let mut start = range.start;
        let mut i = range.start;
        while i < range.end {
            if self.is_any_word(i, SET_OPERATION_WORDS) {
                branches.push(start..i);
                i += 1;
                while self.is_any_word(i, &["ALL", "DISTINCT"]) {
                    i += 1;
                }
                start = i;
            } else {
                i = self.step(i);
            }
        }
        branches.push(start..range.end);

        if branches.len() == 1 {
            return self.bind_select(range, parent, derived);
        }

        self.set_operation = true;
        let mut first = None;
        for branch in branches {
            let id = self.bind_select(branch, parent, derived)?;
            first.get_or_insert(id);
        }
        first.ok_or_else(|| AppError::InvalidSql("Empty set operation".to_string()))
    }

    fn strip_parens(&self, mut range: Range<usize>) -> Range<usize> {
        while range.end > range.start + 1
            && self.lex[range.start].token == Token::LParen
            && self.matching[range.start] == Some(range.end - 1)
        {
            range = range.start + 1..range.end - 1;
        }
        range
    }

    /// `WITH name AS (query) [, ...] main_query`: the main query owns the CTE scopes
    fn bind_with(&mut self, range: Range<usize>, parent: Option<ScopeId>, derived: bool) -> Result<ScopeId, AppError> {
        let mut i = range.start + 1;
        if self.is_word(i, "RECURSIVE") {
            i += 1;
        }
        let mut bodies = Vec::new();
        loop {
            // name [(columns)] AS [NOT] [MATERIALIZED] (body)
            while i < range.end && self.lex[i].token != Token::LParen {
                i += 1;
            }
            if i < range.end && !self.is_word(i.saturating_sub(1), "AS") && self.is_word(self.close_of(i)? + 1, "AS") {
                // column list, the body follows
                i = self.close_of(i)? + 1;
                continue;
            }
            if i >= range.end {
                return Err(AppError::InvalidSql("Malformed WITH clause".to_string()));
            }
            let close = self.close_of(i)?;
            bodies.push(i + 1..close);
            i = close + 1;
            if self.is_token(i, &Token::Comma) {
                i += 1;
                continue;
            }
            break;
        }

        let root = self.bind_query(i..range.end, parent, derived)?;
        for body in bodies {
            self.bind_query(body, Some(root), true)?;
        }
        Ok(root)
    }

    fn bind_select(&mut self, range: Range<usize>, parent: Option<ScopeId>, derived: bool) -> Result<ScopeId, AppError> {
        let range = self.strip_parens(range);
        if !self.is_word(range.start, "SELECT") {
            return Err(AppError::InvalidSql(format!(
                "Expected SELECT near '{}'",
                self.text(&(range.start..(range.start + 1).min(range.end)))
            )));
        }

        let id = self.scopes.len();
        self.scopes.push(SelectScope {
            id,
            parent,
            derived,
            ..Default::default()
        });

        // Clause boundaries at this nesting depth
        let mut marks: Vec<(Clause, usize, usize)> = Vec::new();
        let mut i = range.start + 1;
        while i < range.end {
            let clause = match self.upper(i).as_deref() {
                Some("FROM") => Some((Clause::From, 1)),
                Some("WHERE") => Some((Clause::Where, 1)),
                Some("GROUP") if self.is_word(i + 1, "BY") => Some((Clause::GroupBy, 2)),
                Some("HAVING") => Some((Clause::Having, 1)),
                Some("ORDER") if self.is_word(i + 1, "BY") => Some((Clause::OrderBy, 2)),
                Some("LIMIT") => Some((Clause::Limit, 1)),
                Some("OFFSET") => Some((Clause::Offset, 1)),
                Some("FETCH") | Some("FOR") | Some("WINDOW") => Some((Clause::Tail, 1)),
                _ => None,
            };
            if let Some((clause, width)) = clause {
                marks.push((clause, i, i + width));
                i += width;
            } else {
                i = self.step(i);
            }
        }

        let clause_range = |idx: usize| -> Range<usize> {
            let (_, _, body_start) = marks[idx];
            let body_end = marks.get(idx + 1).map(|m| m.1).unwrap_or(range.end);
            body_start..body_end
        };

        // Projections
        let mut proj_start = range.start + 1;
        if self.is_word(proj_start, "DISTINCT") {
            self.scopes[id].distinct = true;
            proj_start += 1;
        } else if self.is_word(proj_start, "ALL") {
            proj_start += 1;
        }
        let proj_end = marks.first().map(|m| m.1).unwrap_or(range.end);
        let projections = self.bind_projections(proj_start..proj_end, id)?;
        let projections_stop = if proj_end > proj_start {
            self.lex[proj_end - 1].stop
        } else {
            self.lex[range.start].stop
        };
        self.scopes[id].projections = projections;
        self.scopes[id].projections_stop = projections_stop;

        let mut predicates = Vec::new();
        let mut pagination_parts: Vec<(Clause, Range<usize>, usize)> = Vec::new();
        for idx in 0..marks.len() {
            let (clause, keyword, _) = marks[idx];
            let body = clause_range(idx);
            match clause {
                Clause::From => {
                    let join_predicates = self.bind_from(body, id)?;
                    predicates.extend(join_predicates);
                }
                Clause::Where => {
                    self.bind_subqueries(body.clone(), id)?;
                    predicates.push(self.parse_predicate(body));
                }
                Clause::GroupBy => {
                    self.bind_subqueries(body.clone(), id)?;
                    let items = self.bind_order_items(body);
                    self.scopes[id].group_by = items;
                }
                Clause::Having => {
                    self.bind_subqueries(body, id)?;
                    self.scopes[id].having = true;
                }
                Clause::OrderBy => {
                    self.bind_subqueries(body.clone(), id)?;
                    let items = self.bind_order_items(body);
                    self.scopes[id].order_by = items;
                }
                Clause::Limit | Clause::Offset => pagination_parts.push((clause, body, keyword)),
                Clause::Tail => {}
            }
        }

        self.scopes[id].predicate = combine_and(predicates);
        if !pagination_parts.is_empty() {
            self.scopes[id].pagination = Some(self.bind_pagination(&pagination_parts)?);
        }
        self.collect_owners(range, id);
        Ok(id)
    }

    fn bind_projections(&mut self, range: Range<usize>, scope: ScopeId) -> Result<Vec<Projection>, AppError> {
        self.bind_subqueries(range.clone(), scope)?;
        let mut projections = Vec::new();
        for item in self.split_commas(range) {
            if item.is_empty() {
                continue;
            }
            let (expr, alias) = self.split_alias(item.clone());
            let kind = self.projection_kind(expr.clone());
            projections.push(Projection {
                kind,
                alias,
                text: self.text(&expr).to_string(),
                start: self.lex[item.start].start,
                stop: self.lex[item.end - 1].stop,
            });
        }
        Ok(projections)
    }

    /// Separate `expr [AS] alias`
    fn split_alias(&self, item: Range<usize>) -> (Range<usize>, Option<String>) {
        let len = item.end - item.start;
        if len >= 3 && self.is_word(item.end - 2, "AS") {
            if let Some((alias, _)) = self.ident(item.end - 1) {
                return (item.start..item.end - 2, Some(alias.to_lowercase()));
            }
        }
        if len >= 2 {
            let last = item.end - 1;
            let prev = &self.lex[last - 1].token;
            let implicit = matches!(&self.lex[last].token, Token::Word(_))
                && !self.is_any_word(last, &["END", "DESC", "ASC"])
                && matches!(prev, Token::Word(_) | Token::RParen | Token::Number(_, _) | Token::SingleQuotedString(_))
                && !self.is_any_word(last - 1, &["DISTINCT", "CASE", "NOT", "AND", "OR", "IS", "ELSE", "THEN", "WHEN"]);
            if implicit {
                if let Some((alias, _)) = self.ident(last) {
                    return (item.start..last, Some(alias.to_lowercase()));
                }
            }
        }
        (item, None)
    }

    fn projection_kind(&self, expr: Range<usize>) -> ProjectionKind {
        let len = expr.end - expr.start;
        let s = expr.start;
        if len == 1 && self.lex[s].token == Token::Mul {
            return ProjectionKind::Wildcard { owner: None };
        }
        if len == 3 && self.lex[s + 1].token == Token::Period && self.lex[s + 2].token == Token::Mul {
            return ProjectionKind::Wildcard {
                owner: self.ident(s).map(|(o, _)| o.to_lowercase()),
            };
        }
        if let Some(column) = self.column_ref(expr.clone()) {
            return ProjectionKind::Column(column);
        }
        if len >= 3 && self.lex[s + 1].token == Token::LParen && self.matching[s + 1] == Some(expr.end - 1) {
            if let Some(function) = self.upper(s).and_then(|name| AggregationType::from_name(&name)) {
                let mut arg_start = s + 2;
                let distinct = self.is_word(arg_start, "DISTINCT");
                if distinct {
                    arg_start += 1;
                }
                let arg_end = expr.end - 1;
                if arg_start < arg_end {
                    return ProjectionKind::Aggregation {
                        function,
                        distinct,
                        argument: (self.lex[arg_start].start, self.lex[arg_end - 1].stop),
                    };
                }
            }
        }
        ProjectionKind::Expression
    }

    /// `col`, `owner.col` or `schema.owner.col`
    fn column_ref(&self, range: Range<usize>) -> Option<ColumnRef> {
        let len = range.end - range.start;
        let s = range.start;
        let word = |i: usize| self.ident(i).map(|(v, _)| v);
        match len {
            1 => {
                if self.is_any_word(s, &["NULL", "TRUE", "FALSE"]) {
                    return None;
                }
                word(s).map(|name| ColumnRef::new(None, &name))
            }
            3 if self.lex[s + 1].token == Token::Period => {
                Some(ColumnRef::new(Some(&word(s)?), &word(s + 2)?))
            }
            5 if self.lex[s + 1].token == Token::Period && self.lex[s + 3].token == Token::Period => {
                Some(ColumnRef::new(Some(&word(s + 2)?), &word(s + 4)?))
            }
            _ => None,
        }
    }

    /// Parse FROM items; returns the ON predicates
    fn bind_from(&mut self, range: Range<usize>, scope: ScopeId) -> Result<Vec<Predicate>, AppError> {
        let mut predicates = Vec::new();
        let mut i = range.start;
        let mut factors = 0;
        while i < range.end {
            if self.lex[i].token == Token::Comma {
                i += 1;
                continue;
            }
            if self.is_any_word(i, JOIN_WORDS) {
                while i < range.end && !self.is_any_word(i, &["JOIN", "STRAIGHT_JOIN"]) {
                    i += 1;
                }
                i += 1;
                continue;
            }
            if self.is_word(i, "LATERAL") {
                i += 1;
                continue;
            }
            if self.is_word(i, "ON") {
                let mut end = i + 1;
                while end < range.end
                    && self.lex[end].token != Token::Comma
                    && !self.is_any_word(end, JOIN_WORDS)
                {
                    end = self.step(end);
                }
                self.bind_subqueries(i + 1..end, scope)?;
                predicates.push(self.parse_predicate(i + 1..end));
                i = end;
                continue;
            }
            if self.is_word(i, "USING") {
                i += 1;
                if self.is_token(i, &Token::LParen) {
                    i = self.close_of(i)? + 1;
                }
                continue;
            }

            factors += 1;
            i = self.bind_table_factor(i, range.end, scope)?;
        }
        if factors > 1 {
            self.scopes[scope].has_join = true;
        }
        Ok(predicates)
    }

    /// Bind one table factor starting at `i`; returns the index after it
    fn bind_table_factor(&mut self, i: usize, end: usize, scope: ScopeId) -> Result<usize, AppError> {
        if self.lex[i].token == Token::LParen {
            let close = self.close_of(i)?;
            if self.starts_query(i + 1) {
                self.bind_query(i + 1..close, Some(scope), true)?;
            } else {
                let inner = self.bind_from(i + 1..close, scope)?;
                let existing = self.scopes[scope].predicate.take();
                self.scopes[scope].predicate = combine_and(existing.into_iter().chain(inner).collect());
                self.scopes[scope].has_join = true;
            }
            let mut next = close + 1;
            // derived alias
            if self.is_word(next, "AS") {
                next += 1;
            }
            if self.ident(next).is_some() && !self.is_any_word(next, NON_ALIAS_WORDS) {
                next += 1;
                if self.is_token(next, &Token::LParen) {
                    next = self.close_of(next)? + 1;
                }
            }
            return Ok(next);
        }

        // name [. name [. name]]
        let mut parts = vec![i];
        let mut next = i + 1;
        while next + 1 < end && self.lex[next].token == Token::Period && self.ident(next + 1).is_some() {
            parts.push(next + 1);
            next += 2;
        }
        let Some(&table_idx) = parts.last() else {
            return Ok(next);
        };
        let Some((name, quote)) = self.ident(table_idx) else {
            return Err(AppError::InvalidSql(format!(
                "Expected a table name near '{}'",
                self.text(&(i..i + 1))
            )));
        };

        if self.is_token(next, &Token::LParen) {
            // table function such as generate_series(...): not a table
            let close = self.close_of(next)?;
            self.bind_subqueries(next..close + 1, scope)?;
            next = close + 1;
        } else {
            let schema = if parts.len() > 1 {
                Some((self.lex[parts[0]].start, self.lex[table_idx].start))
            } else {
                None
            };
            for p in &parts {
                self.consumed.insert(*p);
            }
            let alias = self.bind_alias(&mut next, end);
            self.scopes[scope].tables.push(TableSegment {
                name: name.to_lowercase(),
                alias,
                start: self.lex[table_idx].start,
                stop: self.lex[table_idx].stop,
                quote,
                schema,
            });
            return Ok(next);
        }

        let _ = self.bind_alias(&mut next, end);
        Ok(next)
    }

    fn bind_alias(&self, next: &mut usize, end: usize) -> Option<String> {
        if *next < end && self.is_word(*next, "AS") {
            *next += 1;
        }
        if *next < end && self.ident(*next).is_some() && !self.is_any_word(*next, NON_ALIAS_WORDS) {
            let alias = self.ident(*next).map(|(a, _)| a.to_lowercase());
            *next += 1;
            return alias;
        }
        None
    }

    /// Bind every `(SELECT ...)` found anywhere inside `range` as a child scope
    fn bind_subqueries(&mut self, range: Range<usize>, scope: ScopeId) -> Result<(), AppError> {
        let mut i = range.start;
        while i < range.end {
            if self.lex[i].token == Token::LParen && self.starts_query(i + 1) {
                let close = self.close_of(i)?;
                self.bind_query(i + 1..close, Some(scope), false)?;
                i = close + 1;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Collect `owner.column` qualifiers that belong to this scope
    fn collect_owners(&mut self, range: Range<usize>, scope: ScopeId) {
        let mut owners = Vec::new();
        let mut i = range.start;
        while i < range.end {
            if self.lex[i].token == Token::LParen && self.starts_query(i + 1) {
                i = self.matching[i].map(|c| c + 1).unwrap_or(i + 1);
                continue;
            }
            let qualifies = !self.consumed.contains(&i)
                && matches!(self.lex[i].token, Token::Word(_))
                && self.is_token(i + 1, &Token::Period)
                && (i == 0 || !self.is_token(i - 1, &Token::Period))
                && matches!(self.lex.get(i + 2).map(|l| &l.token), Some(Token::Word(_)) | Some(Token::Mul));
            if qualifies {
                // schema.owner.column: the owner is the middle part
                let owner_idx = if self.is_token(i + 3, &Token::Period)
                    && matches!(self.lex.get(i + 4).map(|l| &l.token), Some(Token::Word(_)) | Some(Token::Mul))
                {
                    i + 2
                } else {
                    i
                };
                if let Some((name, quote)) = self.ident(owner_idx) {
                    owners.push(OwnerSegment {
                        name: name.to_lowercase(),
                        start: self.lex[owner_idx].start,
                        stop: self.lex[owner_idx].stop,
                        quote,
                    });
                }
                i = owner_idx + 2;
                continue;
            }
            i += 1;
        }
        self.scopes[scope].owners.extend(owners);
    }

    fn bind_order_items(&self, range: Range<usize>) -> Vec<OrderByItem> {
        let mut items = Vec::new();
        for item in self.split_commas(range) {
            if item.is_empty() {
                continue;
            }
            let mut end = item.end;
            let mut descending = false;
            let mut nulls_first = None;
            if end - item.start >= 2 && self.is_word(end - 2, "NULLS") {
                nulls_first = Some(self.is_word(end - 1, "FIRST"));
                end -= 2;
            }
            if end > item.start && self.is_any_word(end - 1, &["ASC", "DESC"]) {
                descending = self.is_word(end - 1, "DESC");
                end -= 1;
            }
            if end <= item.start {
                continue;
            }
            let expr_range = item.start..end;
            let expr = if end - item.start == 1 {
                match &self.lex[item.start].token {
                    Token::Number(n, _) => n
                        .parse::<usize>()
                        .map(OrderByExpr::Position)
                        .unwrap_or_else(|_| OrderByExpr::Expression(normalize_expression(n))),
                    _ => self
                        .column_ref(expr_range.clone())
                        .map(OrderByExpr::Column)
                        .unwrap_or_else(|| OrderByExpr::Expression(normalize_expression(self.text(&expr_range)))),
                }
            } else {
                self.column_ref(expr_range.clone())
                    .map(OrderByExpr::Column)
                    .unwrap_or_else(|| OrderByExpr::Expression(normalize_expression(self.text(&expr_range))))
            };
            items.push(OrderByItem {
                expr,
                descending,
                nulls_first,
                start: self.lex[item.start].start,
                stop: self.lex[end - 1].stop,
            });
        }
        items
    }

    fn pagination_value(&self, i: usize) -> Result<Option<PaginationSegment>, AppError> {
        let Some(lexeme) = self.lex.get(i) else {
            return Ok(None);
        };
        let value = match &lexeme.token {
            Token::Number(n, _) => PaginationValue::Literal(n.parse().map_err(|_| {
                AppError::InvalidSql(format!("Invalid pagination value '{}'", n))
            })?),
            Token::Placeholder(_) => match lexeme.param {
                Some(idx) => PaginationValue::Parameter(idx),
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
        Ok(Some(PaginationSegment {
            value,
            start: lexeme.start,
            stop: lexeme.stop,
        }))
    }

    fn bind_pagination(&self, parts: &[(Clause, Range<usize>, usize)]) -> Result<Pagination, AppError> {
        let mut offset = None;
        let mut limit = None;
        let mut start = usize::MAX;
        let mut stop = 0;
        for (clause, body, keyword) in parts {
            start = start.min(self.lex[*keyword].start);
            if body.end > body.start {
                stop = stop.max(self.lex[body.end - 1].stop);
            } else {
                stop = stop.max(self.lex[*keyword].stop);
            }
            match clause {
                Clause::Limit => {
                    if self.is_word(body.start, "ALL") {
                        continue;
                    }
                    let first = self.pagination_value(body.start)?;
                    if self.is_token(body.start + 1, &Token::Comma) {
                        // MySQL: LIMIT offset, count
                        offset = first;
                        limit = self.pagination_value(body.start + 2)?;
                    } else {
                        limit = first;
                    }
                }
                Clause::Offset => offset = self.pagination_value(body.start)?,
                _ => {}
            }
        }
        Ok(Pagination { offset, limit, start, stop })
    }

    // ---- predicates ----

    /// Parse a predicate with placeholders renumbered to `$n`
    fn parse_predicate(&self, range: Range<usize>) -> Predicate {
        if range.start >= range.end {
            return Predicate::Other;
        }
        let mut text = String::new();
        let mut cursor = self.lex[range.start].start;
        for l in &self.lex[range.clone()] {
            if let Some(idx) = l.param {
                text.push_str(&self.sql[cursor..l.start]);
                text.push_str(&format!("${}", idx + 1));
                cursor = l.stop;
            }
        }
        text.push_str(&self.sql[cursor..self.lex[range.end - 1].stop]);

        let dialect = GenericDialect {};
        let parsed = Parser::new(&dialect)
            .try_with_sql(&text)
            .and_then(|mut parser| parser.parse_expr());
        match parsed {
            Ok(expr) => convert_expr(&expr),
            Err(e) => {
                tracing::debug!("Predicate not analysable, routing without it: {} ({})", text, e);
                Predicate::Other
            }
        }
    }

    // ---- DML / DDL ----

    fn root_scope(&mut self) -> ScopeId {
        if self.scopes.is_empty() {
            self.scopes.push(SelectScope::default());
        }
        0
    }

    /// Bind a single table name at `i`, registering it on the root scope
    fn bind_target_table(&mut self, i: usize, end: usize) -> Result<usize, AppError> {
        if self.ident(i).is_none() {
            return Err(AppError::InvalidSql(format!(
                "Expected a table name near '{}'",
                self.text(&(i..(i + 1).min(end)))
            )));
        }
        let scope = self.root_scope();
        let before = self.scopes[scope].tables.len();
        let next = self.bind_table_factor(i, end, scope)?;
        if self.scopes[scope].tables.len() == before {
            return Err(AppError::InvalidSql("Expected a table name".to_string()));
        }
        Ok(next)
    }

    fn bind_where_tail(&mut self, from: usize, end: usize) -> Result<(), AppError> {
        let scope = self.root_scope();
        let mut i = from;
        while i < end && !self.is_word(i, "WHERE") {
            i = self.step(i);
        }
        if i < end {
            let mut stop = i + 1;
            while stop < end
                && !(self.is_word(stop, "ORDER") && self.is_word(stop + 1, "BY"))
                && !self.is_any_word(stop, &["LIMIT", "RETURNING"])
            {
                stop = self.step(stop);
            }
            self.bind_subqueries(i + 1..stop, scope)?;
            self.scopes[scope].predicate = match self.parse_predicate(i + 1..stop) {
                Predicate::Other => None,
                p => Some(p),
            };
        }
        self.collect_owners(0..end, scope);
        Ok(())
    }

    fn bind_update(&mut self, end: usize) -> Result<(), AppError> {
        let mut i = 1;
        while self.is_any_word(i, &["LOW_PRIORITY", "IGNORE", "ONLY"]) {
            i += 1;
        }
        let next = self.bind_target_table(i, end)?;
        if self.is_token(next, &Token::Comma) || self.is_any_word(next, JOIN_WORDS) {
            return Err(AppError::Unsupported("Multi-table UPDATE is not supported".to_string()));
        }
        if !self.is_word(next, "SET") {
            return Err(AppError::InvalidSql("UPDATE requires a SET clause".to_string()));
        }
        self.bind_where_tail(next, end)
    }

    fn bind_delete(&mut self, end: usize) -> Result<(), AppError> {
        let mut i = 1;
        while self.is_any_word(i, &["LOW_PRIORITY", "QUICK", "IGNORE"]) {
            i += 1;
        }
        if !self.is_word(i, "FROM") {
            return Err(AppError::Unsupported("Multi-table DELETE is not supported".to_string()));
        }
        let next = self.bind_target_table(i + 1, end)?;
        if self.is_token(next, &Token::Comma) || self.is_any_word(next, &["USING", "JOIN"]) {
            return Err(AppError::Unsupported("Multi-table DELETE is not supported".to_string()));
        }
        self.bind_where_tail(next, end)
    }

    fn bind_insert(&mut self, end: usize) -> Result<InsertSegment, AppError> {
        let mut i = 1;
        while self.is_any_word(i, &["LOW_PRIORITY", "DELAYED", "HIGH_PRIORITY", "IGNORE", "INTO"]) {
            i += 1;
        }
        // INSERT never aliases its target; a following '(' is the column list
        let scope = self.root_scope();
        let mut next = i;
        let mut parts = vec![i];
        next += 1;
        while self.is_token(next, &Token::Period) && self.ident(next + 1).is_some() {
            parts.push(next + 1);
            next += 2;
        }
        let table_idx = *parts.last().unwrap_or(&i);
        let (table, quote) = self
            .ident(table_idx)
            .ok_or_else(|| AppError::InvalidSql("INSERT requires a target table".to_string()))?;
        for p in &parts {
            self.consumed.insert(*p);
        }
        self.scopes[scope].tables.push(TableSegment {
            name: table.to_lowercase(),
            alias: None,
            start: self.lex[table_idx].start,
            stop: self.lex[table_idx].stop,
            quote,
            schema: (parts.len() > 1).then(|| (self.lex[parts[0]].start, self.lex[table_idx].start)),
        });

        let mut columns = Vec::new();
        let mut columns_end = None;
        if self.is_token(next, &Token::LParen) && !self.starts_query(next + 1) {
            let close = self.close_of(next)?;
            for item in self.split_commas(next + 1..close) {
                if let Some((name, _)) = item.clone().last().and_then(|idx| self.ident(idx)) {
                    columns.push(name.to_lowercase());
                }
            }
            columns_end = Some(self.lex[close].start);
            next = close + 1;
        }

        if self.starts_query(next) {
            return Err(AppError::Unsupported("INSERT ... SELECT is not supported".to_string()));
        }
        if !self.is_any_word(next, &["VALUES", "VALUE"]) {
            return Err(AppError::Unsupported(
                "Only INSERT ... VALUES statements are supported".to_string(),
            ));
        }
        next += 1;

        let mut rows = Vec::new();
        while self.is_token(next, &Token::LParen) {
            let close = self.close_of(next)?;
            let values = self
                .split_commas(next + 1..close)
                .into_iter()
                .map(|item| self.operand(item))
                .collect();
            let parameters = self.lex[next..close].iter().filter_map(|l| l.param).collect();
            rows.push(InsertRow {
                start: self.lex[next].start,
                stop: self.lex[close].stop,
                values,
                parameters,
            });
            next = close + 1;
            if self.is_token(next, &Token::Comma) {
                next += 1;
            } else {
                break;
            }
        }
        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            return Err(AppError::InvalidSql("INSERT requires at least one VALUES row".to_string()));
        };
        let (values_start, values_stop) = (first.start, last.stop);

        let other_parameters = self
            .lex
            .iter()
            .filter(|l| l.start < values_start || l.start >= values_stop)
            .filter_map(|l| l.param)
            .collect();
        self.collect_owners(next.min(end)..end, scope);

        Ok(InsertSegment {
            table: table.to_lowercase(),
            columns,
            columns_end,
            rows,
            values_start,
            values_stop,
            other_parameters,
        })
    }

    /// A literal or placeholder occupying a whole token range
    fn operand(&self, range: Range<usize>) -> Option<Operand> {
        let len = range.end - range.start;
        let s = range.start;
        if len == 2 && self.lex[s].token == Token::Minus {
            if let Token::Number(n, _) = &self.lex[s + 1].token {
                return Value::from_number_literal(&format!("-{}", n)).map(Operand::Literal);
            }
        }
        if len != 1 {
            return None;
        }
        if let Some(idx) = self.lex[s].param {
            return Some(Operand::Parameter(idx));
        }
        match &self.lex[s].token {
            Token::Number(n, _) => Value::from_number_literal(n).map(Operand::Literal),
            Token::SingleQuotedString(text) => Some(Operand::Literal(Value::Text(text.clone()))),
            Token::Word(_) => match self.upper(s).as_deref() {
                Some("NULL") => Some(Operand::Literal(Value::Null)),
                Some("TRUE") => Some(Operand::Literal(Value::Bool(true))),
                Some("FALSE") => Some(Operand::Literal(Value::Bool(false))),
                _ => None,
            },
            _ => None,
        }
    }

    fn bind_ddl(&mut self, end: usize) -> Result<(), AppError> {
        let scope = self.root_scope();
        let verb = self.upper(0).unwrap_or_default();
        let mut i = 1;
        while self.is_any_word(i, &["TEMPORARY", "TEMP", "UNIQUE", "GLOBAL", "LOCAL", "OR", "REPLACE"]) {
            i += 1;
        }

        let object = self.upper(i).unwrap_or_default();
        let mut targets = Vec::new();
        match (verb.as_str(), object.as_str()) {
            ("TRUNCATE", _) => {
                let mut j = if object == "TABLE" { i + 1 } else { i };
                if self.is_word(j, "ONLY") {
                    j += 1;
                }
                targets.push(j);
            }
            (_, "TABLE") => {
                let mut j = i + 1;
                while self.is_any_word(j, &["IF", "NOT", "EXISTS"]) {
                    j += 1;
                }
                targets.push(j);
                if verb == "DROP" {
                    // DROP TABLE a, b
                    let mut k = j + 1;
                    while k < end {
                        if self.is_token(k, &Token::Comma) && self.ident(k + 1).is_some() {
                            targets.push(k + 1);
                        }
                        k += 1;
                    }
                }
            }
            (_, "INDEX") => {
                let mut j = i + 1;
                while j < end && !self.is_word(j, "ON") {
                    j = self.step(j);
                }
                if j + 1 < end {
                    let mut k = j + 1;
                    if self.is_word(k, "ONLY") {
                        k += 1;
                    }
                    targets.push(k);
                }
            }
            _ => {}
        }

        for target in targets {
            if self.ident(target).is_some() {
                let mut next = target;
                let mut parts = vec![target];
                next += 1;
                while self.is_token(next, &Token::Period) && self.ident(next + 1).is_some() {
                    parts.push(next + 1);
                    next += 2;
                }
                let table_idx = *parts.last().unwrap_or(&target);
                if let Some((name, quote)) = self.ident(table_idx) {
                    for p in &parts {
                        self.consumed.insert(*p);
                    }
                    self.scopes[scope].tables.push(TableSegment {
                        name: name.to_lowercase(),
                        alias: None,
                        start: self.lex[table_idx].start,
                        stop: self.lex[table_idx].stop,
                        quote,
                        schema: (parts.len() > 1).then(|| (self.lex[parts[0]].start, self.lex[table_idx].start)),
                    });
                }
            }
        }
        Ok(())
    }

    /// Flag child scopes that qualify columns with names bound only by an ancestor
    fn mark_correlated(&mut self) {
        for id in 0..self.scopes.len() {
            let Some(mut parent) = self.scopes[id].parent else {
                continue;
            };
            let own = &self.scopes[id];
            let outer_refs: Vec<String> = own
                .owners
                .iter()
                .filter(|o| !own.binds_name(&o.name))
                .map(|o| o.name.clone())
                .collect();
            let mut correlated = false;
            'walk: loop {
                let ancestor = &self.scopes[parent];
                for name in &outer_refs {
                    if ancestor.binds_name(name) {
                        correlated = true;
                        break 'walk;
                    }
                }
                match ancestor.parent {
                    Some(p) => parent = p,
                    None => break,
                }
            }
            self.scopes[id].correlated = correlated;
        }
    }
}

/// Whitespace-free, lower-cased expression text used to compare ORDER BY items with projections
pub fn normalize_expression(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_lowercase()
}

fn combine_and(mut predicates: Vec<Predicate>) -> Option<Predicate> {
    predicates.retain(|p| *p != Predicate::Other);
    match predicates.len() {
        0 => None,
        1 => predicates.pop(),
        _ => Some(Predicate::And(predicates)),
    }
}

fn expr_column(expr: &Expr) -> Option<ColumnRef> {
    match expr {
        Expr::Identifier(ident) => Some(ColumnRef::new(None, &ident.value)),
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
            let owner = &parts[parts.len() - 2];
            let name = &parts[parts.len() - 1];
            Some(ColumnRef::new(Some(&owner.value), &name.value))
        }
        Expr::Nested(inner) => expr_column(inner),
        _ => None,
    }
}

fn expr_operand(expr: &Expr) -> Option<Operand> {
    match expr {
        Expr::Value(v) => match &v.value {
            SqlValue::Number(n, _) => Value::from_number_literal(n).map(Operand::Literal),
            SqlValue::SingleQuotedString(s) => Some(Operand::Literal(Value::Text(s.clone()))),
            SqlValue::Boolean(b) => Some(Operand::Literal(Value::Bool(*b))),
            SqlValue::Placeholder(p) => p
                .strip_prefix('$')
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .map(|n| Operand::Parameter(n - 1)),
            _ => None,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match expr_operand(expr)? {
            Operand::Literal(Value::Int(v)) => Some(Operand::Literal(Value::Int(-v))),
            Operand::Literal(Value::Float(v)) => Some(Operand::Literal(Value::Float(-v))),
            _ => None,
        },
        Expr::Nested(inner) => expr_operand(inner),
        _ => None,
    }
}

/// Reduce a sqlparser expression to the predicate shapes routing understands
fn convert_expr(expr: &Expr) -> Predicate {
    match expr {
        Expr::Nested(inner) => convert_expr(inner),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut parts = Vec::new();
            for side in [convert_expr(left), convert_expr(right)] {
                match side {
                    Predicate::And(inner) => parts.extend(inner),
                    other => parts.push(other),
                }
            }
            Predicate::And(parts)
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Or,
            right,
        } => {
            let mut parts = Vec::new();
            for side in [convert_expr(left), convert_expr(right)] {
                match side {
                    Predicate::Or(inner) => parts.extend(inner),
                    other => parts.push(other),
                }
            }
            Predicate::Or(parts)
        }
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                BinaryOperator::Eq => CompareOp::Eq,
                BinaryOperator::Lt => CompareOp::Lt,
                BinaryOperator::LtEq => CompareOp::LtEq,
                BinaryOperator::Gt => CompareOp::Gt,
                BinaryOperator::GtEq => CompareOp::GtEq,
                _ => return Predicate::Other,
            };
            match (expr_column(left), expr_column(right)) {
                (Some(left), Some(right)) if op == CompareOp::Eq => Predicate::ColumnEquals { left, right },
                (Some(column), None) => match expr_operand(right) {
                    Some(value) => Predicate::Compare { column, op, value },
                    None => Predicate::Other,
                },
                (None, Some(column)) => match expr_operand(left) {
                    Some(value) => Predicate::Compare {
                        column,
                        op: op.flip(),
                        value,
                    },
                    None => Predicate::Other,
                },
                _ => Predicate::Other,
            }
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let (Some(column), Some(values)) = (
                expr_column(expr),
                list.iter().map(expr_operand).collect::<Option<Vec<_>>>(),
            ) else {
                return Predicate::Other;
            };
            Predicate::In { column, values }
        }
        Expr::Between {
            expr,
            negated: false,
            low,
            high,
        } => match (expr_column(expr), expr_operand(low), expr_operand(high)) {
            (Some(column), Some(low), Some(high)) => Predicate::Between { column, low, high },
            _ => Predicate::Other,
        },
        _ => Predicate::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(sql: &str) -> BoundStatement {
        SqlBinder::new().bind(sql).unwrap()
    }

    #[test]
    fn test_table_spans_are_byte_offsets() {
        let sql = "SELECT * FROM orders o WHERE o.user_id = 7";
        let stmt = bind(sql);
        let table = &stmt.root().tables[0];
        assert_eq!(&sql[table.start..table.stop], "orders");
        assert_eq!(table.alias.as_deref(), Some("o"));
        let owner = &stmt.root().owners[0];
        assert_eq!(&sql[owner.start..owner.stop], "o");
    }

    #[test]
    fn test_multiline_and_unicode_offsets() {
        let sql = "SELECT 'é' AS x\nFROM\n  orders WHERE user_id = ?";
        let stmt = bind(sql);
        let table = &stmt.root().tables[0];
        assert_eq!(&sql[table.start..table.stop], "orders");
        let marker = &stmt.parameter_markers[0];
        assert_eq!(&sql[marker.start..marker.stop], "?");
    }

    #[test]
    fn test_where_predicate_with_parameters() {
        let stmt = bind("SELECT * FROM orders WHERE user_id = ? AND status = 'paid' AND order_id IN (?, 5)");
        let Some(Predicate::And(parts)) = &stmt.root().predicate else {
            panic!("expected AND predicate");
        };
        assert_eq!(
            parts[0],
            Predicate::Compare {
                column: ColumnRef::new(None, "user_id"),
                op: CompareOp::Eq,
                value: Operand::Parameter(0),
            }
        );
        assert_eq!(
            parts[2],
            Predicate::In {
                column: ColumnRef::new(None, "order_id"),
                values: vec![Operand::Parameter(1), Operand::Literal(Value::Int(5))],
            }
        );
        assert_eq!(stmt.parameter_count, 2);
    }

    #[test]
    fn test_reversed_comparison_and_between() {
        let stmt = bind("SELECT * FROM orders WHERE 10 < order_id OR order_id BETWEEN 1 AND 3");
        let Some(Predicate::Or(parts)) = &stmt.root().predicate else {
            panic!("expected OR predicate");
        };
        assert!(matches!(&parts[0], Predicate::Compare { op: CompareOp::Gt, .. }));
        assert!(matches!(&parts[1], Predicate::Between { .. }));
    }

    #[test]
    fn test_projections_and_aggregates() {
        let sql = "SELECT user_id, COUNT(*) AS cnt, AVG(DISTINCT amount) avg_amount, o.status FROM orders o GROUP BY user_id";
        let stmt = bind(sql);
        let projections = &stmt.root().projections;
        assert_eq!(projections.len(), 4);
        assert_eq!(projections[1].alias.as_deref(), Some("cnt"));
        match &projections[2].kind {
            ProjectionKind::Aggregation { function, distinct, argument } => {
                assert_eq!(*function, AggregationType::Avg);
                assert!(*distinct);
                assert_eq!(&sql[argument.0..argument.1], "amount");
            }
            other => panic!("unexpected projection {:?}", other),
        }
        assert_eq!(projections[2].alias.as_deref(), Some("avg_amount"));
        assert_eq!(projections[3].kind, ProjectionKind::Column(ColumnRef::new(Some("o"), "status")));
        assert_eq!(&sql[stmt.root().projections_stop - 8..stmt.root().projections_stop], "o.status");
        assert_eq!(stmt.root().group_by.len(), 1);
    }

    #[test]
    fn test_order_by_and_pagination() {
        let sql = "SELECT * FROM orders ORDER BY order_id DESC, 2 LIMIT 5 OFFSET ?";
        let stmt = bind(sql);
        let root = stmt.root();
        assert_eq!(root.order_by.len(), 2);
        assert!(root.order_by[0].descending);
        assert_eq!(root.order_by[1].expr, OrderByExpr::Position(2));
        let pagination = root.pagination.as_ref().unwrap();
        assert_eq!(pagination.limit.as_ref().unwrap().value, PaginationValue::Literal(5));
        assert_eq!(pagination.offset.as_ref().unwrap().value, PaginationValue::Parameter(0));
        assert_eq!(&sql[pagination.start..pagination.stop], "LIMIT 5 OFFSET ?");
    }

    #[test]
    fn test_mysql_limit_form() {
        let stmt = bind("SELECT * FROM orders LIMIT 10, 20");
        let pagination = stmt.root().pagination.clone().unwrap();
        assert_eq!(pagination.offset.unwrap().value, PaginationValue::Literal(10));
        assert_eq!(pagination.limit.unwrap().value, PaginationValue::Literal(20));
    }

    #[test]
    fn test_join_and_on_predicates() {
        let stmt = bind(
            "SELECT * FROM orders o JOIN order_items i ON o.order_id = i.order_id WHERE o.user_id = 1",
        );
        let root = stmt.root();
        assert!(root.has_join);
        assert_eq!(root.tables.len(), 2);
        let Some(Predicate::And(parts)) = &root.predicate else {
            panic!("expected combined predicate");
        };
        assert!(parts.iter().any(|p| matches!(p, Predicate::ColumnEquals { .. })));
    }

    #[test]
    fn test_correlated_subquery_detection() {
        let stmt = bind(
            "SELECT * FROM orders o WHERE EXISTS (SELECT 1 FROM order_items i WHERE i.order_id = o.order_id)",
        );
        assert_eq!(stmt.scopes.len(), 2);
        assert_eq!(stmt.scopes[1].parent, Some(0));
        assert!(stmt.scopes[1].correlated);

        let stmt = bind("SELECT * FROM orders WHERE user_id IN (SELECT user_id FROM users WHERE vip = 1)");
        assert!(stmt.contains_subquery());
        assert!(!stmt.contains_correlated_subquery());
    }

    #[test]
    fn test_derived_table_scope() {
        let stmt = bind("SELECT t.user_id FROM (SELECT user_id FROM orders) t");
        assert_eq!(stmt.scopes.len(), 2);
        assert!(stmt.scopes[1].derived);
        assert_eq!(stmt.table_names(), vec!["orders"]);
    }

    #[test]
    fn test_set_operation() {
        let stmt = bind("SELECT user_id FROM orders UNION ALL SELECT user_id FROM order_items");
        assert!(stmt.set_operation);
        assert_eq!(stmt.table_names(), vec!["orders", "order_items"]);
    }

    #[test]
    fn test_insert_rows() {
        let sql = "INSERT INTO orders (user_id, status) VALUES (?, 'new'), (7, ?)";
        let stmt = bind(sql);
        assert_eq!(stmt.kind, StatementKind::Insert);
        let insert = stmt.insert.unwrap();
        assert_eq!(insert.columns, vec!["user_id", "status"]);
        assert_eq!(insert.rows.len(), 2);
        assert_eq!(insert.rows[0].values[0], Some(Operand::Parameter(0)));
        assert_eq!(insert.rows[1].values[0], Some(Operand::Literal(Value::Int(7))));
        assert_eq!(insert.rows[1].parameters, vec![1]);
        assert_eq!(&sql[insert.rows[1].start..insert.rows[1].stop], "(7, ?)");
        assert_eq!(&sql[insert.columns_end.unwrap()..insert.columns_end.unwrap() + 1], ")");
    }

    #[test]
    fn test_update_delete_and_ddl() {
        let stmt = bind("UPDATE orders SET status = 'x' WHERE user_id = 3");
        assert_eq!(stmt.kind, StatementKind::Update);
        assert!(stmt.root().predicate.is_some());

        let stmt = bind("DELETE FROM orders WHERE user_id = 999");
        assert_eq!(stmt.kind, StatementKind::Delete);
        assert_eq!(stmt.table_names(), vec!["orders"]);

        let stmt = bind("CREATE TABLE IF NOT EXISTS orders (order_id INT, user_id INT)");
        assert_eq!(stmt.kind, StatementKind::Ddl);
        assert_eq!(stmt.table_names(), vec!["orders"]);

        let stmt = bind("DROP TABLE orders, order_items");
        assert_eq!(stmt.table_names(), vec!["orders", "order_items"]);

        let stmt = bind("CREATE INDEX idx_user ON orders (user_id)");
        assert_eq!(stmt.table_names(), vec!["orders"]);
    }

    #[test]
    fn test_schema_qualified_table() {
        let sql = "SELECT * FROM logic_db.orders WHERE user_id = 1";
        let stmt = bind(sql);
        let table = &stmt.root().tables[0];
        let (s, e) = table.schema.unwrap();
        assert_eq!(&sql[s..e], "logic_db.");
        assert!(stmt.root().owners.is_empty());
    }

    #[test]
    fn test_rejects_bad_input() {
        let binder = SqlBinder::new();
        assert!(matches!(binder.bind("   "), Err(AppError::InvalidSql(_))));
        assert!(matches!(binder.bind("SELECT 1; SELECT 2"), Err(AppError::InvalidSql(_))));
        assert!(matches!(binder.bind("SELECT (1"), Err(AppError::InvalidSql(_))));
        assert!(matches!(
            binder.bind("INSERT INTO orders SELECT * FROM archive"),
            Err(AppError::Unsupported(_))
        ));
    }

    #[test]
    fn test_other_statements() {
        let stmt = bind("SET autocommit = 1;");
        assert_eq!(stmt.kind, StatementKind::Other);
        assert!(stmt.table_names().is_empty());
    }
}
