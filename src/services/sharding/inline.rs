// Inline expressions
//
// Two small languages share the `${...}` placeholder syntax (`$->{...}` is accepted too):
// data node lists such as `ds_${0..3}.orders_${[0, 2]}`, expanded by Cartesian product,
// and sharding expressions such as `orders_${user_id % 4}`, evaluated for one column value.

use crate::api::middleware::AppError;
use crate::models::Value;

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Placeholder(String),
}

/// Split an expression into literal text and placeholder bodies
fn parse_parts(expression: &str) -> Result<Vec<Part>, AppError> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let chars: Vec<char> = expression.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let open_len = if chars[i] == '$' && chars.get(i + 1) == Some(&'{') {
            2
        } else if chars[i] == '$' && chars.get(i + 1) == Some(&'-') && chars.get(i + 2) == Some(&'>') && chars.get(i + 3) == Some(&'{') {
            4
        } else {
            0
        };

        if open_len == 0 {
            literal.push(chars[i]);
            i += 1;
            continue;
        }

        let body_start = i + open_len;
        let mut depth = 1;
        let mut j = body_start;
        while j < chars.len() {
            match chars[j] {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            j += 1;
        }
        if depth != 0 {
            return Err(AppError::Configuration(format!(
                "Unterminated placeholder in inline expression '{}'",
                expression
            )));
        }

        if !literal.is_empty() {
            parts.push(Part::Literal(std::mem::take(&mut literal)));
        }
        parts.push(Part::Placeholder(chars[body_start..j].iter().collect::<String>().trim().to_string()));
        i = j + 1;
    }

    if !literal.is_empty() {
        parts.push(Part::Literal(literal));
    }
    Ok(parts)
}

/// Split on commas that sit outside any placeholder
fn split_alternatives(expression: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for ch in expression.chars() {
        match ch {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                segments.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    if !current.trim().is_empty() {
        segments.push(current.trim().to_string());
    }
    segments
}

/// Enumerate the values a data-node placeholder stands for
fn placeholder_values(body: &str) -> Result<Vec<String>, AppError> {
    if let Some((low, high)) = body.split_once("..") {
        let low: i64 = low.trim().parse().map_err(|_| {
            AppError::Configuration(format!("Invalid range start in '${{{}}}'", body))
        })?;
        let high: i64 = high.trim().parse().map_err(|_| {
            AppError::Configuration(format!("Invalid range end in '${{{}}}'", body))
        })?;
        if high < low {
            return Err(AppError::Configuration(format!("Empty range '${{{}}}'", body)));
        }
        return Ok((low..=high).map(|v| v.to_string()).collect());
    }

    if let Some(list) = body.strip_prefix('[').and_then(|b| b.strip_suffix(']')) {
        return Ok(list
            .split(',')
            .map(|item| item.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
            .filter(|item| !item.is_empty())
            .collect());
    }

    Ok(vec![body.trim_matches(|c| c == '\'' || c == '"').to_string()])
}

/// Expand a data-node style inline expression into every concrete name, in declaration order
///
/// # Arguments
/// * `expression` - e.g. `ds_${0..1}.orders_${0..1}`
///
/// # Returns
/// `["ds_0.orders_0", "ds_0.orders_1", "ds_1.orders_0", "ds_1.orders_1"]`
pub fn expand(expression: &str) -> Result<Vec<String>, AppError> {
    let mut result = Vec::new();
    for segment in split_alternatives(expression) {
        let mut combos = vec![String::new()];
        for part in parse_parts(&segment)? {
            match part {
                Part::Literal(text) => combos.iter_mut().for_each(|c| c.push_str(&text)),
                Part::Placeholder(body) => {
                    let values = placeholder_values(&body)?;
                    combos = combos
                        .iter()
                        .flat_map(|prefix| values.iter().map(move |v| format!("{}{}", prefix, v)))
                        .collect();
                }
            }
        }
        result.extend(combos);
    }
    Ok(result)
}

/// Evaluate a sharding expression for one column value
///
/// `orders_${user_id % 4}` with `user_id = 7` yields `orders_3`.
pub fn evaluate(expression: &str, column: &str, value: &Value) -> Result<String, AppError> {
    let mut out = String::new();
    for part in parse_parts(expression)? {
        match part {
            Part::Literal(text) => out.push_str(&text),
            Part::Placeholder(body) => {
                if body.eq_ignore_ascii_case(column) {
                    out.push_str(&value.to_string());
                    continue;
                }
                let tokens = lex_arithmetic(&body)?;
                let mut parser = Arithmetic { tokens, pos: 0, column, value };
                let result = parser.expr()?;
                if parser.pos != parser.tokens.len() {
                    return Err(AppError::Configuration(format!(
                        "Trailing input in sharding expression '{}'",
                        body
                    )));
                }
                out.push_str(&result.to_string());
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
enum ArithToken {
    Number(i64),
    Ident(String),
    Op(char),
    Open,
    Close,
}

fn lex_arithmetic(body: &str) -> Result<Vec<ArithToken>, AppError> {
    let chars: Vec<char> = body.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let number = text.parse().map_err(|_| {
                AppError::Configuration(format!("Number out of range in '{}'", body))
            })?;
            tokens.push(ArithToken::Number(number));
        } else if c.is_alphanumeric() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(ArithToken::Ident(chars[start..i].iter().collect()));
        } else if "+-*/%".contains(c) {
            tokens.push(ArithToken::Op(c));
            i += 1;
        } else if c == '(' {
            tokens.push(ArithToken::Open);
            i += 1;
        } else if c == ')' {
            tokens.push(ArithToken::Close);
            i += 1;
        } else {
            return Err(AppError::Configuration(format!(
                "Unsupported character '{}' in sharding expression '{}'",
                c, body
            )));
        }
    }
    Ok(tokens)
}

struct Arithmetic<'a> {
    tokens: Vec<ArithToken>,
    pos: usize,
    column: &'a str,
    value: &'a Value,
}

impl Arithmetic<'_> {
    fn expr(&mut self) -> Result<i64, AppError> {
        let mut acc = self.term()?;
        while let Some(ArithToken::Op(op @ ('+' | '-'))) = self.tokens.get(self.pos).cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            acc = if op == '+' { acc.wrapping_add(rhs) } else { acc.wrapping_sub(rhs) };
        }
        Ok(acc)
    }

    fn term(&mut self) -> Result<i64, AppError> {
        let mut acc = self.factor()?;
        while let Some(ArithToken::Op(op @ ('*' | '/' | '%'))) = self.tokens.get(self.pos).cloned() {
            self.pos += 1;
            let rhs = self.factor()?;
            acc = match op {
                '*' => acc.wrapping_mul(rhs),
                _ if rhs == 0 => {
                    return Err(AppError::Configuration("Division by zero in sharding expression".to_string()))
                }
                '/' => acc.div_euclid(rhs),
                _ => acc.rem_euclid(rhs),
            };
        }
        Ok(acc)
    }

    fn factor(&mut self) -> Result<i64, AppError> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        match token {
            Some(ArithToken::Number(n)) => Ok(n),
            Some(ArithToken::Op('-')) => Ok(-self.factor()?),
            Some(ArithToken::Ident(name)) if name.eq_ignore_ascii_case(self.column) => {
                self.value.as_i64().ok_or_else(|| {
                    AppError::Validation(format!(
                        "Sharding value '{}' for column '{}' is not an integer",
                        self.value, self.column
                    ))
                })
            }
            Some(ArithToken::Ident(name)) => Err(AppError::Configuration(format!(
                "Unknown variable '{}' in sharding expression (expected '{}')",
                name, self.column
            ))),
            Some(ArithToken::Open) => {
                let inner = self.expr()?;
                match self.tokens.get(self.pos) {
                    Some(ArithToken::Close) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(AppError::Configuration("Unbalanced parenthesis in sharding expression".to_string())),
                }
            }
            _ => Err(AppError::Configuration("Malformed sharding expression".to_string())),
        }
    }
}
