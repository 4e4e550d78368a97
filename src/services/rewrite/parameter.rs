use super::SqlToken;
use crate::api::middleware::AppError;
use crate::models::{ParameterMarker, Value};

/// How surviving placeholders are emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// Positional `?` with the value appended to the unit's parameter list
    Positional,
    /// SQL literal in the text
    Inline,
}

/// Builds the parameter list that matches a rewritten text
///
/// Placeholders left untouched by the generators become tokens of their own, so the
/// final splice visits text, generated tokens and placeholders in one left-to-right
/// pass and every emitted `?` lines up with exactly one value. `$n` placeholders are
/// renumbered into positional ones on the way, which also covers reuse of one `$n`.
#[derive(Debug, Clone, Copy)]
pub struct ParameterRewriter {
    style: PlaceholderStyle,
}

impl ParameterRewriter {
    pub fn new(style: PlaceholderStyle) -> Self {
        Self { style }
    }

    /// Render one placeholder occurrence
    pub fn render(&self, marker: &ParameterMarker, parameters: &[Value]) -> Result<SqlToken, AppError> {
        let value = parameters.get(marker.index).ok_or_else(|| {
            AppError::InvalidSql(format!(
                "Missing value for parameter #{} ({} supplied)",
                marker.index + 1,
                parameters.len()
            ))
        })?;
        Ok(match self.style {
            PlaceholderStyle::Positional => {
                SqlToken::with_parameters(marker.start, marker.stop, "?", vec![value.clone()])
            }
            PlaceholderStyle::Inline => SqlToken::new(marker.start, marker.stop, value.to_sql_literal()),
        })
    }

    /// Tokens for every placeholder not covered by an already generated token
    pub fn rewrite(
        &self,
        markers: &[ParameterMarker],
        parameters: &[Value],
        generated: &[SqlToken],
    ) -> Result<Vec<SqlToken>, AppError> {
        markers
            .iter()
            .filter(|m| !generated.iter().any(|t| t.covers(m.start, m.stop)))
            .map(|m| self.render(m, parameters))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(index: usize, start: usize) -> ParameterMarker {
        ParameterMarker {
            index,
            start,
            stop: start + 1,
        }
    }

    #[test]
    fn test_covered_markers_are_skipped() {
        let markers = vec![marker(0, 5), marker(1, 20)];
        let generated = vec![SqlToken::new(18, 22, "10")];
        let tokens = ParameterRewriter::new(PlaceholderStyle::Positional)
            .rewrite(&markers, &[Value::Int(1), Value::Int(2)], &generated)
            .unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].parameters, vec![Value::Int(1)]);
    }

    #[test]
    fn test_inline_and_missing_values() {
        let rewriter = ParameterRewriter::new(PlaceholderStyle::Inline);
        let token = rewriter.render(&marker(0, 0), &[Value::Text("a'b".into())]).unwrap();
        assert_eq!(token.text, "'a''b'");
        assert!(matches!(rewriter.render(&marker(3, 0), &[]), Err(AppError::InvalidSql(_))));
    }
}
