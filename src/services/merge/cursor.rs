use serde::Serialize;

use super::grouped::GroupedMerge;
use super::stream::{IteratorMerge, OrderedMerge};
use crate::api::middleware::AppError;
use crate::models::{QueryResult, Value};
use crate::services::execution::CancellationToken;

/// Merge strategy selected once per statement shape
pub enum MergeStrategy {
    Iterator(IteratorMerge),
    Ordered(OrderedMerge),
    Grouped(GroupedMerge),
    /// Skips `offset` merged rows, then yields at most `limit`
    Paginated {
        inner: Box<MergeStrategy>,
        offset: u64,
        remaining: Option<u64>,
    },
}

impl MergeStrategy {
    pub fn paginate(self, offset: u64, limit: Option<u64>) -> Self {
        MergeStrategy::Paginated {
            inner: Box::new(self),
            offset,
            remaining: limit,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MergeStrategy::Iterator(_) => "iterator",
            MergeStrategy::Ordered(_) => "ordered",
            MergeStrategy::Grouped(_) => "grouped",
            MergeStrategy::Paginated { inner, .. } => inner.name(),
        }
    }

    fn next_row(&mut self) -> Result<Option<Vec<Value>>, AppError> {
        match self {
            MergeStrategy::Iterator(merge) => merge.next_row(),
            MergeStrategy::Ordered(merge) => merge.next_row(),
            MergeStrategy::Grouped(merge) => merge.next_row(),
            MergeStrategy::Paginated {
                inner,
                offset,
                remaining,
            } => {
                while *offset > 0 {
                    if inner.next_row()?.is_none() {
                        return Ok(None);
                    }
                    *offset -= 1;
                }
                match remaining {
                    Some(0) => Ok(None),
                    Some(left) => {
                        let row = inner.next_row()?;
                        if row.is_some() {
                            *left -= 1;
                        }
                        Ok(row)
                    }
                    None => inner.next_row(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CursorState {
    BeforeFirst,
    Active,
    Exhausted,
    Cancelled,
    Failed,
}

/// Pull-based logical cursor over merged shard results
///
/// Terminal states are sticky: once cancelled every call fails with
/// `Cancelled`, once failed every call repeats the failure.
pub struct MergedCursor {
    columns: Vec<String>,
    visible: usize,
    strategy: MergeStrategy,
    current: Option<Vec<Value>>,
    state: CursorState,
    failure: Option<AppError>,
    cancel: Option<CancellationToken>,
}

impl MergedCursor {
    pub fn new(columns: Vec<String>, derived_count: usize, strategy: MergeStrategy) -> Self {
        let visible = columns.len().saturating_sub(derived_count);
        let mut columns = columns;
        columns.truncate(visible);
        Self {
            columns,
            visible,
            strategy,
            current: None,
            state: CursorState::BeforeFirst,
            failure: None,
            cancel: None,
        }
    }

    /// Cursor over a single, already final result
    pub fn from_result(result: QueryResult) -> Self {
        Self::new(
            result.columns,
            0,
            MergeStrategy::Iterator(IteratorMerge::new(vec![result.rows])),
        )
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    fn terminal_error(&self) -> Option<AppError> {
        match self.state {
            CursorState::Cancelled => Some(AppError::Cancelled),
            CursorState::Failed => Some(self.failure.clone().unwrap_or_else(|| {
                AppError::Internal("Cursor failed".to_string())
            })),
            _ => None,
        }
    }

    /// Advance to the next row; `false` once exhausted
    pub fn next(&mut self) -> Result<bool, AppError> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            self.state = CursorState::Cancelled;
            self.current = None;
            return Err(AppError::Cancelled);
        }
        if self.state == CursorState::Exhausted {
            return Ok(false);
        }
        match self.strategy.next_row() {
            Ok(Some(mut row)) => {
                row.truncate(self.visible);
                self.current = Some(row);
                self.state = CursorState::Active;
                Ok(true)
            }
            Ok(None) => {
                self.current = None;
                self.state = CursorState::Exhausted;
                Ok(false)
            }
            Err(err) => {
                tracing::error!("Merge aborted: {}", err);
                self.current = None;
                self.state = if matches!(err, AppError::Cancelled) {
                    CursorState::Cancelled
                } else {
                    CursorState::Failed
                };
                self.failure = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Value at `index` of the current row
    pub fn value(&self, index: usize) -> Result<&Value, AppError> {
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }
        let row = self
            .current
            .as_ref()
            .ok_or_else(|| AppError::Validation("Cursor is not positioned on a row".to_string()))?;
        row.get(index).ok_or_else(|| {
            AppError::Validation(format!("Column index {} out of range (0..{})", index, row.len()))
        })
    }

    pub fn current_row(&self) -> Option<&[Value]> {
        self.current.as_deref()
    }

    /// Drain the remaining rows
    pub fn collect_rows(mut self) -> Result<Vec<Vec<Value>>, AppError> {
        let mut rows = Vec::new();
        while self.next()? {
            if let Some(row) = self.current.take() {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

impl std::fmt::Debug for MergedCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergedCursor")
            .field("columns", &self.columns)
            .field("strategy", &self.strategy_name())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RowStream;

    fn ints(values: Vec<i64>) -> RowStream {
        Box::new(
            values
                .into_iter()
                .map(|v| Ok(vec![Value::Int(v), Value::Int(v * 10)]))
                .collect::<Vec<_>>()
                .into_iter(),
        )
    }

    fn cursor(strategy: MergeStrategy) -> MergedCursor {
        MergedCursor::new(vec!["a".to_string(), "DERIVED".to_string()], 1, strategy)
    }

    #[test]
    fn test_pagination_skips_then_caps() {
        let strategy = MergeStrategy::Iterator(IteratorMerge::new(vec![ints(vec![1, 2, 3]), ints(vec![4, 5])]))
            .paginate(2, Some(2));
        let rows = cursor(strategy).collect_rows().unwrap();
        assert_eq!(rows, vec![vec![Value::Int(3)], vec![Value::Int(4)]]);
    }

    #[test]
    fn test_derived_columns_hidden() {
        let mut c = cursor(MergeStrategy::Iterator(IteratorMerge::new(vec![ints(vec![7])])));
        assert_eq!(c.columns(), &["a".to_string()]);
        assert!(c.next().unwrap());
        assert_eq!(c.value(0).unwrap(), &Value::Int(7));
        assert!(c.value(1).is_err());
        assert!(!c.next().unwrap());
        assert_eq!(c.state(), CursorState::Exhausted);
    }

    #[test]
    fn test_cancelled_cursor_fails_fast() {
        let token = CancellationToken::new();
        let mut c = cursor(MergeStrategy::Iterator(IteratorMerge::new(vec![ints(vec![1, 2])])))
            .with_cancellation(token.clone());
        assert!(c.next().unwrap());
        token.cancel();
        assert!(matches!(c.next(), Err(AppError::Cancelled)));
        assert!(matches!(c.next(), Err(AppError::Cancelled)));
        assert!(matches!(c.value(0), Err(AppError::Cancelled)));
        assert_eq!(c.state(), CursorState::Cancelled);
    }

    #[test]
    fn test_failure_is_sticky() {
        let failing: RowStream = Box::new(
            vec![
                Ok(vec![Value::Int(1), Value::Int(1)]),
                Err(AppError::Database("lost connection".into())),
                Ok(vec![Value::Int(2), Value::Int(2)]),
            ]
            .into_iter(),
        );
        let mut c = cursor(MergeStrategy::Iterator(IteratorMerge::new(vec![failing])));
        assert!(c.next().unwrap());
        assert!(matches!(c.next(), Err(AppError::Database(_))));
        assert!(matches!(c.next(), Err(AppError::Database(_))));
        assert_eq!(c.state(), CursorState::Failed);
    }
}
