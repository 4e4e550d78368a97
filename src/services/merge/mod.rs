// Result merger
//
// Combines per-unit results into one logical cursor. The strategy is picked
// from the statement shape: plain concatenation, ordered k-way merge, or an
// in-memory group merge, optionally wrapped by the pagination decorator.

pub mod context;
pub mod cursor;
pub mod grouped;
pub mod stream;

pub use context::{compare_rows, AggregationSpec, MergeContext, ResolvedSortKey, SortKey};
pub use cursor::{CursorState, MergeStrategy, MergedCursor};

use crate::api::middleware::AppError;
use crate::models::{QueryResult, RowStream, SelectScope};
use crate::services::execution::CancellationToken;
use grouped::GroupedMerge;
use stream::{IteratorMerge, OrderedMerge};
use tracing::debug;

/// Whether rows are only final after every shard has been drained
pub fn requires_memory_merge(scope: &SelectScope) -> bool {
    !scope.group_by.is_empty() || scope.distinct || scope.has_aggregation()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeEngine;

impl MergeEngine {
    pub fn new() -> Self {
        Self
    }

    /// Merge per-unit results, given in route-unit order
    ///
    /// # Arguments
    /// * `results` - One result per route unit
    /// * `context` - Merge shape derived from the bound statement
    /// * `cancel` - Token checked on every cursor advance
    ///
    /// # Returns
    /// * `Result<MergedCursor, AppError>` - Cursor over the merged rows
    pub fn merge(
        &self,
        results: Vec<QueryResult>,
        context: &MergeContext,
        cancel: Option<CancellationToken>,
    ) -> Result<MergedCursor, AppError> {
        let columns = results.first().map(|r| r.columns.clone()).unwrap_or_default();
        if let Some(other) = results.iter().find(|r| r.columns.len() != columns.len()) {
            return Err(AppError::MergeInvariant(format!(
                "Shard results disagree on width: {} vs {}",
                columns.len(),
                other.columns.len()
            )));
        }
        let result_count = results.len();
        let streams: Vec<RowStream> = results.into_iter().map(|r| r.rows).collect();

        let strategy = if context.is_pass_through(result_count) {
            MergeStrategy::Iterator(IteratorMerge::new(streams))
        } else {
            let strategy = if context.memory_merge {
                MergeStrategy::Grouped(GroupedMerge::new(streams, columns.clone(), context))
            } else if !context.sort_keys.is_empty() {
                let locators: Vec<_> = context.sort_keys.iter().map(|k| k.locator.clone()).collect();
                let indexes = context::resolve_locators(&locators, &columns)?;
                let keys = context
                    .sort_keys
                    .iter()
                    .zip(indexes)
                    .map(|(k, index)| ResolvedSortKey {
                        index,
                        descending: k.descending,
                        nulls_first: k.nulls_first,
                    })
                    .collect();
                MergeStrategy::Ordered(OrderedMerge::new(streams, keys))
            } else {
                MergeStrategy::Iterator(IteratorMerge::new(streams))
            };
            if context.paginated {
                strategy.paginate(context.offset, context.limit)
            } else {
                strategy
            }
        };
        debug!(
            "Merging {} results with {} strategy, {} derived columns",
            result_count,
            strategy.name(),
            context.derived_count
        );

        let cursor = MergedCursor::new(columns, context.derived_count, strategy);
        Ok(match cancel {
            Some(token) => cursor.with_cancellation(token),
            None => cursor,
        })
    }

    /// Cursor for a query that reached no unit
    ///
    /// Bare aggregates still answer their single row (COUNT 0, others NULL);
    /// everything else is empty.
    pub fn merge_empty(
        &self,
        columns: Vec<String>,
        context: &MergeContext,
        cancel: Option<CancellationToken>,
    ) -> Result<MergedCursor, AppError> {
        let implicit_group =
            context.memory_merge && context.group_keys.is_empty() && !context.aggregations.is_empty();
        let strategy = if implicit_group {
            MergeStrategy::Grouped(GroupedMerge::new(Vec::new(), columns.clone(), context))
        } else {
            MergeStrategy::Iterator(IteratorMerge::new(Vec::new()))
        };
        let strategy = if context.paginated {
            strategy.paginate(context.offset, context.limit)
        } else {
            strategy
        };
        debug!("Empty route answered with {} strategy", strategy.name());

        let cursor = MergedCursor::new(columns, 0, strategy);
        Ok(match cancel {
            Some(token) => cursor.with_cancellation(token),
            None => cursor,
        })
    }

    /// Combine per-unit affected-row counts
    pub fn merge_updates(&self, counts: &[u64], context: &MergeContext) -> u64 {
        if context.sum_update_counts {
            counts.iter().sum()
        } else {
            counts.first().copied().unwrap_or(0)
        }
    }
}
