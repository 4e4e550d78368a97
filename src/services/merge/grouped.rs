// Grouped / aggregation merge
//
// Drains every shard, folding pre-aggregated partial rows into one accumulator
// per group key. Memory is bounded by the number of distinct groups.

use std::collections::{BTreeMap, BTreeSet};

use super::context::{compare_rows, resolve_locators, MergeContext, ResolvedSortKey};
use super::stream::IteratorMerge;
use crate::api::middleware::AppError;
use crate::models::{AggregationType, RowStream, Value};

#[derive(Debug, Clone)]
enum Accumulator {
    Count(i64),
    Sum(Option<Value>),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { count: i64, sum: Option<Value> },
}

fn add_values(a: Value, b: &Value) -> Result<Value, AppError> {
    match (&a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x
            .checked_add(*y)
            .map(Value::Int)
            .unwrap_or_else(|| Value::Float(*x as f64 + *y as f64))),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) if !matches!(b, Value::Text(_)) && !matches!(a, Value::Text(_)) => Ok(Value::Float(x + y)),
            _ => Err(AppError::MergeInvariant(format!("Cannot add partial aggregates {} and {}", a, b))),
        },
    }
}

fn count_of(value: &Value) -> Result<i64, AppError> {
    match value {
        Value::Null => Ok(0),
        Value::Int(v) => Ok(*v),
        Value::Float(v) if v.fract() == 0.0 => Ok(*v as i64),
        other => Err(AppError::MergeInvariant(format!("Partial count {} is not an integer", other))),
    }
}

impl Accumulator {
    fn new(function: AggregationType) -> Self {
        match function {
            AggregationType::Count => Accumulator::Count(0),
            AggregationType::Sum => Accumulator::Sum(None),
            AggregationType::Min => Accumulator::Min(None),
            AggregationType::Max => Accumulator::Max(None),
            AggregationType::Avg => Accumulator::Avg { count: 0, sum: None },
        }
    }

    fn fold_optional(current: &mut Option<Value>, value: &Value, pick: impl Fn(&Value, &Value) -> bool) {
        if value.is_null() {
            return;
        }
        match current {
            Some(existing) if !pick(value, existing) => {}
            _ => *current = Some(value.clone()),
        }
    }

    /// Fold one partial row; `avg` carries the derived (count, sum) values
    fn fold(&mut self, value: &Value, avg: Option<(&Value, &Value)>) -> Result<(), AppError> {
        match self {
            Accumulator::Count(total) => *total += count_of(value)?,
            Accumulator::Sum(total) => {
                if !value.is_null() {
                    *total = Some(match total.take() {
                        Some(existing) => add_values(existing, value)?,
                        None => value.clone(),
                    });
                }
            }
            Accumulator::Min(current) => Self::fold_optional(current, value, |v, e| v < e),
            Accumulator::Max(current) => Self::fold_optional(current, value, |v, e| v > e),
            Accumulator::Avg { count, sum } => {
                let (partial_count, partial_sum) = avg.ok_or_else(|| {
                    AppError::MergeInvariant("AVG merged without its derived SUM and COUNT".to_string())
                })?;
                *count += count_of(partial_count)?;
                if !partial_sum.is_null() {
                    *sum = Some(match sum.take() {
                        Some(existing) => add_values(existing, partial_sum)?,
                        None => partial_sum.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        match self {
            Accumulator::Count(total) => Value::Int(*total),
            Accumulator::Sum(total) | Accumulator::Min(total) | Accumulator::Max(total) => {
                total.clone().unwrap_or(Value::Null)
            }
            Accumulator::Avg { count, sum } => match (count, sum.as_ref().and_then(|s| s.as_f64())) {
                (0, _) | (_, None) => Value::Null,
                (n, Some(s)) => Value::Float(s / *n as f64),
            },
        }
    }
}

struct ResolvedAggregation {
    index: usize,
    avg_parts: Option<(usize, usize)>,
    function: AggregationType,
}

struct Group {
    row: Vec<Value>,
    accumulators: Vec<Accumulator>,
}

/// Lazily drains its inputs on the first pull, then yields merged groups
pub struct GroupedMerge {
    input: Option<IteratorMerge>,
    output: std::vec::IntoIter<Vec<Value>>,
    columns: Vec<String>,
    context: MergeContext,
}

impl GroupedMerge {
    pub fn new(streams: Vec<RowStream>, columns: Vec<String>, context: &MergeContext) -> Self {
        Self {
            input: Some(IteratorMerge::new(streams)),
            output: Vec::new().into_iter(),
            columns,
            context: context.clone(),
        }
    }

    fn build(&self, mut input: IteratorMerge) -> Result<Vec<Vec<Value>>, AppError> {
        let context = &self.context;
        let visible = self.columns.len().saturating_sub(context.derived_count);
        let group_indexes: Vec<usize> = if context.group_keys.is_empty() && context.aggregations.is_empty() {
            // plain DISTINCT: every visible column is part of the key
            (0..visible).collect()
        } else {
            resolve_locators(&context.group_keys, &self.columns)?
        };
        let mut aggregations = Vec::with_capacity(context.aggregations.len());
        for spec in &context.aggregations {
            let index = resolve_locators(std::slice::from_ref(&spec.locator), &self.columns)?[0];
            let avg_parts = match &spec.avg_parts {
                Some((count, sum)) => {
                    let found = resolve_locators(&[count.clone(), sum.clone()], &self.columns)?;
                    Some((found[0], found[1]))
                }
                None => None,
            };
            aggregations.push(ResolvedAggregation {
                index,
                avg_parts,
                function: spec.function,
            });
        }

        let mut groups: BTreeMap<Vec<Value>, Group> = BTreeMap::new();
        while let Some(row) = input.next_row()? {
            if row.len() != self.columns.len() {
                return Err(AppError::MergeInvariant(format!(
                    "Shard row has {} columns, expected {}",
                    row.len(),
                    self.columns.len()
                )));
            }
            let key: Vec<Value> = group_indexes.iter().map(|i| row[*i].clone()).collect();
            let group = groups.entry(key).or_insert_with(|| Group {
                row: row.clone(),
                accumulators: aggregations.iter().map(|a| Accumulator::new(a.function)).collect(),
            });
            for (aggregation, accumulator) in aggregations.iter().zip(group.accumulators.iter_mut()) {
                let avg = aggregation.avg_parts.map(|(c, s)| (&row[c], &row[s]));
                accumulator.fold(&row[aggregation.index], avg)?;
            }
        }

        if groups.is_empty() && context.group_keys.is_empty() && !aggregations.is_empty() {
            // bare aggregates over no rows still answer one row
            let mut row = vec![Value::Null; self.columns.len()];
            for aggregation in &aggregations {
                row[aggregation.index] = Accumulator::new(aggregation.function).finish();
            }
            return Ok(vec![row]);
        }

        let mut rows: Vec<Vec<Value>> = groups
            .into_values()
            .map(|mut group| {
                for (aggregation, accumulator) in aggregations.iter().zip(&group.accumulators) {
                    group.row[aggregation.index] = accumulator.finish();
                }
                group.row
            })
            .collect();

        if context.distinct && !group_indexes.iter().copied().eq(0..visible) {
            let mut seen = BTreeSet::new();
            rows.retain(|row| seen.insert(row[..visible].to_vec()));
        }

        let sort_locators: Vec<_> = context.group_sort_keys.iter().map(|k| k.locator.clone()).collect();
        let sort_indexes = resolve_locators(&sort_locators, &self.columns)?;
        let keys: Vec<ResolvedSortKey> = context
            .group_sort_keys
            .iter()
            .zip(sort_indexes)
            .map(|(k, index)| ResolvedSortKey {
                index,
                descending: k.descending,
                nulls_first: k.nulls_first,
            })
            .collect();
        if !keys.is_empty() {
            rows.sort_by(|a, b| compare_rows(a, b, &keys));
        }
        Ok(rows)
    }

    pub fn next_row(&mut self) -> Result<Option<Vec<Value>>, AppError> {
        if let Some(input) = self.input.take() {
            self.output = self.build(input)?.into_iter();
        }
        Ok(self.output.next())
    }
}
