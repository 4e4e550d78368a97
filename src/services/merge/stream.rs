// Streaming merges: concatenation and ordered k-way merge

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use super::context::{compare_rows, ResolvedSortKey};
use crate::api::middleware::AppError;
use crate::models::{RowStream, Value};

/// Drains shard streams one after another, in input order
pub struct IteratorMerge {
    streams: Vec<RowStream>,
    current: usize,
}

impl IteratorMerge {
    pub fn new(streams: Vec<RowStream>) -> Self {
        Self { streams, current: 0 }
    }

    pub fn next_row(&mut self) -> Result<Option<Vec<Value>>, AppError> {
        while let Some(stream) = self.streams.get_mut(self.current) {
            match stream.next() {
                Some(row) => return row.map(Some),
                None => self.current += 1,
            }
        }
        Ok(None)
    }
}

/// Head row of one shard stream
struct HeapEntry {
    row: Vec<Value>,
    shard: usize,
    keys: Arc<[ResolvedSortKey]>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap pops the greatest entry, so the natural order is reversed
    fn cmp(&self, other: &Self) -> Ordering {
        compare_rows(&self.row, &other.row, &self.keys)
            .then(self.shard.cmp(&other.shard))
            .reverse()
    }
}

/// k-way merge of individually sorted shard streams
///
/// Holds one row per shard; ties go to the lower shard index.
pub struct OrderedMerge {
    streams: Vec<RowStream>,
    heap: BinaryHeap<HeapEntry>,
    keys: Arc<[ResolvedSortKey]>,
    primed: bool,
}

impl OrderedMerge {
    pub fn new(streams: Vec<RowStream>, keys: Vec<ResolvedSortKey>) -> Self {
        let capacity = streams.len();
        Self {
            streams,
            heap: BinaryHeap::with_capacity(capacity),
            keys: keys.into(),
            primed: false,
        }
    }

    fn pull(&mut self, shard: usize) -> Result<(), AppError> {
        if let Some(row) = self.streams[shard].next() {
            let row = row?;
            if let Some(key) = self.keys.iter().find(|k| k.index >= row.len()) {
                return Err(AppError::MergeInvariant(format!(
                    "Sort column {} missing from a row of width {}",
                    key.index,
                    row.len()
                )));
            }
            self.heap.push(HeapEntry {
                row,
                shard,
                keys: self.keys.clone(),
            });
        }
        Ok(())
    }

    pub fn next_row(&mut self) -> Result<Option<Vec<Value>>, AppError> {
        if !self.primed {
            self.primed = true;
            for shard in 0..self.streams.len() {
                self.pull(shard)?;
            }
        }
        let Some(entry) = self.heap.pop() else {
            return Ok(None);
        };
        self.pull(entry.shard)?;
        Ok(Some(entry.row))
    }
}
