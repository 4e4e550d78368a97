use serde::Serialize;
use std::fmt;

use super::value::Value;
use crate::api::middleware::AppError;

/// Pull-based row cursor of one shard result
pub type RowStream = Box<dyn Iterator<Item = Result<Vec<Value>, AppError>> + Send>;

/// Column labels plus a row cursor
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: RowStream,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: RowStream) -> Self {
        Self { columns, rows }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows: Box::new(rows.into_iter().map(Ok)),
        }
    }

    pub fn empty(columns: Vec<String>) -> Self {
        Self::from_rows(columns, Vec::new())
    }
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

/// How a data source's units share connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionMode {
    /// One connection per unit, all concurrent
    MemoryStrictly,
    /// Units share a bounded number of connections and run serially on each
    ConnectionStrictly,
}

/// Physical statement for one route unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionUnit {
    pub data_source: String,
    pub sql: String,
    pub parameters: Vec<Value>,
    pub connection_mode: ConnectionMode,
}
