//! Local event store contract
//!
//! The store is an ordered, append-only table service: every inserted row
//! receives a monotonically increasing offset and reads come back in offset
//! order. The crate never issues free-form queries; the handful of reads and
//! aggregates it needs are spelled out as [`ReadQuery`] and [`AggregateQuery`]
//! so any engine can back them.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

pub use memory::MemoryTableService;

/// One row, column name to value
pub type Row = serde_json::Map<String, Value>;

/// A row together with its store-assigned offset
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub offset: i64,
    pub row: Row,
}

/// Append a row to a table
#[derive(Debug, Clone)]
pub struct InsertQuery {
    pub table: String,
    pub row: Row,
    /// Offset to keep if it is still free; otherwise the next one is assigned
    pub offset: Option<i64>,
}

impl InsertQuery {
    pub fn new(table: impl Into<String>, row: Row) -> Self {
        Self {
            table: table.into(),
            row,
            offset: None,
        }
    }

    pub fn at_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Ordered selection from one table
#[derive(Debug, Clone, Default)]
pub struct ReadQuery {
    pub table: String,
    /// Only rows at or above this offset
    pub min_offset: Option<i64>,
    /// Column equality filters, all must match
    pub equals: Vec<(String, Value)>,
    pub limit: Option<usize>,
}

impl ReadQuery {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn from_offset(mut self, offset: i64) -> Self {
        self.min_offset = Some(offset);
        self
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((column.into(), value.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a row satisfies the offset bound and every equality filter
    pub fn matches(&self, stored: &StoredRow) -> bool {
        if self.min_offset.is_some_and(|min| stored.offset < min) {
            return false;
        }
        self.equals
            .iter()
            .all(|(column, value)| stored.row.get(column) == Some(value))
    }
}

/// Aggregate over one table
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateQuery {
    /// Number of rows
    Count { table: String },
    /// Sum of an integer column; 0 for an empty or missing table
    Sum { table: String, column: String },
}

impl AggregateQuery {
    pub fn count(table: impl Into<String>) -> Self {
        AggregateQuery::Count {
            table: table.into(),
        }
    }

    pub fn sum(table: impl Into<String>, column: impl Into<String>) -> Self {
        AggregateQuery::Sum {
            table: table.into(),
            column: column.into(),
        }
    }
}

/// Table service backing the local event store
#[async_trait]
pub trait TableService: Send + Sync {
    /// Append a row; returns the number of rows affected
    async fn insert(&self, query: InsertQuery) -> anyhow::Result<u64>;

    /// Rows matching the query, in offset order
    async fn read(&self, query: &ReadQuery) -> anyhow::Result<Vec<StoredRow>>;

    /// Delete rows by offset; returns the number of rows removed
    async fn delete(&self, table: &str, offsets: &[i64]) -> anyhow::Result<u64>;

    async fn execute(&self, query: &AggregateQuery) -> anyhow::Result<i64>;

    /// Atomically snapshot the whole database to `destination`
    async fn copy_database(&self, destination: &Path) -> anyhow::Result<bool>;

    /// Open another database file with the same engine
    async fn open(&self, path: &Path) -> anyhow::Result<Arc<dyn TableService>>;

    async fn tables(&self) -> anyhow::Result<Vec<String>>;

    async fn drop_table(&self, table: &str) -> anyhow::Result<()>;
}
