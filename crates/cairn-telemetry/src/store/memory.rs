//! In-memory table service
//!
//! Reference [`TableService`] for tests and embedders without a database.
//! Snapshots are JSON files; a service opened from a file writes every
//! mutation back to it.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{AggregateQuery, InsertQuery, ReadQuery, Row, StoredRow, TableService};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Table {
    next_offset: i64,
    rows: BTreeMap<i64, Row>,
}

impl Table {
    fn insert(&mut self, row: Row, requested: Option<i64>) -> i64 {
        let offset = match requested {
            Some(offset) if offset > 0 && !self.rows.contains_key(&offset) => offset,
            _ => self.next_offset.max(1),
        };
        self.rows.insert(offset, row);
        self.next_offset = self.next_offset.max(offset + 1);
        offset
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Database {
    tables: BTreeMap<String, Table>,
}

/// Table service holding everything in memory
#[derive(Debug, Default)]
pub struct MemoryTableService {
    db: Mutex<Database>,
    path: Option<PathBuf>,
}

impl MemoryTableService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot file, starting empty when it does not exist yet
    pub async fn open_file(path: &Path) -> anyhow::Result<Self> {
        let db = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse database file: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Database::default(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read database file: {}", path.display()))
            }
        };

        Ok(Self {
            db: Mutex::new(db),
            path: Some(path.to_path_buf()),
        })
    }

    async fn persist(&self, db: &Database) -> anyhow::Result<()> {
        if let Some(path) = &self.path {
            write_snapshot(db, path).await?;
        }
        Ok(())
    }

    /// Apply `change` to a copy, persist it, and only then make it live
    async fn commit<T>(&self, change: impl FnOnce(&mut Database) -> T) -> anyhow::Result<T> {
        let mut db = self.db.lock().await;
        let mut next = db.clone();
        let out = change(&mut next);
        self.persist(&next).await?;
        *db = next;
        Ok(out)
    }
}

/// Write via a sibling temp file and rename so readers never see half a file
async fn write_snapshot(db: &Database, path: &Path) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(db)?;
    let tmp = path.with_extension("partial");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write snapshot: {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move snapshot into place: {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl TableService for MemoryTableService {
    async fn insert(&self, query: InsertQuery) -> anyhow::Result<u64> {
        self.commit(|db| {
            db.tables
                .entry(query.table)
                .or_default()
                .insert(query.row, query.offset);
        })
        .await?;
        Ok(1)
    }

    async fn read(&self, query: &ReadQuery) -> anyhow::Result<Vec<StoredRow>> {
        let db = self.db.lock().await;
        let Some(table) = db.tables.get(&query.table) else {
            return Ok(Vec::new());
        };

        let rows = table
            .rows
            .iter()
            .map(|(offset, row)| StoredRow {
                offset: *offset,
                row: row.clone(),
            })
            .filter(|stored| query.matches(stored))
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(rows)
    }

    async fn delete(&self, table: &str, offsets: &[i64]) -> anyhow::Result<u64> {
        self.commit(|db| match db.tables.get_mut(table) {
            Some(table) => offsets
                .iter()
                .filter(|offset| table.rows.remove(offset).is_some())
                .count() as u64,
            None => 0,
        })
        .await
    }

    async fn execute(&self, query: &AggregateQuery) -> anyhow::Result<i64> {
        let db = self.db.lock().await;
        match query {
            AggregateQuery::Count { table } => Ok(db
                .tables
                .get(table)
                .map(|t| t.rows.len() as i64)
                .unwrap_or(0)),
            AggregateQuery::Sum { table, column } => {
                let Some(table) = db.tables.get(table) else {
                    return Ok(0);
                };
                table.rows.values().try_fold(0i64, |acc, row| match row.get(column) {
                    None | Some(Value::Null) => Ok(acc),
                    Some(value) => value
                        .as_i64()
                        .map(|n| acc + n)
                        .with_context(|| format!("column '{column}' is not an integer: {value}")),
                })
            }
        }
    }

    async fn copy_database(&self, destination: &Path) -> anyhow::Result<bool> {
        let db = self.db.lock().await;
        write_snapshot(&db, destination).await?;
        Ok(true)
    }

    async fn open(&self, path: &Path) -> anyhow::Result<Arc<dyn TableService>> {
        Ok(Arc::new(MemoryTableService::open_file(path).await?))
    }

    async fn tables(&self) -> anyhow::Result<Vec<String>> {
        let db = self.db.lock().await;
        Ok(db.tables.keys().cloned().collect())
    }

    async fn drop_table(&self, table: &str) -> anyhow::Result<()> {
        self.commit(|db| {
            db.tables.remove(table);
        })
        .await
    }
}
