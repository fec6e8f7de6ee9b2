//! In-memory mirror that records every call.
//!
//! Tests assert on the recorded operations rather than on timing, and use
//! failure injection to exercise row-level and bulk-level error paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use workspace_document::{Row, TableSchema};

use crate::{MirrorError, MirrorResult, MirrorStore};

/// One call made against a [`RecordingMirror`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOp {
    EnsureSchema { tables: Vec<String> },
    Insert { table: String, id: String },
    Update { table: String, id: String },
    Delete { table: String, id: String },
    SelectAll { table: String },
    DeleteAll { table: String },
    Close,
}

impl MirrorOp {
    /// True for calls that change mirror contents.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            MirrorOp::Insert { .. }
                | MirrorOp::Update { .. }
                | MirrorOp::Delete { .. }
                | MirrorOp::DeleteAll { .. }
        )
    }
}

#[derive(Debug, Default)]
struct RecordingState {
    tables: HashMap<String, BTreeMap<String, Row>>,
    ops: Vec<MirrorOp>,
    failing_rows: HashSet<String>,
    failing_tables: HashSet<String>,
    closed: bool,
}

/// A mirror that keeps rows in memory and records all calls.
#[derive(Debug, Default)]
pub struct RecordingMirror {
    state: Mutex<RecordingState>,
    latency: Option<Duration>,
}

impl RecordingMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency` before it takes effect.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Pre-populates a table without recording any operation.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut state = self.state.lock().expect("lock poisoned");
        let entries = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Some(id) = TableSchema::row_id(&row) {
                entries.insert(id.to_string(), row.clone());
            }
        }
    }

    /// Makes every write touching row `id` fail.
    pub fn fail_row(&self, id: &str) {
        self.state
            .lock()
            .expect("lock poisoned")
            .failing_rows
            .insert(id.to_string());
    }

    /// Makes every call on `table` fail, including bulk reads and deletes.
    pub fn fail_table(&self, table: &str) {
        self.state
            .lock()
            .expect("lock poisoned")
            .failing_tables
            .insert(table.to_string());
    }

    /// Removes all injected failures.
    pub fn heal(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.failing_rows.clear();
        state.failing_tables.clear();
    }

    /// Returns all recorded operations.
    pub fn ops(&self) -> Vec<MirrorOp> {
        self.state.lock().expect("lock poisoned").ops.clone()
    }

    /// Returns the recorded operations that changed mirror contents.
    pub fn writes(&self) -> Vec<MirrorOp> {
        self.ops().into_iter().filter(MirrorOp::is_write).collect()
    }

    /// Clears all recorded operations.
    pub fn clear_ops(&self) {
        self.state.lock().expect("lock poisoned").ops.clear();
    }

    /// Current rows of `table`, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .expect("lock poisoned")
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("lock poisoned").closed
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Records `op`, then applies `f` to the table unless a failure is injected.
    fn apply<R>(
        &self,
        op: MirrorOp,
        table: &str,
        id: Option<&str>,
        f: impl FnOnce(&mut BTreeMap<String, Row>) -> MirrorResult<R>,
    ) -> MirrorResult<R> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.closed {
            return Err(MirrorError::Closed);
        }
        state.ops.push(op);

        if state.failing_tables.contains(table) {
            return Err(MirrorError::Injected(format!("table {}", table)));
        }
        if let Some(id) = id.filter(|id| state.failing_rows.contains(*id)) {
            return Err(MirrorError::Injected(format!("row {}", id)));
        }

        let rows = state
            .tables
            .get_mut(table)
            .ok_or_else(|| MirrorError::UnknownTable(table.to_string()))?;
        f(rows)
    }
}

#[async_trait]
impl MirrorStore for RecordingMirror {
    fn kind(&self) -> &'static str {
        "recording"
    }

    async fn ensure_schema(&self, tables: &[TableSchema]) -> MirrorResult<()> {
        self.pause().await;
        let mut state = self.state.lock().expect("lock poisoned");
        if state.closed {
            return Err(MirrorError::Closed);
        }
        state.ops.push(MirrorOp::EnsureSchema {
            tables: tables.iter().map(|t| t.name.clone()).collect(),
        });
        for table in tables {
            state.tables.entry(table.name.clone()).or_default();
        }
        Ok(())
    }

    async fn insert(&self, table: &str, row: &Row) -> MirrorResult<()> {
        self.pause().await;
        let id = TableSchema::row_id(row).unwrap_or_default().to_string();
        let op = MirrorOp::Insert {
            table: table.to_string(),
            id: id.clone(),
        };
        self.apply(op, table, Some(&id), |rows| {
            rows.insert(id.clone(), row.clone());
            Ok(())
        })
    }

    async fn update(&self, table: &str, id: &str, row: &Row) -> MirrorResult<()> {
        self.pause().await;
        let op = MirrorOp::Update {
            table: table.to_string(),
            id: id.to_string(),
        };
        self.apply(op, table, Some(id), |rows| match rows.get_mut(id) {
            Some(existing) => {
                *existing = row.clone();
                Ok(())
            }
            None => Err(MirrorError::RowNotFound {
                table: table.to_string(),
                id: id.to_string(),
            }),
        })
    }

    async fn delete(&self, table: &str, id: &str) -> MirrorResult<bool> {
        self.pause().await;
        let op = MirrorOp::Delete {
            table: table.to_string(),
            id: id.to_string(),
        };
        self.apply(op, table, Some(id), |rows| Ok(rows.remove(id).is_some()))
    }

    async fn select_all(&self, table: &str) -> MirrorResult<Vec<Row>> {
        self.pause().await;
        let op = MirrorOp::SelectAll {
            table: table.to_string(),
        };
        self.apply(op, table, None, |rows| Ok(rows.values().cloned().collect()))
    }

    async fn delete_all(&self, table: &str) -> MirrorResult<usize> {
        self.pause().await;
        let op = MirrorOp::DeleteAll {
            table: table.to_string(),
        };
        self.apply(op, table, None, |rows| {
            let removed = rows.len();
            rows.clear();
            Ok(removed)
        })
    }

    async fn close(&self) -> MirrorResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.closed {
            state.ops.push(MirrorOp::Close);
            state.closed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str) -> Row {
        json!({ "id": id }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn records_calls_in_order() {
        let mirror = RecordingMirror::new();
        mirror.ensure_schema(&[TableSchema::new("t")]).await.unwrap();
        mirror.insert("t", &row("a")).await.unwrap();
        mirror.update("t", "a", &row("a")).await.unwrap();
        mirror.delete("t", "a").await.unwrap();

        assert_eq!(
            mirror.writes(),
            vec![
                MirrorOp::Insert { table: "t".into(), id: "a".into() },
                MirrorOp::Update { table: "t".into(), id: "a".into() },
                MirrorOp::Delete { table: "t".into(), id: "a".into() },
            ]
        );
        assert!(mirror.rows("t").is_empty());
    }

    #[tokio::test]
    async fn injected_row_failure_leaves_other_rows_alone() {
        let mirror = RecordingMirror::new();
        mirror.ensure_schema(&[TableSchema::new("t")]).await.unwrap();
        mirror.fail_row("bad");

        assert!(matches!(
            mirror.insert("t", &row("bad")).await,
            Err(MirrorError::Injected(_))
        ));
        mirror.insert("t", &row("good")).await.unwrap();

        assert_eq!(mirror.rows("t"), vec![row("good")]);
    }

    #[tokio::test]
    async fn failing_table_rejects_bulk_calls() {
        let mirror = RecordingMirror::new();
        mirror.seed("t", vec![row("a")]);
        mirror.fail_table("t");

        assert!(mirror.select_all("t").await.is_err());
        assert!(mirror.delete_all("t").await.is_err());

        mirror.heal();
        assert_eq!(mirror.select_all("t").await.unwrap(), vec![row("a")]);
    }

    #[tokio::test]
    async fn unknown_table_and_closed_store_are_errors() {
        let mirror = RecordingMirror::new();
        assert!(matches!(
            mirror.insert("nope", &row("a")).await,
            Err(MirrorError::UnknownTable(_))
        ));

        mirror.close().await.unwrap();
        assert!(mirror.is_closed());
        assert!(matches!(
            mirror.select_all("nope").await,
            Err(MirrorError::Closed)
        ));
    }
}
