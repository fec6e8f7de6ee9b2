//! Outcome of bulk reconciliation and live status.

use serde::Serialize;
use workspace_document::InvalidRow;

/// Which way a bulk operation moved rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    InitialPush,
    Push,
    Pull,
}

/// Where the synchronizer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    StreamingIncremental,
    BulkPushing,
    BulkPulling,
    Stopped,
}

/// A single row that could not be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    pub row_id: String,
    pub operation: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableReport {
    pub table: String,
    /// Rows written to the destination.
    pub written: usize,
    /// Rows removed from the destination before writing.
    pub cleared: usize,
    pub failures: Vec<RowFailure>,
    /// Rows withheld because they fail validation.
    pub invalid: Vec<InvalidRow>,
}

impl TableReport {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }
}

/// Per-table outcome of one bulk operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub workspace: String,
    pub direction: SyncDirection,
    pub tables: Vec<TableReport>,
}

impl SyncReport {
    pub fn new(workspace: impl Into<String>, direction: SyncDirection) -> Self {
        Self {
            workspace: workspace.into(),
            direction,
            tables: Vec::new(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }

    pub fn written(&self) -> usize {
        self.tables.iter().map(|t| t.written).sum()
    }

    pub fn failures(&self) -> usize {
        self.tables.iter().map(|t| t.failures.len()).sum()
    }

    pub fn invalid(&self) -> usize {
        self.tables.iter().map(|t| t.invalid.len()).sum()
    }

    /// No row failed and no row was withheld.
    pub fn is_clean(&self) -> bool {
        self.failures() == 0 && self.invalid() == 0
    }
}

/// Snapshot of a synchronizer's state and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub workspace: String,
    pub store: String,
    pub phase: SyncPhase,
    pub pulling: bool,
    pub pushing: bool,
    /// Incremental changes written to the mirror.
    pub forwarded: u64,
    /// Row writes that failed, incremental and bulk.
    pub failed: u64,
    /// Incremental changes that carried an invalid row.
    pub invalid: u64,
    /// Changes ignored because a pull was in progress.
    pub skipped_during_pull: u64,
    /// Tables re-pushed after their queue overflowed.
    pub resyncs: u64,
}
