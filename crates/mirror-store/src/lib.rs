//! # Mirror Store
//!
//! Derived, query-optimized copies of workspace tables.
//!
//! A mirror never decides anything: the authoritative document owns the data
//! and the synchronizer pushes rows here (or pulls them back on restore).
//! Two implementations ship:
//!
//! - [`SqliteMirror`] - one SQLite file per workspace, driven through
//!   `tokio-rusqlite` so every query runs on a dedicated thread
//! - [`RecordingMirror`] - in-memory, records every call and can inject
//!   failures; used by tests
//!
//! Both treat `insert` as insert-or-replace and report `update` of a missing
//! row as [`MirrorError::RowNotFound`].

mod recording;
mod sqlite;

use async_trait::async_trait;
use workspace_document::{Row, TableSchema};

pub use recording::{MirrorOp, RecordingMirror};
pub use sqlite::SqliteMirror;

/// Errors that can occur in a mirror store.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    /// The table was never created with [`MirrorStore::ensure_schema`].
    #[error("unknown mirror table: {0}")]
    UnknownTable(String),

    #[error("row {id} not found in mirror table {table}")]
    RowNotFound { table: String, id: String },

    /// A value could not be mapped to or from the store's column type.
    #[error("invalid value for {table}.{column}: {reason}")]
    InvalidValue {
        table: String,
        column: String,
        reason: String,
    },

    /// Failure injected by a test double.
    #[error("injected failure: {0}")]
    Injected(String),

    #[error("mirror store is closed")]
    Closed,
}

/// Result type alias using MirrorError.
pub type MirrorResult<T> = Result<T, MirrorError>;

/// A queryable store holding a derived copy of workspace tables.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Short label used in logs.
    fn kind(&self) -> &'static str;

    /// Creates missing tables and columns. Existing data is kept.
    async fn ensure_schema(&self, tables: &[TableSchema]) -> MirrorResult<()>;

    /// Inserts `row`, replacing any row with the same id.
    async fn insert(&self, table: &str, row: &Row) -> MirrorResult<()>;

    /// Replaces the row `id`; fails with [`MirrorError::RowNotFound`] if absent.
    async fn update(&self, table: &str, id: &str, row: &Row) -> MirrorResult<()>;

    /// Deletes the row `id`, returning whether it existed.
    async fn delete(&self, table: &str, id: &str) -> MirrorResult<bool>;

    /// Reads every row of `table`, ordered by id.
    async fn select_all(&self, table: &str) -> MirrorResult<Vec<Row>>;

    /// Deletes every row of `table`, returning how many were removed.
    async fn delete_all(&self, table: &str) -> MirrorResult<usize>;

    /// Releases the underlying connection. Later calls fail with
    /// [`MirrorError::Closed`].
    async fn close(&self) -> MirrorResult<()>;
}
