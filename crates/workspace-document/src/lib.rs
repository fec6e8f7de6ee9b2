//! # Workspace Document
//!
//! The authoritative, in-memory document backing one workspace, and the typed
//! table accessors projected over it.
//!
//! ## Principles
//!
//! - **All writes happen inside a transaction** - observers see one batched,
//!   post-commit snapshot per map, never a torn intermediate state
//! - **Nested transactions reuse the outer one** - a `transact` call made
//!   while a transaction is open on the same thread joins it; only the
//!   outermost commits
//! - **Observers run in commit order** - a committing thread keeps the
//!   document until its observers have run; a handler may read or write the
//!   document again
//! - **Rows are validated on read and on write** - invalid rows stay visible
//!   through [`RowResult::Invalid`] instead of disappearing
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use workspace_document::{ColumnKind, ColumnSpec, Document, TableSchema, Tables, WorkspaceSchema};
//!
//! let schema = WorkspaceSchema::new().with_table(
//!     TableSchema::new("notes").with_column(ColumnSpec::new("title", ColumnKind::Text)),
//! );
//! let doc = Document::new("notes-workspace");
//! let tables = Tables::new(&doc, &schema);
//! let notes = tables.get("notes").unwrap();
//!
//! notes
//!     .upsert(json!({ "id": "n1", "title": "hello" }).as_object().unwrap().clone())
//!     .unwrap();
//! assert_eq!(notes.get_all_valid().len(), 1);
//! ```

mod change;
mod document;
pub mod schema;
mod table;

pub use change::{ChangeAction, ChangeEvent, KeyChange};
pub use document::{Document, MapRef, Subscription, Transaction};
pub use schema::{
    merge_schema, ColumnKind, ColumnSpec, SchemaMerge, TableSchema, WorkspaceSchema, ID_COLUMN,
    SCHEMA_MAP,
};
pub use table::{InvalidRow, RowResult, TableHandle, Tables};

/// A table row: a JSON object that always carries a string `id`.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Errors that can occur in the document layer.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// The document was destroyed; no further transactions are accepted.
    #[error("document {0} has been destroyed")]
    Destroyed(String),

    /// No table with this name exists in the workspace schema.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The row failed schema validation.
    #[error("row {id} in table {table} is invalid: {}", errors.join("; "))]
    InvalidRow {
        table: String,
        id: String,
        errors: Vec<String>,
    },

    /// Schema descriptors could not be serialized into the document.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using DocumentError.
pub type DocumentResult<T> = Result<T, DocumentError>;
