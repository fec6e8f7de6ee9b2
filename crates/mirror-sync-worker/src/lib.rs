//! # Mirror Sync Worker
//!
//! Keeps a workspace document and a [`MirrorStore`] consistent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  observe   ┌──────────────┐  drain   ┌──────────────┐
//! │   Document   │───────────▶│  Table lane  │─────────▶│ MirrorStore  │
//! │   (tables)   │            │ (bounded mpsc│          │  (SQLite or  │
//! └──────▲───────┘            │  per table)  │          │  recording)  │
//!        │                    └──────────────┘          └──────┬───────┘
//!        └──────────────────── pull_from_mirror ◀──────────────┘
//! ```
//!
//! ## Key Features
//!
//! - **Incremental forwarding**: every committed row change is queued on its
//!   table's lane and written in commit order. A failed row write is logged
//!   and skipped; the next change is still written.
//!
//! - **Validation gate**: only rows that pass the table schema reach the
//!   mirror. A row that becomes invalid is removed from it.
//!
//! - **Bulk reconciliation**: [`MirrorSynchronizer::push_to_mirror`] makes
//!   the mirror equal the document; [`MirrorSynchronizer::pull_from_mirror`]
//!   makes the document equal the mirror, without echoing the pulled rows
//!   back. Bulk operations never overlap.
//!
//! - **Overflow resync**: a full queue marks its table for a full re-push
//!   instead of blocking the committing thread.
//!
//! ## Example
//!
//! ```ignore
//! use mirror_store::SqliteMirror;
//! use mirror_sync_worker::{mirror_extension, MirrorSyncOptions};
//!
//! let store = Arc::new(SqliteMirror::open(&paths.mirror_file("notes")).await?);
//! let notes = WorkspaceDeclaration::new("notes", 1, "notes")
//!     .with_schema(schema)
//!     .with_extension("mirror", mirror_extension(store, MirrorSyncOptions::default()));
//! ```

mod lane;
mod report;
mod synchronizer;

pub use report::{RowFailure, SyncDirection, SyncPhase, SyncReport, SyncStatus, TableReport};
pub use synchronizer::MirrorSynchronizer;

use std::sync::Arc;

use extension_lifecycle::{extension_factory, ExtensionError, ExtensionFactory, ExtensionInstance};
use mirror_store::{MirrorError, MirrorStore};
use workspace_document::DocumentError;

/// Export key under which [`mirror_extension`] publishes its synchronizer.
pub const SYNCHRONIZER_EXPORT: &str = "synchronizer";

/// Queue capacity per table when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct MirrorSyncOptions {
    /// Pending changes buffered per table before the table is marked for resync.
    pub queue_capacity: usize,
}

impl Default for MirrorSyncOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Errors that can occur while synchronizing.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A mirror call failed in a way that aborts the whole operation.
    #[error("mirror {operation} failed: {source}")]
    Mirror {
        operation: String,
        #[source]
        source: MirrorError,
    },

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("synchronizer for workspace {0} is stopped")]
    Stopped(String),

    #[error("mirror synchronizer requires a tokio runtime")]
    NoRuntime,
}

/// Result type alias using SyncError.
pub type SyncResult<T> = Result<T, SyncError>;

/// An extension that mirrors every table of its workspace into `store`.
///
/// The workspace is ready once the initial push has finished; teardown
/// stops the synchronizer and closes the store. The synchronizer is
/// exported as `Arc<MirrorSynchronizer>` under [`SYNCHRONIZER_EXPORT`].
pub fn mirror_extension(store: Arc<dyn MirrorStore>, options: MirrorSyncOptions) -> ExtensionFactory {
    extension_factory(move |ctx| {
        let sync = MirrorSynchronizer::attach(ctx, Arc::clone(&store), &options)
            .map_err(|e| ExtensionError::Setup(e.to_string()))?;

        let initial = sync.clone();
        let stopping = sync.clone();
        Ok(ExtensionInstance::new()
            .with_export(SYNCHRONIZER_EXPORT, Arc::new(sync))
            .with_when_synced(async move {
                initial
                    .initial_push()
                    .await
                    .map(|_| ())
                    .map_err(|e| ExtensionError::Sync(e.to_string()))
            })
            .with_destroy(move || async move {
                stopping
                    .stop()
                    .await
                    .map_err(|e| ExtensionError::Teardown(e.to_string()))
            }))
    })
}
