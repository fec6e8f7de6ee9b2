//! Per-table ordered write lanes.
//!
//! Each table gets a bounded queue fed by its document observer and drained
//! by one task, so mirror writes for a table happen in change order. A full
//! queue marks the table for resync instead of dropping the change; the
//! drain task re-pushes the whole table once it has caught up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::debug;
use workspace_document::{ChangeEvent, TableHandle};

use crate::synchronizer::SyncShared;

pub(crate) enum QueueItem {
    Change(ChangeEvent),
    /// Acknowledged once every earlier item, and any pending resync, has
    /// been written.
    Flush(oneshot::Sender<()>),
}

/// Per-table state shared by the observer, the drain task and bulk
/// operations.
#[derive(Clone)]
pub(crate) struct TableLane {
    pub(crate) table: TableHandle,
    pub(crate) resync: Arc<AtomicBool>,
    /// Held for every mirror write to this table, incremental or bulk.
    pub(crate) write_lock: Arc<AsyncMutex<()>>,
}

impl TableLane {
    pub(crate) fn new(table: TableHandle) -> Self {
        Self {
            table,
            resync: Arc::new(AtomicBool::new(false)),
            write_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.table.name()
    }
}

/// Spawns the drain task for `lane`. It waits until the mirror schema
/// exists, then writes queued changes in order until every sender is gone.
pub(crate) fn spawn_drain(
    shared: Arc<SyncShared>,
    lane: TableLane,
    mut receiver: mpsc::Receiver<QueueItem>,
    mut schema_ready: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if schema_ready.wait_for(|ready| *ready).await.is_err() {
            debug!(workspace = %shared.workspace, table = %lane.name(), "mirror lane closed before schema was ready");
            return;
        }

        while let Some(item) = receiver.recv().await {
            match item {
                QueueItem::Change(event) => {
                    let _write = lane.write_lock.lock().await;
                    shared.forward(&lane.table, event).await;
                }
                QueueItem::Flush(done) => {
                    if lane.resync.swap(false, Ordering::SeqCst) {
                        shared.resync(&lane).await;
                    }
                    let _ = done.send(());
                }
            }

            if receiver.is_empty() && lane.resync.swap(false, Ordering::SeqCst) {
                shared.resync(&lane).await;
            }
        }

        debug!(workspace = %shared.workspace, table = %lane.name(), "mirror lane drained");
    })
}
