//! The mirror synchronizer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use extension_lifecycle::ExtensionContext;
use mirror_store::{MirrorError, MirrorStore};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use workspace_document::{
    ChangeAction, ChangeEvent, Document, Row, RowResult, Subscription, TableHandle, TableSchema,
};

use crate::lane::{spawn_drain, QueueItem, TableLane};
use crate::report::{
    RowFailure, SyncDirection, SyncPhase, SyncReport, SyncStatus, TableReport,
};
use crate::{MirrorSyncOptions, SyncError};

/// State shared by the synchronizer, its observers and its drain tasks.
pub(crate) struct SyncShared {
    pub(crate) workspace: String,
    store: Arc<dyn MirrorStore>,
    pulling: AtomicBool,
    pushing: AtomicBool,
    stopped: AtomicBool,
    phase: Mutex<SyncPhase>,
    /// Serializes bulk operations.
    bulk: AsyncMutex<()>,
    forwarded: AtomicU64,
    failed: AtomicU64,
    invalid: AtomicU64,
    skipped_during_pull: AtomicU64,
    resyncs: AtomicU64,
}

impl SyncShared {
    fn set_phase(&self, phase: SyncPhase) {
        let mut current = self.phase.lock().expect("lock poisoned");
        if *current != SyncPhase::Stopped {
            *current = phase;
        }
    }

    fn row_failed(&self, table: &str, row_id: &str, operation: &str, error: &MirrorError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            workspace = %self.workspace,
            table = %table,
            row_id = %row_id,
            operation = %operation,
            error = %error,
            "mirror write failed, row skipped"
        );
    }

    /// Writes one incremental change. Row failures are logged and skipped.
    pub(crate) async fn forward(&self, table: &TableHandle, event: ChangeEvent) {
        let name = table.name();
        let (operation, result) = match (event.action, event.row) {
            (ChangeAction::Delete, _) | (_, None) => (
                "delete",
                self.store.delete(name, &event.row_id).await.map(|_| ()),
            ),
            (action, Some(row)) => match table.classify(&event.row_id, Value::Object(row)) {
                RowResult::Valid(row) if action == ChangeAction::Add => {
                    ("insert", self.store.insert(name, &row).await)
                }
                RowResult::Valid(row) => ("update", self.update_or_insert(name, &event.row_id, &row).await),
                RowResult::Invalid(invalid) => {
                    self.invalid.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        workspace = %self.workspace,
                        table = %name,
                        row_id = %event.row_id,
                        errors = ?invalid.errors,
                        "invalid row withheld from mirror"
                    );
                    (
                        "delete",
                        self.store.delete(name, &event.row_id).await.map(|_| ()),
                    )
                }
                RowResult::NotFound => return,
            },
        };

        match result {
            Ok(()) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.row_failed(name, &event.row_id, operation, &e),
        }
    }

    async fn update_or_insert(&self, table: &str, id: &str, row: &Row) -> Result<(), MirrorError> {
        match self.store.update(table, id, row).await {
            Err(MirrorError::RowNotFound { .. }) => self.store.insert(table, row).await,
            other => other,
        }
    }

    /// Writes every valid row of `table`, after clearing the mirror table
    /// when `replace` is set. Only a failed clear aborts.
    async fn write_table(&self, table: &TableHandle, replace: bool) -> Result<TableReport, SyncError> {
        let name = table.name();
        let mut report = TableReport::new(name);

        if replace {
            report.cleared = self
                .store
                .delete_all(name)
                .await
                .map_err(|source| SyncError::Mirror {
                    operation: format!("delete_all {}", name),
                    source,
                })?;
        }

        let (valid, invalid) = table.partition();
        for row in valid {
            let id = TableSchema::row_id(&row).unwrap_or_default().to_string();
            match self.store.insert(name, &row).await {
                Ok(()) => report.written += 1,
                Err(e) => {
                    self.row_failed(name, &id, "insert", &e);
                    report.failures.push(RowFailure {
                        row_id: id,
                        operation: "insert".to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        if !invalid.is_empty() {
            debug!(
                workspace = %self.workspace,
                table = %name,
                count = invalid.len(),
                "invalid rows withheld from mirror"
            );
        }
        report.invalid = invalid;
        Ok(report)
    }

    /// Re-pushes one table after its queue overflowed.
    pub(crate) async fn resync(&self, lane: &TableLane) {
        let _write = lane.write_lock.lock().await;
        match self.write_table(&lane.table, true).await {
            Ok(report) => {
                self.resyncs.fetch_add(1, Ordering::Relaxed);
                info!(
                    workspace = %self.workspace,
                    table = %lane.name(),
                    written = report.written,
                    failed = report.failures.len(),
                    "mirror table resynced"
                );
            }
            Err(e) => {
                lane.resync.store(true, Ordering::SeqCst);
                warn!(workspace = %self.workspace, table = %lane.name(), error = %e, "mirror table resync failed");
            }
        }
    }
}

/// Sets a bulk flag and phase; clears both when dropped.
struct BulkGuard<'a> {
    shared: &'a SyncShared,
    flag: &'a AtomicBool,
}

impl<'a> BulkGuard<'a> {
    fn new(shared: &'a SyncShared, flag: &'a AtomicBool, phase: SyncPhase) -> Self {
        flag.store(true, Ordering::SeqCst);
        shared.set_phase(phase);
        Self { shared, flag }
    }
}

impl Drop for BulkGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        self.shared.set_phase(SyncPhase::StreamingIncremental);
    }
}

struct SyncInner {
    shared: Arc<SyncShared>,
    document: Document,
    lanes: Vec<TableLane>,
    senders: Mutex<Vec<mpsc::Sender<QueueItem>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    schema_ready: Mutex<Option<watch::Sender<bool>>>,
    initial_report: Mutex<Option<SyncReport>>,
}

/// Keeps one workspace's document and one mirror store consistent.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct MirrorSynchronizer {
    inner: Arc<SyncInner>,
}

impl MirrorSynchronizer {
    /// Attaches an observer and a drain task to every table. Nothing is
    /// written until the mirror schema exists, see [`Self::initial_push`].
    pub fn attach(
        ctx: &ExtensionContext,
        store: Arc<dyn MirrorStore>,
        options: &MirrorSyncOptions,
    ) -> Result<Self, SyncError> {
        tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        let shared = Arc::new(SyncShared {
            workspace: ctx.workspace_id.clone(),
            store,
            pulling: AtomicBool::new(false),
            pushing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            phase: Mutex::new(SyncPhase::Idle),
            bulk: AsyncMutex::new(()),
            forwarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            skipped_during_pull: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
        });
        let (schema_tx, schema_rx) = watch::channel(false);
        let capacity = options.queue_capacity.max(1);

        let mut lanes = Vec::new();
        let mut senders = Vec::new();
        let mut subscriptions = Vec::new();
        let mut tasks = Vec::new();

        for table in ctx.tables.iter() {
            let lane = TableLane::new(table.clone());
            let (tx, rx) = mpsc::channel(capacity);

            let observer_shared = Arc::clone(&shared);
            let observer_tx = tx.clone();
            let resync = Arc::clone(&lane.resync);
            let table_name = table.name().to_string();
            subscriptions.push(table.observe(move |events| {
                if observer_shared.pulling.load(Ordering::SeqCst) {
                    observer_shared
                        .skipped_during_pull
                        .fetch_add(events.len() as u64, Ordering::Relaxed);
                    return;
                }
                for event in events {
                    match observer_tx.try_send(QueueItem::Change(event.clone())) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            if !resync.swap(true, Ordering::SeqCst) {
                                warn!(
                                    workspace = %observer_shared.workspace,
                                    table = %table_name,
                                    "mirror queue full, table marked for resync"
                                );
                            }
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!(table = %table_name, "mirror lane closed, change dropped");
                        }
                    }
                }
            }));

            tasks.push(spawn_drain(
                Arc::clone(&shared),
                lane.clone(),
                rx,
                schema_rx.clone(),
            ));
            senders.push(tx);
            lanes.push(lane);
        }

        shared.set_phase(SyncPhase::StreamingIncremental);
        info!(
            workspace = %shared.workspace,
            store = shared.store.kind(),
            tables = lanes.len(),
            capacity,
            "mirror synchronizer attached"
        );

        Ok(Self {
            inner: Arc::new(SyncInner {
                shared,
                document: ctx.document.clone(),
                lanes,
                senders: Mutex::new(senders),
                subscriptions: Mutex::new(subscriptions),
                tasks: Mutex::new(tasks),
                schema_ready: Mutex::new(Some(schema_tx)),
                initial_report: Mutex::new(None),
            }),
        })
    }

    pub fn workspace(&self) -> &str {
        &self.inner.shared.workspace
    }

    pub fn phase(&self) -> SyncPhase {
        *self.inner.shared.phase.lock().expect("lock poisoned")
    }

    pub fn is_pulling(&self) -> bool {
        self.inner.shared.pulling.load(Ordering::SeqCst)
    }

    pub fn is_pushing(&self) -> bool {
        self.inner.shared.pushing.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SyncStatus {
        let shared = &self.inner.shared;
        SyncStatus {
            workspace: shared.workspace.clone(),
            store: shared.store.kind().to_string(),
            phase: self.phase(),
            pulling: self.is_pulling(),
            pushing: self.is_pushing(),
            forwarded: shared.forwarded.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            invalid: shared.invalid.load(Ordering::Relaxed),
            skipped_during_pull: shared.skipped_during_pull.load(Ordering::Relaxed),
            resyncs: shared.resyncs.load(Ordering::Relaxed),
        }
    }

    /// Report of the push made when the synchronizer was attached.
    pub fn initial_report(&self) -> Option<SyncReport> {
        self.inner
            .initial_report
            .lock()
            .expect("lock poisoned")
            .clone()
    }

    /// Creates the mirror schema and inserts every valid row, leaving rows
    /// already in the mirror in place.
    pub async fn initial_push(&self) -> Result<SyncReport, SyncError> {
        let _bulk = self.begin_bulk().await?;
        self.ensure_mirror_schema().await?;
        let shared = &self.inner.shared;
        let _guard = BulkGuard::new(shared, &shared.pushing, SyncPhase::BulkPushing);

        let mut report = SyncReport::new(&shared.workspace, SyncDirection::InitialPush);
        for lane in &self.inner.lanes {
            let _write = lane.write_lock.lock().await;
            report.tables.push(shared.write_table(&lane.table, false).await?);
        }

        self.finish(&report);
        *self.inner.initial_report.lock().expect("lock poisoned") = Some(report.clone());
        Ok(report)
    }

    /// Makes the mirror equal to the document's valid rows: every mirror
    /// table is cleared and refilled.
    pub async fn push_to_mirror(&self) -> Result<SyncReport, SyncError> {
        let _bulk = self.begin_bulk().await?;
        self.ensure_mirror_schema().await?;
        let shared = &self.inner.shared;
        let _guard = BulkGuard::new(shared, &shared.pushing, SyncPhase::BulkPushing);
        self.flush_lanes().await;

        let mut report = SyncReport::new(&shared.workspace, SyncDirection::Push);
        for lane in &self.inner.lanes {
            let _write = lane.write_lock.lock().await;
            lane.resync.store(false, Ordering::SeqCst);
            report.tables.push(shared.write_table(&lane.table, true).await?);
        }

        self.finish(&report);
        Ok(report)
    }

    /// Makes the document equal to the mirror. Every mirror table is read
    /// first; then one document transaction clears each table and inserts
    /// the mirror rows. Changes committed meanwhile are not echoed back.
    pub async fn pull_from_mirror(&self) -> Result<SyncReport, SyncError> {
        let _bulk = self.begin_bulk().await?;
        self.ensure_mirror_schema().await?;
        let shared = &self.inner.shared;
        let _guard = BulkGuard::new(shared, &shared.pulling, SyncPhase::BulkPulling);
        self.flush_lanes().await;

        let mut fetched = Vec::with_capacity(self.inner.lanes.len());
        for lane in &self.inner.lanes {
            let _write = lane.write_lock.lock().await;
            let rows = shared
                .store
                .select_all(lane.name())
                .await
                .map_err(|source| SyncError::Mirror {
                    operation: format!("select_all {}", lane.name()),
                    source,
                })?;
            fetched.push((lane.table.clone(), rows));
        }

        let tables = self.inner.document.transact(|txn| {
            fetched
                .into_iter()
                .map(|(table, rows)| {
                    let mut report = TableReport::new(table.name());
                    report.cleared = table.clear_in(txn);
                    for row in rows {
                        let id = TableSchema::row_id(&row).unwrap_or_default().to_string();
                        match table.upsert_in(txn, row) {
                            Ok(()) => report.written += 1,
                            Err(e) => report.failures.push(RowFailure {
                                row_id: id,
                                operation: "pull".to_string(),
                                error: e.to_string(),
                            }),
                        }
                    }
                    for lane in &self.inner.lanes {
                        if lane.name() == table.name() {
                            lane.resync.store(false, Ordering::SeqCst);
                        }
                    }
                    report
                })
                .collect::<Vec<_>>()
        })?;

        let failed: usize = tables.iter().map(|t| t.failures.len()).sum();
        shared.failed.fetch_add(failed as u64, Ordering::Relaxed);
        for table in &tables {
            for failure in &table.failures {
                warn!(
                    workspace = %shared.workspace,
                    table = %table.table,
                    row_id = %failure.row_id,
                    operation = "pull",
                    error = %failure.error,
                    "mirror row rejected by document"
                );
            }
        }

        let mut report = SyncReport::new(&shared.workspace, SyncDirection::Pull);
        report.tables = tables;
        self.finish(&report);
        Ok(report)
    }

    /// Waits until every change observed so far has been written.
    pub async fn flush(&self) -> Result<(), SyncError> {
        if self.inner.shared.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped(self.workspace().to_string()));
        }
        self.ensure_mirror_schema().await?;
        self.flush_lanes().await;
        Ok(())
    }

    /// Detaches observers, drains the queues, then closes the store.
    /// Idempotent.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let shared = &self.inner.shared;
        if shared.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _bulk = shared.bulk.lock().await;

        self.inner.subscriptions.lock().expect("lock poisoned").clear();
        self.inner.senders.lock().expect("lock poisoned").clear();
        self.inner.schema_ready.lock().expect("lock poisoned").take();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().expect("lock poisoned"));
        for task in tasks {
            let _ = task.await;
        }

        shared.set_phase(SyncPhase::Stopped);
        shared
            .store
            .close()
            .await
            .map_err(|source| SyncError::Mirror {
                operation: "close".to_string(),
                source,
            })?;
        info!(workspace = %shared.workspace, "mirror synchronizer stopped");
        Ok(())
    }

    async fn begin_bulk(&self) -> Result<AsyncMutexGuard<'_, ()>, SyncError> {
        let guard = self.inner.shared.bulk.lock().await;
        if self.inner.shared.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped(self.workspace().to_string()));
        }
        Ok(guard)
    }

    async fn ensure_mirror_schema(&self) -> Result<(), SyncError> {
        let schemas: Vec<TableSchema> = self
            .inner
            .lanes
            .iter()
            .map(|lane| lane.table.schema().clone())
            .collect();
        self.inner
            .shared
            .store
            .ensure_schema(&schemas)
            .await
            .map_err(|source| SyncError::Mirror {
                operation: "ensure_schema".to_string(),
                source,
            })?;

        if let Some(ready) = self.inner.schema_ready.lock().expect("lock poisoned").as_ref() {
            ready.send_replace(true);
        }
        Ok(())
    }

    async fn flush_lanes(&self) {
        let senders: Vec<_> = self
            .inner
            .senders
            .lock()
            .expect("lock poisoned")
            .iter()
            .cloned()
            .collect();

        for sender in senders {
            let (done, acked) = oneshot::channel();
            if sender.send(QueueItem::Flush(done)).await.is_ok() {
                let _ = acked.await;
            }
        }
    }

    fn finish(&self, report: &SyncReport) {
        info!(
            workspace = %report.workspace,
            direction = ?report.direction,
            written = report.written(),
            failed = report.failures(),
            invalid = report.invalid(),
            "mirror bulk sync finished"
        );
    }
}

impl std::fmt::Debug for MirrorSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorSynchronizer")
            .field("workspace", &self.workspace())
            .field("phase", &self.phase())
            .finish()
    }
}
