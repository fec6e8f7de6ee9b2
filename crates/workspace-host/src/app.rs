//! Opening, driving and closing the bundled workspace graph.

use std::error::Error;
use std::sync::Arc;

use extension_lifecycle::{ExtensionFactory, LifecycleOptions, TeardownReport};
use mirror_store::SqliteMirror;
use mirror_sync_worker::{
    mirror_extension, MirrorSyncOptions, MirrorSynchronizer, SyncReport, SYNCHRONIZER_EXPORT,
};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use workspace_config_and_utils::{Config, Paths};
use workspace_document::{Row, TableSchema, ID_COLUMN};
use workspace_resolver::{initialize_with, ResolveOptions, ResolvedWorkspace, WorkspaceClient};

use crate::demo::{self, MIRROR_EXTENSION, NOTES, TAGS};

pub type AppResult<T> = Result<T, Box<dyn Error>>;

/// The bundled workspaces, ready and restored from their mirrors.
pub struct Host {
    resolved: ResolvedWorkspace,
}

impl Host {
    /// Builds the graph, waits for readiness, then pulls every mirror into
    /// its document.
    pub async fn open(config: &Config, paths: &Paths) -> AppResult<Self> {
        paths.ensure_dirs()?;
        let options = MirrorSyncOptions {
            queue_capacity: config.mirror.queue_capacity,
        };

        let tags = Arc::new(demo::tags_workspace(
            mirror_for(config, paths, TAGS, &options).await?,
        ));
        let notes = Arc::new(demo::notes_workspace(
            tags,
            mirror_for(config, paths, NOTES, &options).await?,
        ));

        let resolved = initialize_with(
            &notes,
            ResolveOptions {
                lifecycle: LifecycleOptions {
                    readiness_timeout: config.readiness_timeout(),
                },
            },
        )?;
        if let Err(e) = resolved.when_ready().await {
            warn!(error = %e, "workspaces failed to become ready");
            resolved.destroy().await;
            return Err(e.into());
        }

        let host = Self { resolved };
        for sync in host.synchronizers() {
            let report = match sync.pull_from_mirror().await {
                Ok(report) => report,
                Err(e) => {
                    warn!(workspace = %sync.workspace(), error = %e, "restore from mirror failed");
                    host.close().await;
                    return Err(e.into());
                }
            };
            info!(
                workspace = %report.workspace,
                restored = report.written(),
                failed = report.failures(),
                "workspace restored from mirror"
            );
        }
        Ok(host)
    }

    fn synchronizers(&self) -> Vec<Arc<MirrorSynchronizer>> {
        self.resolved
            .clients()
            .iter()
            .filter_map(|client| client.export::<MirrorSynchronizer>(MIRROR_EXTENSION, SYNCHRONIZER_EXPORT))
            .collect()
    }

    fn owner_of(&self, table: &str) -> Option<&Arc<WorkspaceClient>> {
        self.resolved
            .clients()
            .iter()
            .find(|client| client.table(table).is_some())
    }

    /// Tables, row counts and sync status of every workspace.
    pub fn status(&self) -> Value {
        let workspaces: Vec<Value> = self
            .resolved
            .clients()
            .iter()
            .map(|client| {
                let tables: Map<String, Value> = client
                    .tables()
                    .iter()
                    .map(|table| {
                        let (valid, invalid) = table.partition();
                        (
                            table.name().to_string(),
                            json!({
                                "rows": valid,
                                "invalid": invalid,
                            }),
                        )
                    })
                    .collect();
                let sync = client
                    .export::<MirrorSynchronizer>(MIRROR_EXTENSION, SYNCHRONIZER_EXPORT)
                    .map(|sync| json!(sync.status()));
                json!({
                    "id": client.id(),
                    "version": client.version(),
                    "name": client.name(),
                    "dependencies": client.dependencies().keys().collect::<Vec<_>>(),
                    "actions": client.actions().names(),
                    "tables": tables,
                    "sync": sync,
                })
            })
            .collect();
        json!({ "workspaces": workspaces })
    }

    /// Inserts `row` into `table`, generating an id when none is given, and
    /// waits until it has been mirrored.
    pub async fn add(&self, table: &str, row: Value) -> AppResult<Row> {
        let client = self
            .owner_of(table)
            .ok_or_else(|| format!("no workspace has a table named {}", table))?;
        let mut row = match row {
            Value::Object(row) => row,
            other => return Err(format!("row must be a JSON object, got {}", other).into()),
        };
        if TableSchema::row_id(&row).is_none() {
            row.insert(ID_COLUMN.to_string(), json!(uuid::Uuid::new_v4().to_string()));
        }

        client.tables().require(table)?.upsert(row.clone())?;
        if let Some(sync) = client.export::<MirrorSynchronizer>(MIRROR_EXTENSION, SYNCHRONIZER_EXPORT) {
            sync.flush().await?;
        }
        Ok(row)
    }

    /// Runs a business action on the workspace `workspace`.
    pub async fn action(&self, workspace: &str, name: &str, input: Value) -> AppResult<Value> {
        let client = self
            .resolved
            .client(workspace)
            .ok_or_else(|| format!("unknown workspace {}", workspace))?;
        let output = client.action(name, input)?;
        if let Some(sync) = client.export::<MirrorSynchronizer>(MIRROR_EXTENSION, SYNCHRONIZER_EXPORT) {
            sync.flush().await?;
        }
        Ok(output)
    }

    pub async fn push(&self) -> AppResult<Vec<SyncReport>> {
        let mut reports = Vec::new();
        for sync in self.mirrored()? {
            reports.push(sync.push_to_mirror().await?);
        }
        Ok(reports)
    }

    pub async fn pull(&self) -> AppResult<Vec<SyncReport>> {
        let mut reports = Vec::new();
        for sync in self.mirrored()? {
            reports.push(sync.pull_from_mirror().await?);
        }
        Ok(reports)
    }

    fn mirrored(&self) -> AppResult<Vec<Arc<MirrorSynchronizer>>> {
        let synchronizers = self.synchronizers();
        if synchronizers.is_empty() {
            return Err("mirroring is disabled in config.json".into());
        }
        Ok(synchronizers)
    }

    /// Tears the graph down, closing every mirror.
    pub async fn close(self) -> TeardownReport {
        let report = self.resolved.destroy().await;
        for failure in &report.failures {
            warn!(
                workspace = %failure.workspace,
                extension = %failure.extension,
                error = %failure.message,
                "teardown failed"
            );
        }
        report
    }
}

async fn mirror_for(
    config: &Config,
    paths: &Paths,
    workspace: &str,
    options: &MirrorSyncOptions,
) -> AppResult<Option<ExtensionFactory>> {
    if !config.mirror.enabled {
        return Ok(None);
    }
    let store = SqliteMirror::open(&paths.mirror_file(workspace)).await?;
    Ok(Some(mirror_extension(Arc::new(store), options.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(dir: &TempDir) -> Paths {
        Paths::with_base_dir(dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn added_rows_are_restored_on_next_open() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();

        let host = Host::open(&config, &paths(&dir)).await.unwrap();
        let tag = host
            .add("tags", json!({ "label": "urgent", "color": "red" }))
            .await
            .unwrap();
        assert!(TableSchema::row_id(&tag).is_some());
        assert!(host.close().await.is_clean());

        let host = Host::open(&config, &paths(&dir)).await.unwrap();
        let status = host.status();
        let tags = &status["workspaces"][0];
        assert_eq!(tags["id"], "tags");
        assert_eq!(tags["tables"]["tags"]["rows"][0]["label"], "urgent");
        assert_eq!(tags["sync"]["phase"], "streaming_incremental");
        host.close().await;
    }

    #[tokio::test]
    async fn notes_can_be_tagged_through_their_dependency() {
        let dir = TempDir::new().unwrap();
        let host = Host::open(&Config::default(), &paths(&dir)).await.unwrap();
        host.add("tags", json!({ "id": "t1", "label": "work" }))
            .await
            .unwrap();
        host.add("notes", json!({ "id": "n1", "title": "plan" }))
            .await
            .unwrap();

        let note = host
            .action(NOTES, "tag_note", json!({ "note_id": "n1", "tag_id": "t1" }))
            .await
            .unwrap();
        assert_eq!(note["tags"], json!(["t1"]));
        assert!(host
            .action(NOTES, "tag_note", json!({ "note_id": "n1", "tag_id": "nope" }))
            .await
            .is_err());

        let reports = host.push().await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(SyncReport::is_clean));
        host.close().await;
    }

    #[tokio::test]
    async fn disabled_mirroring_rejects_reconciliation() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.mirror.enabled = false;

        let host = Host::open(&config, &paths(&dir)).await.unwrap();
        host.add("tags", json!({ "label": "x" })).await.unwrap();

        assert!(host.push().await.is_err());
        assert!(host.status()["workspaces"][0]["sync"].is_null());
        host.close().await;
    }

    #[tokio::test]
    async fn failed_restore_closes_every_mirror() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        paths.ensure_dirs().unwrap();
        let tags_file = paths.mirror_file(TAGS);
        {
            let conn = rusqlite::Connection::open(&tags_file).unwrap();
            conn.execute_batch(
                "CREATE TABLE tags (id TEXT PRIMARY KEY, label TEXT, color TEXT);
                 INSERT INTO tags (id, label) VALUES ('t1', X'00');",
            )
            .unwrap();
        }

        assert!(Host::open(&Config::default(), &paths).await.is_err());

        // The last connection to a WAL database removes its log on close.
        let mut wal = tags_file.into_os_string();
        wal.push("-wal");
        assert!(!std::path::Path::new(&wal).exists());
    }

    #[tokio::test]
    async fn rows_for_unknown_tables_are_rejected() {
        let dir = TempDir::new().unwrap();
        let host = Host::open(&Config::default(), &paths(&dir)).await.unwrap();

        assert!(host.add("missing", json!({ "id": "a" })).await.is_err());
        assert!(host.add("tags", json!(["not", "an", "object"])).await.is_err());
        assert!(host.add("tags", json!({ "id": "a", "label": 3 })).await.is_err());
        host.close().await;
    }
}
