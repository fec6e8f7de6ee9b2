//! Starting extensions, gating readiness, tearing down.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures_util::future::{join_all, try_join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use tracing::{debug, info, warn};
use workspace_document::{merge_schema, Document};

use crate::extension::{DestroyFn, ExtensionContext, ExtensionExports, ExtensionFactory};
use crate::{LifecycleError, ReadinessError, SyncFuture};

/// Readiness timeout used when none is configured.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Readiness gate of one workspace. Cheap to clone; every clone observes the
/// same outcome.
pub type Readiness = Shared<BoxFuture<'static, Result<(), ReadinessError>>>;

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// `None` waits forever.
    pub readiness_timeout: Option<Duration>,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            readiness_timeout: Some(DEFAULT_READINESS_TIMEOUT),
        }
    }
}

/// Started extensions of one workspace.
pub struct Lifecycle {
    /// Exports keyed by extension id.
    pub exports: HashMap<String, ExtensionExports>,
    pub readiness: Readiness,
    pub teardown: Teardown,
}

/// Runs every factory against `ctx` and builds the readiness gate.
///
/// When a Tokio runtime is current, the gate is driven on a spawned task so
/// the schema lands as soon as extensions are synced, even if nobody awaits
/// readiness yet.
pub fn start(
    ctx: &ExtensionContext,
    extensions: &[(String, ExtensionFactory)],
    options: &LifecycleOptions,
) -> Result<Lifecycle, LifecycleError> {
    let mut seen = HashSet::new();
    for (id, _) in extensions {
        if !seen.insert(id.as_str()) {
            return Err(LifecycleError::DuplicateExtensionId {
                workspace: ctx.workspace_id.clone(),
                extension: id.clone(),
            });
        }
    }

    let mut exports = HashMap::new();
    let mut pending = Vec::new();
    let mut destroys: Vec<(String, DestroyFn)> = Vec::new();

    for (id, factory) in extensions {
        let instance = match factory(ctx) {
            Ok(instance) => instance,
            Err(source) => {
                let teardown = Teardown {
                    workspace_id: ctx.workspace_id.clone(),
                    document: ctx.document.clone(),
                    destroys,
                };
                teardown.discard();
                return Err(LifecycleError::ExtensionSetup {
                    workspace: ctx.workspace_id.clone(),
                    extension: id.clone(),
                    source,
                });
            }
        };

        debug!(workspace = %ctx.workspace_id, extension = %id, "extension started");
        exports.insert(id.clone(), instance.exports);
        if let Some(when_synced) = instance.when_synced {
            pending.push((id.clone(), when_synced));
        }
        if let Some(destroy) = instance.destroy {
            destroys.push((id.clone(), destroy));
        }
    }

    let readiness = readiness_gate(ctx, pending, options.readiness_timeout);
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let eager = readiness.clone();
        handle.spawn(async move {
            let _ = eager.await;
        });
    }

    Ok(Lifecycle {
        exports,
        readiness,
        teardown: Teardown {
            workspace_id: ctx.workspace_id.clone(),
            document: ctx.document.clone(),
            destroys,
        },
    })
}

fn readiness_gate(
    ctx: &ExtensionContext,
    pending: Vec<(String, SyncFuture)>,
    timeout: Option<Duration>,
) -> Readiness {
    let workspace = ctx.workspace_id.clone();
    let document = ctx.document.clone();
    let schema = ctx.schema.clone();

    async move {
        let synced = try_join_all(
            pending
                .into_iter()
                .map(|(id, when_synced)| async move { when_synced.await.map_err(|e| (id, e)) }),
        );

        let outcome = match timeout {
            Some(after) => match tokio::time::timeout(after, synced).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(workspace = %workspace, ?after, "workspace readiness timed out");
                    return Err(ReadinessError::TimedOut { workspace, after });
                }
            },
            None => synced.await,
        };

        if let Err((extension, e)) = outcome {
            warn!(workspace = %workspace, extension = %extension, error = %e, "extension failed to sync");
            return Err(ReadinessError::Extension {
                workspace,
                extension,
                message: e.to_string(),
            });
        }

        let merge = merge_schema(&document, &schema).map_err(|e| ReadinessError::Schema {
            workspace: workspace.clone(),
            message: e.to_string(),
        })?;

        info!(
            workspace = %workspace,
            tables_added = merge.added.len(),
            tables_updated = merge.updated.len(),
            "workspace ready"
        );
        Ok(())
    }
    .boxed()
    .shared()
}

/// Failure of one extension's `destroy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub workspace: String,
    pub extension: String,
    pub message: String,
}

/// What a teardown did. Failures are reported here, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Workspaces torn down, in teardown order.
    pub workspaces: Vec<String>,
    pub extensions_destroyed: usize,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn extend(&mut self, other: TeardownReport) {
        self.workspaces.extend(other.workspaces);
        self.extensions_destroyed += other.extensions_destroyed;
        self.failures.extend(other.failures);
    }
}

/// Teardown of one workspace's extensions and document.
pub struct Teardown {
    workspace_id: String,
    document: Document,
    destroys: Vec<(String, DestroyFn)>,
}

impl Teardown {
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Runs every `destroy` concurrently, then destroys the document
    /// whatever the outcome.
    pub async fn run(self) -> TeardownReport {
        let Teardown {
            workspace_id,
            document,
            destroys,
        } = self;

        let results = join_all(
            destroys
                .into_iter()
                .map(|(id, destroy)| async move { (id, destroy().await) }),
        )
        .await;

        let mut report = TeardownReport {
            workspaces: vec![workspace_id.clone()],
            ..Default::default()
        };
        for (extension, result) in results {
            match result {
                Ok(()) => report.extensions_destroyed += 1,
                Err(e) => {
                    warn!(workspace = %workspace_id, extension = %extension, error = %e, "extension teardown failed");
                    report.failures.push(TeardownFailure {
                        workspace: workspace_id.clone(),
                        extension,
                        message: e.to_string(),
                    });
                }
            }
        }

        document.destroy();
        info!(
            workspace = %workspace_id,
            destroyed = report.extensions_destroyed,
            failed = report.failures.len(),
            "workspace torn down"
        );
        report
    }

    /// Tears down without waiting: on a spawned task when a runtime is
    /// current, otherwise by destroying the document and dropping the
    /// pending `destroy` calls.
    pub fn discard(self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.run());
            }
            Err(_) => {
                self.document.destroy();
            }
        }
    }
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teardown")
            .field("workspace_id", &self.workspace_id)
            .field(
                "extensions",
                &self.destroys.iter().map(|(id, _)| id).collect::<Vec<_>>(),
            )
            .finish()
    }
}
