//! Resolution registry and the recursive initializer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use extension_lifecycle::{
    start, ExtensionContext, LifecycleOptions, Readiness, ReadinessError, TeardownReport,
};
use futures_util::future::try_join_all;
use futures_util::FutureExt;
use tracing::{debug, info, warn};
use workspace_document::{Document, Tables};

use crate::declaration::{Actions, WorkspaceContext, WorkspaceDeclaration};
use crate::{ResolveError, WorkspaceClient};

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub lifecycle: LifecycleOptions,
}

/// State of one resolution: winners, materialized clients and the ids
/// currently being initialized.
#[derive(Default)]
struct ResolutionRegistry {
    winners: HashMap<String, Arc<WorkspaceDeclaration>>,
    clients: HashMap<String, Arc<WorkspaceClient>>,
    in_progress: HashSet<String>,
    /// Ids of live clients in construction order.
    order: Vec<String>,
    /// Clients invalidated by a higher version.
    superseded: Vec<Arc<WorkspaceClient>>,
}

/// Materializes workspaces, dependencies first, each exactly once.
pub struct Resolver {
    registry: ResolutionRegistry,
    options: ResolveOptions,
}

impl Resolver {
    pub fn new(options: ResolveOptions) -> Self {
        Self {
            registry: ResolutionRegistry::default(),
            options,
        }
    }

    /// Records `decl` as the winner for its id unless a declaration with an
    /// equal or higher version already won. A strictly higher version
    /// invalidates any client built from the previous winner.
    ///
    /// Returns the winning declaration.
    pub fn register(&mut self, decl: &Arc<WorkspaceDeclaration>) -> Arc<WorkspaceDeclaration> {
        let registry = &mut self.registry;
        let current = registry.winners.get(&decl.id).map(|c| c.version);
        match current {
            Some(version) if decl.version <= version => Arc::clone(&registry.winners[&decl.id]),
            previous => {
                if let Some(from) = previous {
                    info!(
                        workspace = %decl.id,
                        from,
                        to = decl.version,
                        "higher workspace version wins"
                    );
                }
                registry.winners.insert(decl.id.clone(), Arc::clone(decl));
                if let Some(stale) = registry.clients.remove(&decl.id) {
                    registry.order.retain(|id| id != &decl.id);
                    registry.superseded.push(stale);
                }
                Arc::clone(decl)
            }
        }
    }

    /// Returns the client for `decl`'s id, building it and its dependencies
    /// on first use. Idempotent.
    pub fn ensure_workspace(
        &mut self,
        decl: &Arc<WorkspaceDeclaration>,
    ) -> Result<Arc<WorkspaceClient>, ResolveError> {
        let decl = self.register(decl);

        if let Some(client) = self.registry.clients.get(&decl.id) {
            return Ok(Arc::clone(client));
        }

        if !self.registry.in_progress.insert(decl.id.clone()) {
            warn!(workspace = %decl.id, "circular workspace dependency");
            return Err(ResolveError::CircularDependency(decl.id.clone()));
        }

        let result = self.construct(&decl);
        self.registry.in_progress.remove(&decl.id);
        result
    }

    pub fn client(&self, id: &str) -> Option<Arc<WorkspaceClient>> {
        self.registry.clients.get(id).cloned()
    }

    /// Live clients in construction order.
    pub fn clients(&self) -> Vec<Arc<WorkspaceClient>> {
        self.registry
            .order
            .iter()
            .filter_map(|id| self.registry.clients.get(id).cloned())
            .collect()
    }

    /// Tears every client down without waiting; used when resolution fails
    /// part way.
    fn discard_all(&mut self) {
        for client in self.clients().into_iter().rev() {
            client.discard();
        }
        for client in self.registry.superseded.drain(..).rev() {
            client.discard();
        }
        self.registry.clients.clear();
        self.registry.order.clear();
    }

    fn construct(
        &mut self,
        decl: &Arc<WorkspaceDeclaration>,
    ) -> Result<Arc<WorkspaceClient>, ResolveError> {
        let dependencies = self.direct_dependencies(decl)?;

        let mut resolved = BTreeMap::new();
        for (name, dependency) in &dependencies {
            let client = self.ensure_workspace(dependency)?;
            resolved.insert(name.clone(), client);
        }

        let document = Document::new(decl.id.clone());
        let tables = Tables::new(&document, &decl.schema);
        let ctx = ExtensionContext {
            workspace_id: decl.id.clone(),
            document: document.clone(),
            tables: tables.clone(),
            schema: Arc::new(decl.schema.clone()),
        };
        let lifecycle = start(&ctx, &decl.extensions, &self.options.lifecycle)?;

        let actions = match &decl.actions {
            Some(factory) => factory(&WorkspaceContext {
                id: decl.id.clone(),
                document: document.clone(),
                tables: tables.clone(),
                extensions: lifecycle.exports.clone(),
                dependencies: resolved.clone(),
            }),
            None => Actions::default(),
        };

        let readiness = subtree_readiness(&decl.id, &resolved, lifecycle.readiness);
        let client = Arc::new(WorkspaceClient {
            id: decl.id.clone(),
            version: decl.version,
            name: decl.name.clone(),
            document,
            tables,
            exports: lifecycle.exports,
            actions,
            dependencies: resolved,
            readiness,
            teardown: Mutex::new(Some(lifecycle.teardown)),
        });

        self.registry
            .clients
            .insert(decl.id.clone(), Arc::clone(&client));
        self.registry.order.push(decl.id.clone());
        debug!(workspace = %decl.id, version = decl.version, "workspace constructed");
        Ok(client)
    }

    /// Validates `decl`'s direct dependencies against the registered
    /// winners and returns them keyed by declared name, collapsed by id.
    fn direct_dependencies(
        &self,
        decl: &WorkspaceDeclaration,
    ) -> Result<Vec<(String, Arc<WorkspaceDeclaration>)>, ResolveError> {
        let mut by_id: Vec<Arc<WorkspaceDeclaration>> = Vec::new();
        for dependency in &decl.dependencies {
            let winner = self.registry.winners.get(&dependency.id).ok_or_else(|| {
                ResolveError::MissingDependency {
                    dependent: decl.id.clone(),
                    missing: dependency.id.clone(),
                }
            })?;
            if !by_id.iter().any(|d| d.id == winner.id) {
                by_id.push(Arc::clone(winner));
            }
        }

        let mut names = HashSet::new();
        for dependency in &by_id {
            if !names.insert(dependency.name.as_str()) {
                return Err(ResolveError::DuplicateDependencyName {
                    dependent: decl.id.clone(),
                    name: dependency.name.clone(),
                });
            }
        }

        Ok(by_id.into_iter().map(|d| (d.name.clone(), d)).collect())
    }
}

/// Ready once every dependency subtree and then the workspace's own
/// extensions are ready.
fn subtree_readiness(
    id: &str,
    dependencies: &BTreeMap<String, Arc<WorkspaceClient>>,
    own: Readiness,
) -> Readiness {
    let id = id.to_string();
    let upstream: Vec<Readiness> = dependencies.values().map(|c| c.readiness()).collect();

    async move {
        try_join_all(upstream.into_iter().map(|readiness| {
            let id = id.clone();
            async move {
                readiness
                    .await
                    .map_err(|source| ReadinessError::Dependency {
                        workspace: id,
                        source: Box::new(source),
                    })
            }
        }))
        .await?;
        own.await
    }
    .boxed()
    .shared()
}

/// Resolves `root` and everything it depends on with default options.
pub fn initialize(root: &Arc<WorkspaceDeclaration>) -> Result<ResolvedWorkspace, ResolveError> {
    initialize_with(root, ResolveOptions::default())
}

/// Resolves `root` and everything it depends on.
///
/// The root and its listed dependencies are registered up front; every
/// workspace in the graph must be found among them.
pub fn initialize_with(
    root: &Arc<WorkspaceDeclaration>,
    options: ResolveOptions,
) -> Result<ResolvedWorkspace, ResolveError> {
    let mut resolver = Resolver::new(options);
    resolver.register(root);
    for dependency in &root.dependencies {
        resolver.register(dependency);
    }

    match resolver.ensure_workspace(root) {
        Ok(client) => {
            info!(
                workspace = %client.id(),
                workspaces = resolver.registry.order.len(),
                "workspace graph initialized"
            );
            Ok(ResolvedWorkspace {
                root: client,
                clients: resolver.clients(),
                superseded: std::mem::take(&mut resolver.registry.superseded),
            })
        }
        Err(e) => {
            warn!(workspace = %root.id, error = %e, "workspace graph failed to initialize");
            resolver.discard_all();
            Err(e)
        }
    }
}

/// The outcome of [`initialize`]: the root client and every client built for it.
#[derive(Debug)]
pub struct ResolvedWorkspace {
    root: Arc<WorkspaceClient>,
    clients: Vec<Arc<WorkspaceClient>>,
    superseded: Vec<Arc<WorkspaceClient>>,
}

impl ResolvedWorkspace {
    pub fn root(&self) -> &Arc<WorkspaceClient> {
        &self.root
    }

    pub fn client(&self, id: &str) -> Option<&Arc<WorkspaceClient>> {
        self.clients.iter().find(|c| c.id() == id)
    }

    /// Clients in construction order, dependencies before dependents.
    pub fn clients(&self) -> &[Arc<WorkspaceClient>] {
        &self.clients
    }

    pub async fn when_ready(&self) -> Result<(), ReadinessError> {
        self.root.when_ready().await
    }

    /// Tears down dependents before dependencies, then superseded clients.
    /// Never fails; problems are in the report.
    pub async fn destroy(self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for client in self.clients.iter().rev().chain(self.superseded.iter().rev()) {
            report.extend(client.destroy().await);
        }
        info!(
            workspaces = report.workspaces.len(),
            failures = report.failures.len(),
            "workspace graph destroyed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(id: &str, version: u32) -> WorkspaceDeclaration {
        WorkspaceDeclaration::new(id, version, id)
    }

    #[test]
    fn register_keeps_highest_version() {
        let mut resolver = Resolver::new(ResolveOptions::default());
        resolver.register(&Arc::new(decl("a", 2)));
        let winner = resolver.register(&Arc::new(decl("a", 1)));
        assert_eq!(winner.version, 2);

        let winner = resolver.register(&Arc::new(decl("a", 3)));
        assert_eq!(winner.version, 3);
    }

    #[test]
    fn in_progress_is_cleared_after_failure() {
        let mut resolver = Resolver::new(ResolveOptions::default());
        let missing = Arc::new(decl("ghost", 1));
        let a = Arc::new(decl("a", 1).depends_on(missing));

        assert!(matches!(
            resolver.ensure_workspace(&a),
            Err(ResolveError::MissingDependency { .. })
        ));
        assert!(resolver.registry.in_progress.is_empty());
        assert!(resolver.client("a").is_none());
    }

    #[test]
    fn duplicate_names_count_once_per_id() {
        let mut resolver = Resolver::new(ResolveOptions::default());
        let a1 = Arc::new(WorkspaceDeclaration::new("a", 1, "shared"));
        let a2 = Arc::new(WorkspaceDeclaration::new("a", 2, "shared"));
        resolver.register(&a1);
        resolver.register(&a2);
        let root = Arc::new(decl("root", 1).depends_on(a1).depends_on(a2));

        let client = resolver.ensure_workspace(&root).unwrap();
        assert_eq!(client.dependency("shared").unwrap().version(), 2);
    }
}
