//! A materialized workspace.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use extension_lifecycle::{ExtensionExports, Readiness, ReadinessError, Teardown, TeardownReport};
use serde_json::Value;
use workspace_document::{Document, TableHandle, Tables};

use crate::declaration::{ActionError, Actions};

/// A live workspace: document, tables, extension exports, actions and the
/// clients of its dependencies.
pub struct WorkspaceClient {
    pub(crate) id: String,
    pub(crate) version: u32,
    pub(crate) name: String,
    pub(crate) document: Document,
    pub(crate) tables: Tables,
    pub(crate) exports: HashMap<String, ExtensionExports>,
    pub(crate) actions: Actions,
    pub(crate) dependencies: BTreeMap<String, Arc<WorkspaceClient>>,
    pub(crate) readiness: Readiness,
    pub(crate) teardown: Mutex<Option<Teardown>>,
}

impl WorkspaceClient {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableHandle> {
        self.tables.get(name)
    }

    /// Exports of the extension `extension`.
    pub fn extension(&self, extension: &str) -> Option<&ExtensionExports> {
        self.exports.get(extension)
    }

    /// Export `key` of extension `extension`, if it has type `T`.
    pub fn export<T: Any + Send + Sync>(&self, extension: &str, key: &str) -> Option<Arc<T>> {
        self.exports.get(extension).and_then(|e| e.get::<T>(key))
    }

    pub fn actions(&self) -> &Actions {
        &self.actions
    }

    pub fn action(&self, name: &str, input: Value) -> Result<Value, ActionError> {
        self.actions.call(name, input)
    }

    /// Dependency client by declared name.
    pub fn dependency(&self, name: &str) -> Option<&Arc<WorkspaceClient>> {
        self.dependencies.get(name)
    }

    pub fn dependencies(&self) -> &BTreeMap<String, Arc<WorkspaceClient>> {
        &self.dependencies
    }

    /// Readiness of this workspace and its whole dependency subtree.
    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    pub async fn when_ready(&self) -> Result<(), ReadinessError> {
        self.readiness.clone().await
    }

    /// Tears down this workspace's extensions and document. Later calls
    /// return an empty report.
    pub async fn destroy(&self) -> TeardownReport {
        let teardown = self.teardown.lock().expect("lock poisoned").take();
        match teardown {
            Some(teardown) => teardown.run().await,
            None => TeardownReport::default(),
        }
    }

    /// Tears down without waiting. See [`Teardown::discard`].
    pub(crate) fn discard(&self) {
        if let Some(teardown) = self.teardown.lock().expect("lock poisoned").take() {
            teardown.discard();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.document.is_destroyed()
    }
}

impl fmt::Debug for WorkspaceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceClient")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("name", &self.name)
            .field("tables", &self.tables.names())
            .field("extensions", &self.exports.keys().collect::<Vec<_>>())
            .field("dependencies", &self.dependencies.keys().collect::<Vec<_>>())
            .finish()
    }
}
