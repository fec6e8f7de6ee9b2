//! Authored workspace definitions and their business actions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use extension_lifecycle::{ExtensionExports, ExtensionFactory};
use serde_json::Value;
use workspace_document::{Document, DocumentError, Tables, WorkspaceSchema};

use crate::WorkspaceClient;

/// Errors returned by business actions.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("unknown action: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// One business action: JSON in, JSON out.
pub type ActionFn = Arc<dyn Fn(Value) -> Result<Value, ActionError> + Send + Sync>;

/// Named business actions of a workspace.
#[derive(Clone, Default)]
pub struct Actions {
    actions: BTreeMap<String, ActionFn>,
}

impl Actions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(Value) -> Result<Value, ActionError> + Send + Sync + 'static,
    {
        self.actions.insert(name.into(), Arc::new(action));
        self
    }

    pub fn call(&self, name: &str, input: Value) -> Result<Value, ActionError> {
        let action = self
            .actions
            .get(name)
            .ok_or_else(|| ActionError::NotFound(name.to_string()))?;
        action(input)
    }

    pub fn names(&self) -> Vec<String> {
        self.actions.keys().cloned().collect()
    }
}

impl fmt::Debug for Actions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.actions.keys()).finish()
    }
}

/// What a business-action factory is given.
pub struct WorkspaceContext {
    pub id: String,
    pub document: Document,
    pub tables: Tables,
    /// Extension exports keyed by extension id.
    pub extensions: HashMap<String, ExtensionExports>,
    /// Dependency clients keyed by their declared name.
    pub dependencies: BTreeMap<String, Arc<WorkspaceClient>>,
}

/// Builds a workspace's business actions.
pub type ActionsFactory = Arc<dyn Fn(&WorkspaceContext) -> Actions + Send + Sync>;

/// An authored workspace: identity, schema, dependencies, extensions and
/// actions.
///
/// Several declarations may share an `id`; during resolution the one with
/// the highest `version` wins.
#[derive(Clone)]
pub struct WorkspaceDeclaration {
    pub id: String,
    pub version: u32,
    pub name: String,
    pub schema: WorkspaceSchema,
    pub dependencies: Vec<Arc<WorkspaceDeclaration>>,
    pub extensions: Vec<(String, ExtensionFactory)>,
    pub actions: Option<ActionsFactory>,
}

impl WorkspaceDeclaration {
    pub fn new(id: impl Into<String>, version: u32, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version,
            name: name.into(),
            schema: WorkspaceSchema::default(),
            dependencies: Vec::new(),
            extensions: Vec::new(),
            actions: None,
        }
    }

    pub fn with_schema(mut self, schema: WorkspaceSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn depends_on(mut self, dependency: Arc<WorkspaceDeclaration>) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_extension(mut self, id: impl Into<String>, factory: ExtensionFactory) -> Self {
        self.extensions.push((id.into(), factory));
        self
    }

    pub fn with_actions<F>(mut self, factory: F) -> Self
    where
        F: Fn(&WorkspaceContext) -> Actions + Send + Sync + 'static,
    {
        self.actions = Some(Arc::new(factory));
        self
    }
}

impl fmt::Debug for WorkspaceDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceDeclaration")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("name", &self.name)
            .field(
                "dependencies",
                &self
                    .dependencies
                    .iter()
                    .map(|d| format!("{}@{}", d.id, d.version))
                    .collect::<Vec<_>>(),
            )
            .field(
                "extensions",
                &self.extensions.iter().map(|(id, _)| id).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn actions_dispatch_by_name() {
        let actions = Actions::new().with("echo", Ok);

        assert_eq!(actions.call("echo", json!(1)).unwrap(), json!(1));
        assert!(matches!(
            actions.call("missing", json!(null)),
            Err(ActionError::NotFound(name)) if name == "missing"
        ));
        assert_eq!(actions.names(), vec!["echo".to_string()]);
    }
}
