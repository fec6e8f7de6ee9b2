//! What an extension is made of, and what it is given.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use workspace_document::{Document, Tables, WorkspaceSchema};

use crate::ExtensionError;

/// Future resolved once an extension has finished its initial sync.
pub type SyncFuture = BoxFuture<'static, Result<(), ExtensionError>>;

/// Deferred teardown of one extension.
pub type DestroyFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), ExtensionError>> + Send>;

/// Builds an extension instance for one workspace. Runs synchronously.
pub type ExtensionFactory =
    Arc<dyn Fn(&ExtensionContext) -> Result<ExtensionInstance, ExtensionError> + Send + Sync>;

/// Wraps a closure as an [`ExtensionFactory`].
pub fn extension_factory<F>(f: F) -> ExtensionFactory
where
    F: Fn(&ExtensionContext) -> Result<ExtensionInstance, ExtensionError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Everything an extension factory may use.
#[derive(Clone, Debug)]
pub struct ExtensionContext {
    pub workspace_id: String,
    pub document: Document,
    pub tables: Tables,
    pub schema: Arc<WorkspaceSchema>,
}

/// Values an extension makes available to the workspace client, by key.
#[derive(Clone, Default)]
pub struct ExtensionExports {
    values: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ExtensionExports {
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: Arc<T>) {
        self.values.insert(key.into(), value);
    }

    /// Returns the export under `key` if it has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values
            .get(key)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for ExtensionExports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionExports")
            .field("keys", &self.keys())
            .finish()
    }
}

/// A live extension: its exports, its sync gate and its teardown.
///
/// Missing `when_synced` counts as already synced; missing `destroy` is a
/// no-op.
#[derive(Default)]
pub struct ExtensionInstance {
    pub(crate) exports: ExtensionExports,
    pub(crate) when_synced: Option<SyncFuture>,
    pub(crate) destroy: Option<DestroyFn>,
}

impl ExtensionInstance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_export<T: Any + Send + Sync>(mut self, key: impl Into<String>, value: Arc<T>) -> Self {
        self.exports.insert(key, value);
        self
    }

    pub fn with_when_synced<F>(mut self, when_synced: F) -> Self
    where
        F: Future<Output = Result<(), ExtensionError>> + Send + 'static,
    {
        self.when_synced = Some(when_synced.boxed());
        self
    }

    pub fn with_destroy<F, Fut>(mut self, destroy: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ExtensionError>> + Send + 'static,
    {
        self.destroy = Some(Box::new(move || destroy().boxed()));
        self
    }

    pub fn exports(&self) -> &ExtensionExports {
        &self.exports
    }
}

impl fmt::Debug for ExtensionInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionInstance")
            .field("exports", &self.exports)
            .field("when_synced", &self.when_synced.is_some())
            .field("destroy", &self.destroy.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_downcast_to_their_own_type_only() {
        let instance = ExtensionInstance::new().with_export("counter", Arc::new(7_u32));

        assert_eq!(instance.exports().get::<u32>("counter").as_deref(), Some(&7));
        assert!(instance.exports().get::<String>("counter").is_none());
        assert!(instance.exports().get::<u32>("missing").is_none());
        assert_eq!(instance.exports().keys(), vec!["counter".to_string()]);
    }
}
