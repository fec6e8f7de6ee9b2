//! # Extension Lifecycle
//!
//! Wires a workspace's extensions to its document and decides when the
//! workspace is ready.
//!
//! 1. Factories run synchronously, in declaration order.
//! 2. Every extension's `when_synced` is joined fail-fast.
//! 3. Only then is the code-defined schema merged into the document, so
//!    loaded state can never overwrite it.
//! 4. Teardown runs every `destroy` best-effort, then destroys the document.

mod coordinator;
mod extension;

use std::time::Duration;

pub use coordinator::{
    start, Lifecycle, LifecycleOptions, Readiness, Teardown, TeardownFailure, TeardownReport,
    DEFAULT_READINESS_TIMEOUT,
};
pub use extension::{
    extension_factory, DestroyFn, ExtensionContext, ExtensionExports, ExtensionFactory,
    ExtensionInstance, SyncFuture,
};

/// Errors raised by an extension itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtensionError {
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("sync failed: {0}")]
    Sync(String),

    #[error("teardown failed: {0}")]
    Teardown(String),
}

/// Configuration errors detected while wiring extensions. Fatal, never retried.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("workspace {workspace} declares extension {extension} more than once")]
    DuplicateExtensionId { workspace: String, extension: String },

    #[error("extension {extension} of workspace {workspace} failed to start: {source}")]
    ExtensionSetup {
        workspace: String,
        extension: String,
        #[source]
        source: ExtensionError,
    },
}

/// Why a workspace never became ready.
///
/// Cloned to every awaiter of the shared readiness future.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadinessError {
    #[error("extension {extension} of workspace {workspace} failed to sync: {message}")]
    Extension {
        workspace: String,
        extension: String,
        message: String,
    },

    #[error("workspace {workspace} was not ready after {after:?}")]
    TimedOut { workspace: String, after: Duration },

    #[error("schema of workspace {workspace} could not be applied: {message}")]
    Schema { workspace: String, message: String },

    #[error("dependency of workspace {workspace} failed: {source}")]
    Dependency {
        workspace: String,
        #[source]
        source: Box<ReadinessError>,
    },
}

impl ReadinessError {
    /// The innermost error, following `Dependency` wrappers.
    pub fn root_cause(&self) -> &ReadinessError {
        match self {
            ReadinessError::Dependency { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
