//! # Workspace Resolver
//!
//! Turns a root [`WorkspaceDeclaration`] and its dependency graph into live
//! [`WorkspaceClient`]s.
//!
//! - Each workspace id is materialized at most once per resolution.
//! - When several declarations share an id, the highest version wins; a
//!   higher version arriving later invalidates the client already built.
//! - Dependencies are built before dependents, and a workspace is ready only
//!   when its whole subtree is ready.
//! - Cycles, missing dependencies and duplicate dependency names are
//!   configuration errors, reported before anything is retried.
//!
//! Dependencies are hoisted: the root lists every workspace the graph uses,
//! and nested declarations are resolved against that list.

mod client;
mod declaration;
mod resolver;

pub use client::WorkspaceClient;
pub use declaration::{
    ActionError, ActionFn, Actions, ActionsFactory, WorkspaceContext, WorkspaceDeclaration,
};
pub use resolver::{initialize, initialize_with, ResolveOptions, ResolvedWorkspace, Resolver};

use extension_lifecycle::LifecycleError;
use thiserror::Error;

/// Errors that can occur during workspace resolution.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("workspace {dependent} depends on {missing}, which the root does not provide")]
    MissingDependency { dependent: String, missing: String },

    #[error("workspace {dependent} has more than one dependency named {name}")]
    DuplicateDependencyName { dependent: String, name: String },

    #[error("circular dependency involving workspace {0}")]
    CircularDependency(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}
