//! Dependency graph resolution rules.
//!
//! Every test wires extension factories that record what ran, then asserts on
//! the recording.

use std::sync::{Arc, Mutex};

use extension_lifecycle::{extension_factory, ExtensionError, ExtensionInstance, ReadinessError};
use futures_util::FutureExt;
use serde_json::json;
use tokio::sync::oneshot;
use workspace_document::{ColumnKind, ColumnSpec, TableSchema, WorkspaceSchema, SCHEMA_MAP};
use workspace_resolver::{
    initialize, Actions, ResolveError, ResolveOptions, Resolver, WorkspaceDeclaration,
};

type Log = Arc<Mutex<Vec<String>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// A declaration whose only extension records `label` when it starts and
/// `destroy:label` when it is torn down.
fn traced(id: &str, version: u32, label: &str, log: &Log) -> WorkspaceDeclaration {
    let started = Arc::clone(log);
    let label = label.to_string();
    WorkspaceDeclaration::new(id, version, id).with_extension(
        "trace",
        extension_factory(move |_| {
            started.lock().unwrap().push(label.clone());
            let destroyed = Arc::clone(&started);
            let label = label.clone();
            Ok(ExtensionInstance::new().with_destroy(move || async move {
                destroyed.lock().unwrap().push(format!("destroy:{}", label));
                Ok(())
            }))
        }),
    )
}

#[test]
fn dependencies_are_built_first_and_shared_ones_once() {
    let log = log();
    let c = Arc::new(traced("c", 1, "c", &log));
    let a = Arc::new(traced("a", 1, "a", &log).depends_on(Arc::clone(&c)));
    let b = Arc::new(traced("b", 1, "b", &log).depends_on(Arc::clone(&c)));
    let root = Arc::new(
        traced("root", 1, "root", &log)
            .depends_on(a)
            .depends_on(b)
            .depends_on(c),
    );

    let resolved = initialize(&root).unwrap();

    assert_eq!(entries(&log), vec!["c", "a", "b", "root"]);
    let ids: Vec<&str> = resolved.clients().iter().map(|c| c.id()).collect();
    assert_eq!(ids, vec!["c", "a", "b", "root"]);
    assert!(Arc::ptr_eq(
        resolved.client("a").unwrap().dependency("c").unwrap(),
        resolved.client("b").unwrap().dependency("c").unwrap(),
    ));
}

#[test]
fn highest_version_wins_and_losers_never_run() {
    let log = log();
    let v1 = Arc::new(traced("lib", 1, "lib@1", &log));
    let v3 = Arc::new(traced("lib", 3, "lib@3", &log));
    let root = Arc::new(
        WorkspaceDeclaration::new("root", 1, "root")
            .depends_on(v1)
            .depends_on(v3),
    );

    let resolved = initialize(&root).unwrap();

    assert_eq!(entries(&log), vec!["lib@3"]);
    assert_eq!(resolved.client("lib").unwrap().version(), 3);
    assert_eq!(resolved.root().dependencies().len(), 1);
}

#[test]
fn ensure_workspace_is_idempotent() {
    let log = log();
    let a = Arc::new(traced("a", 1, "a", &log));
    let mut resolver = Resolver::new(ResolveOptions::default());

    let first = resolver.ensure_workspace(&a).unwrap();
    let second = resolver.ensure_workspace(&a).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(entries(&log), vec!["a"]);
}

#[tokio::test]
async fn higher_version_invalidates_existing_client() {
    let log = log();
    let mut resolver = Resolver::new(ResolveOptions::default());

    let old = resolver
        .ensure_workspace(&Arc::new(traced("a", 1, "a@1", &log)))
        .unwrap();
    let new = resolver
        .ensure_workspace(&Arc::new(traced("a", 2, "a@2", &log)))
        .unwrap();

    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(new.version(), 2);
    assert_eq!(resolver.clients().len(), 1);
    assert_eq!(entries(&log), vec!["a@1", "a@2"]);

    old.destroy().await;
    assert!(old.is_destroyed());
    assert!(!new.is_destroyed());
}

#[test]
fn cycle_is_reported_naming_the_workspace() {
    let placeholder_a = Arc::new(WorkspaceDeclaration::new("a", 1, "a"));
    let b = Arc::new(WorkspaceDeclaration::new("b", 1, "b").depends_on(placeholder_a));
    let a = Arc::new(WorkspaceDeclaration::new("a", 1, "a").depends_on(Arc::clone(&b)));

    let err = initialize(&a).unwrap_err();

    assert!(matches!(err, ResolveError::CircularDependency(id) if id == "a"));
}

#[test]
fn unlisted_transitive_dependency_is_missing() {
    let deep = Arc::new(WorkspaceDeclaration::new("deep", 1, "deep"));
    let mid = Arc::new(WorkspaceDeclaration::new("mid", 1, "mid").depends_on(deep));
    let root = Arc::new(WorkspaceDeclaration::new("root", 1, "root").depends_on(mid));

    let err = initialize(&root).unwrap_err();

    assert!(matches!(
        err,
        ResolveError::MissingDependency { dependent, missing } if dependent == "mid" && missing == "deep"
    ));
}

#[test]
fn two_dependencies_with_one_name_are_rejected() {
    let x = Arc::new(WorkspaceDeclaration::new("x", 1, "storage"));
    let y = Arc::new(WorkspaceDeclaration::new("y", 1, "storage"));
    let root = Arc::new(
        WorkspaceDeclaration::new("root", 1, "root")
            .depends_on(x)
            .depends_on(y),
    );

    let err = initialize(&root).unwrap_err();

    assert!(matches!(
        err,
        ResolveError::DuplicateDependencyName { name, .. } if name == "storage"
    ));
}

#[test]
fn duplicate_extension_ids_fail_resolution() {
    let factory = extension_factory(|_| Ok(ExtensionInstance::new()));
    let root = Arc::new(
        WorkspaceDeclaration::new("root", 1, "root")
            .with_extension("dup", factory.clone())
            .with_extension("dup", factory),
    );

    assert!(matches!(
        initialize(&root).unwrap_err(),
        ResolveError::Lifecycle(_)
    ));
}

fn gated(id: &str, rx: oneshot::Receiver<Result<(), ExtensionError>>) -> WorkspaceDeclaration {
    let rx = Arc::new(Mutex::new(Some(rx)));
    WorkspaceDeclaration::new(id, 1, id)
        .with_schema(WorkspaceSchema::new().with_table(
            TableSchema::new("items").with_column(ColumnSpec::new("label", ColumnKind::Text)),
        ))
        .with_extension(
            "gate",
            extension_factory(move |_| {
                let rx = rx.lock().unwrap().take().expect("built once");
                Ok(ExtensionInstance::new().with_when_synced(async move {
                    rx.await
                        .unwrap_or_else(|_| Err(ExtensionError::Sync("dropped".into())))
                }))
            }),
        )
}

#[tokio::test]
async fn root_waits_for_dependency_extensions() {
    let (tx, rx) = oneshot::channel();
    let dep = Arc::new(gated("dep", rx));
    let root = Arc::new(WorkspaceDeclaration::new("root", 1, "root").depends_on(dep));
    let resolved = initialize(&root).unwrap();

    tokio::task::yield_now().await;
    assert!(resolved.root().readiness().now_or_never().is_none());
    assert!(resolved
        .client("dep")
        .unwrap()
        .document()
        .get(SCHEMA_MAP, "items")
        .is_none());

    tx.send(Ok(())).unwrap();
    resolved.when_ready().await.unwrap();
    assert!(resolved
        .client("dep")
        .unwrap()
        .document()
        .get(SCHEMA_MAP, "items")
        .is_some());
}

#[tokio::test]
async fn dependency_failure_is_wrapped_with_the_dependent() {
    let (tx, rx) = oneshot::channel();
    let dep = Arc::new(gated("dep", rx));
    let root = Arc::new(WorkspaceDeclaration::new("root", 1, "root").depends_on(dep));
    let resolved = initialize(&root).unwrap();

    tx.send(Err(ExtensionError::Sync("disk full".into()))).unwrap();
    let err = resolved.when_ready().await.unwrap_err();

    match &err {
        ReadinessError::Dependency { workspace, .. } => assert_eq!(workspace, "root"),
        other => panic!("expected dependency error, got {:?}", other),
    }
    assert!(matches!(
        err.root_cause(),
        ReadinessError::Extension { workspace, extension, .. } if workspace == "dep" && extension == "gate"
    ));
}

#[tokio::test]
async fn destroy_tears_down_dependents_first() {
    let log = log();
    let base = Arc::new(traced("base", 1, "base", &log));
    let mid = Arc::new(traced("mid", 1, "mid", &log).depends_on(Arc::clone(&base)));
    let root = Arc::new(
        traced("root", 1, "root", &log)
            .depends_on(mid)
            .depends_on(base),
    );
    let resolved = initialize(&root).unwrap();
    resolved.when_ready().await.unwrap();
    log.lock().unwrap().clear();

    let report = resolved.destroy().await;

    assert_eq!(
        entries(&log),
        vec!["destroy:root", "destroy:mid", "destroy:base"]
    );
    assert_eq!(report.workspaces, vec!["root", "mid", "base"]);
    assert!(report.is_clean());
}

#[test]
fn actions_see_dependencies_by_declared_name() {
    let tags = Arc::new(
        WorkspaceDeclaration::new("tags-ws", 1, "tags")
            .with_actions(|_| Actions::new().with("count", |_| Ok(json!(3)))),
    );
    let root = Arc::new(
        WorkspaceDeclaration::new("root", 1, "root")
            .depends_on(tags)
            .with_actions(|ctx| {
                let tags = Arc::clone(&ctx.dependencies["tags"]);
                Actions::new().with("tag_count", move |input| tags.action("count", input))
            }),
    );

    let resolved = initialize(&root).unwrap();

    assert_eq!(
        resolved.root().action("tag_count", json!(null)).unwrap(),
        json!(3)
    );
}
