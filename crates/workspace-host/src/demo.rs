//! Bundled workspaces: `tags`, and `notes` which depends on it.

use std::sync::Arc;

use extension_lifecycle::ExtensionFactory;
use serde_json::{json, Value};
use workspace_document::{ColumnKind, ColumnSpec, RowResult, TableSchema, WorkspaceSchema};
use workspace_resolver::{ActionError, Actions, WorkspaceDeclaration};

pub const TAGS: &str = "tags";
pub const NOTES: &str = "notes";

/// Extension id of the mirror synchronizer in every bundled workspace.
pub const MIRROR_EXTENSION: &str = "mirror";

fn tags_schema() -> WorkspaceSchema {
    WorkspaceSchema::new().with_table(
        TableSchema::new("tags")
            .with_column(ColumnSpec::new("label", ColumnKind::Text))
            .with_column(ColumnSpec::new("color", ColumnKind::Text).nullable()),
    )
}

fn notes_schema() -> WorkspaceSchema {
    WorkspaceSchema::new().with_table(
        TableSchema::new("notes")
            .with_column(ColumnSpec::new("title", ColumnKind::Text))
            .with_column(ColumnSpec::new("body", ColumnKind::Text).nullable())
            .with_column(ColumnSpec::new("pinned", ColumnKind::Boolean).nullable())
            .with_column(ColumnSpec::new("tags", ColumnKind::Json).nullable()),
    )
}

fn required_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ActionError> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::InvalidInput(format!("missing string field {}", field)))
}

pub fn tags_workspace(mirror: Option<ExtensionFactory>) -> WorkspaceDeclaration {
    let decl = WorkspaceDeclaration::new(TAGS, 1, "tags")
        .with_schema(tags_schema())
        .with_actions(|ctx| {
            let count_table = ctx.tables.get("tags").cloned();
            let find_table = count_table.clone();
            Actions::new()
                .with("count", move |_| {
                    Ok(json!(count_table.as_ref().map_or(0, |t| t.get_all_valid().len())))
                })
                .with("find_by_label", move |input| {
                    let label = required_str(&input, "label")?;
                    let found = find_table.as_ref().and_then(|t| {
                        t.get_all_valid()
                            .into_iter()
                            .find(|row| row.get("label").and_then(Value::as_str) == Some(label))
                    });
                    Ok(found.map(Value::Object).unwrap_or(Value::Null))
                })
        });

    match mirror {
        Some(factory) => decl.with_extension(MIRROR_EXTENSION, factory),
        None => decl,
    }
}

pub fn notes_workspace(
    tags: Arc<WorkspaceDeclaration>,
    mirror: Option<ExtensionFactory>,
) -> WorkspaceDeclaration {
    let decl = WorkspaceDeclaration::new(NOTES, 1, "notes")
        .with_schema(notes_schema())
        .depends_on(tags)
        .with_actions(|ctx| {
            let notes = ctx.tables.get("notes").cloned();
            let tags = ctx
                .dependencies
                .get("tags")
                .and_then(|client| client.table("tags").cloned());

            // Attaches an existing tag to a note; tag ids are kept unique.
            Actions::new().with("tag_note", move |input| {
                let note_id = required_str(&input, "note_id")?;
                let tag_id = required_str(&input, "tag_id")?;
                let (notes, tags) = notes
                    .as_ref()
                    .zip(tags.as_ref())
                    .ok_or_else(|| ActionError::InvalidInput("tables unavailable".to_string()))?;

                if !matches!(tags.get(tag_id), RowResult::Valid(_)) {
                    return Err(ActionError::InvalidInput(format!("no tag {}", tag_id)));
                }
                let mut note = match notes.get(note_id) {
                    RowResult::Valid(row) => row,
                    _ => return Err(ActionError::InvalidInput(format!("no note {}", note_id))),
                };

                let mut attached: Vec<Value> = note
                    .get("tags")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                if !attached.iter().any(|t| t.as_str() == Some(tag_id)) {
                    attached.push(json!(tag_id));
                }
                note.insert("tags".to_string(), Value::Array(attached));
                notes.upsert(note.clone())?;
                Ok(Value::Object(note))
            })
        });

    match mirror {
        Some(factory) => decl.with_extension(MIRROR_EXTENSION, factory),
        None => decl,
    }
}
