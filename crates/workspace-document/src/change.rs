//! Change records emitted after a transaction commits.

use crate::Row;
use serde_json::Value;

/// What happened to a key (or row) in a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Add,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Add => "add",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }
}

/// A committed change to one key of one document map.
///
/// `value` is the post-commit value for `Add`/`Update` and `None` for `Delete`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyChange {
    pub key: String,
    pub action: ChangeAction,
    pub value: Option<Value>,
}

/// A committed change to one table row, as seen by table observers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub row_id: String,
    pub action: ChangeAction,
    /// Post-commit row for `Add`/`Update`. `None` for deletes, and for
    /// values that are not JSON objects.
    pub row: Option<Row>,
}

impl ChangeEvent {
    pub(crate) fn from_key_change(table: &str, change: &KeyChange) -> Self {
        Self {
            table: table.to_string(),
            row_id: change.key.clone(),
            action: change.action,
            row: change
                .value
                .as_ref()
                .and_then(|value| value.as_object().cloned()),
        }
    }
}
