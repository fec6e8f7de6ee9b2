//! Code-defined table schemas and row validation.
//!
//! Every table has an implicit `id` column holding a non-empty string.
//! Declared columns are typed; a row is valid when every declared column is
//! present with the right kind (or null/absent when nullable) and the row
//! carries no undeclared fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{Document, DocumentResult, Row};

/// Name of the implicit primary-key column.
pub const ID_COLUMN: &str = "id";

/// Document map that holds the committed, code-defined schema (one key per table).
pub const SCHEMA_MAP: &str = "__schema";

/// Value kinds a column may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    Boolean,
    /// Any JSON value, stored as serialized text by relational mirrors.
    Json,
}

impl ColumnKind {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ColumnKind::Text => value.is_string(),
            ColumnKind::Integer => value.is_i64() || value.is_u64(),
            // Integers are rejected so a stored value reads back unchanged.
            ColumnKind::Real => value.is_f64(),
            ColumnKind::Boolean => value.is_boolean(),
            ColumnKind::Json => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Text => "text",
            ColumnKind::Integer => "integer",
            ColumnKind::Real => "real",
            ColumnKind::Boolean => "boolean",
            ColumnKind::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    #[serde(default)]
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Schema of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns the row's id if it has a valid one.
    pub fn row_id(row: &Row) -> Option<&str> {
        row.get(ID_COLUMN)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Validates a row, returning every problem found.
    pub fn validate(&self, row: &Row) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if Self::row_id(row).is_none() {
            errors.push(format!("`{}` must be a non-empty string", ID_COLUMN));
        }

        for column in &self.columns {
            match row.get(&column.name) {
                None | Some(Value::Null) if column.nullable => {}
                None | Some(Value::Null) => {
                    errors.push(format!("`{}` is required", column.name));
                }
                Some(value) if !column.kind.accepts(value) => {
                    errors.push(format!(
                        "`{}` expected {}, got {}",
                        column.name,
                        column.kind.as_str(),
                        json_kind(value)
                    ));
                }
                Some(_) => {}
            }
        }

        for field in row.keys() {
            if field != ID_COLUMN && self.column(field).is_none() {
                errors.push(format!("`{}` is not a column of {}", field, self.name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "real",
        Value::Number(_) => "integer",
        Value::String(_) => "text",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Code-defined schema of a whole workspace. Tables keep declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSchema {
    pub tables: Vec<TableSchema>,
}

impl WorkspaceSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.tables.push(table);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }
}

/// Outcome of merging a code-defined schema into a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaMerge {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Writes `schema` into the document's [`SCHEMA_MAP`] in one transaction.
///
/// Missing tables are added, differing ones overwritten, identical ones left
/// untouched, so code always wins over whatever was loaded before.
pub fn merge_schema(doc: &Document, schema: &WorkspaceSchema) -> DocumentResult<SchemaMerge> {
    let encoded = schema
        .tables
        .iter()
        .map(|table| -> DocumentResult<(String, Value)> {
            Ok((table.name.clone(), serde_json::to_value(table)?))
        })
        .collect::<DocumentResult<Vec<_>>>()?;

    let merge = doc.transact(|txn| {
        let mut merge = SchemaMerge::default();
        for (name, value) in encoded {
            match txn.get(SCHEMA_MAP, &name) {
                None => merge.added.push(name.clone()),
                Some(existing) if existing != value => merge.updated.push(name.clone()),
                Some(_) => {
                    merge.unchanged.push(name);
                    continue;
                }
            }
            txn.set(SCHEMA_MAP, &name, value);
        }
        merge
    })?;

    debug!(
        document = %doc.id(),
        added = merge.added.len(),
        updated = merge.updated.len(),
        unchanged = merge.unchanged.len(),
        "schema merged"
    );
    Ok(merge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notes() -> TableSchema {
        TableSchema::new("notes")
            .with_column(ColumnSpec::new("title", ColumnKind::Text))
            .with_column(ColumnSpec::new("views", ColumnKind::Integer))
            .with_column(ColumnSpec::new("pinned", ColumnKind::Boolean).nullable())
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn valid_row_passes() {
        let result = notes().validate(&row(json!({ "id": "n1", "title": "t", "views": 3 })));
        assert!(result.is_ok());
    }

    #[test]
    fn invalid_row_reports_every_problem() {
        let errors = notes()
            .validate(&row(json!({ "title": 5, "extra": true })))
            .unwrap_err();

        assert_eq!(errors.len(), 4, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("`id`")));
        assert!(errors.iter().any(|e| e.contains("`title` expected text")));
        assert!(errors.iter().any(|e| e.contains("`views` is required")));
        assert!(errors.iter().any(|e| e.contains("`extra` is not a column")));
    }

    #[test]
    fn real_columns_take_only_floating_point_numbers() {
        assert!(ColumnKind::Real.accepts(&json!(2.5)));
        assert!(ColumnKind::Real.accepts(&json!(5.0)));
        assert!(!ColumnKind::Real.accepts(&json!(5)));
        assert!(!ColumnKind::Real.accepts(&json!("5.0")));
        assert!(ColumnKind::Integer.accepts(&json!(5)));
        assert!(!ColumnKind::Integer.accepts(&json!(5.0)));
    }

    #[test]
    fn nullable_column_accepts_null() {
        let result = notes().validate(&row(
            json!({ "id": "n1", "title": "t", "views": 1, "pinned": null }),
        ));
        assert!(result.is_ok());
    }

    #[test]
    fn integer_column_rejects_floats() {
        let errors = notes()
            .validate(&row(json!({ "id": "n1", "title": "t", "views": 1.5 })))
            .unwrap_err();
        assert_eq!(errors, vec!["`views` expected integer, got real".to_string()]);
    }

    #[test]
    fn merge_schema_adds_overwrites_and_skips_identical() {
        let doc = Document::new("doc");
        let stale = TableSchema::new("notes");
        doc.transact(|txn| {
            txn.set(SCHEMA_MAP, "notes", serde_json::to_value(&stale).unwrap());
            txn.set(
                SCHEMA_MAP,
                "tags",
                serde_json::to_value(TableSchema::new("tags")).unwrap(),
            );
        })
        .unwrap();

        let schema = WorkspaceSchema::new()
            .with_table(notes())
            .with_table(TableSchema::new("tags"))
            .with_table(TableSchema::new("links"));

        let merge = merge_schema(&doc, &schema).unwrap();
        assert_eq!(merge.added, vec!["links".to_string()]);
        assert_eq!(merge.updated, vec!["notes".to_string()]);
        assert_eq!(merge.unchanged, vec!["tags".to_string()]);

        let stored: TableSchema =
            serde_json::from_value(doc.get(SCHEMA_MAP, "notes").unwrap()).unwrap();
        assert_eq!(stored, notes());

        let again = merge_schema(&doc, &schema).unwrap();
        assert!(again.added.is_empty() && again.updated.is_empty());
    }
}
