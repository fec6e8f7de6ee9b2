//! Typed table accessors over the document.
//!
//! Each table is stored in the document map of the same name, keyed by row
//! id. Writes validate before touching the document; reads classify every
//! stored row as valid or invalid so callers can surface bad data.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::change::ChangeEvent;
use crate::document::{Document, Subscription, Transaction};
use crate::schema::{TableSchema, WorkspaceSchema, ID_COLUMN};
use crate::{DocumentError, DocumentResult, Row};

/// A stored row that fails validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidRow {
    pub id: String,
    pub errors: Vec<String>,
    pub value: Value,
}

/// Result of reading one row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowResult {
    Valid(Row),
    Invalid(InvalidRow),
    NotFound,
}

/// Accessor for one table of a workspace.
#[derive(Clone, Debug)]
pub struct TableHandle {
    doc: Document,
    schema: Arc<TableSchema>,
}

impl TableHandle {
    pub fn new(doc: &Document, schema: TableSchema) -> Self {
        doc.get_or_create_map(&schema.name);
        Self {
            doc: doc.clone(),
            schema: Arc::new(schema),
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Validates `row`, returning its id.
    pub fn check(&self, row: &Row) -> DocumentResult<String> {
        self.schema
            .validate(row)
            .map_err(|errors| DocumentError::InvalidRow {
                table: self.name().to_string(),
                id: TableSchema::row_id(row).unwrap_or_default().to_string(),
                errors,
            })?;
        Ok(TableSchema::row_id(row).unwrap_or_default().to_string())
    }

    /// Inserts or replaces a row in its own transaction.
    pub fn upsert(&self, row: Row) -> DocumentResult<()> {
        self.doc.transact(|txn| self.upsert_in(txn, row))?
    }

    /// Inserts or replaces a row inside an existing transaction.
    pub fn upsert_in(&self, txn: &mut Transaction<'_>, row: Row) -> DocumentResult<()> {
        let id = self.check(&row)?;
        txn.set(self.name(), &id, Value::Object(row));
        Ok(())
    }

    /// Merges `patch` into an existing row. All fields land in one
    /// transaction, so observers see a single update.
    ///
    /// Returns `false` when the row does not exist.
    pub fn update(&self, id: &str, patch: Row) -> DocumentResult<bool> {
        self.doc.transact(|txn| -> DocumentResult<bool> {
            let Some(Value::Object(mut merged)) = txn.get(self.name(), id) else {
                return Ok(false);
            };
            merged.extend(patch);
            merged.insert(ID_COLUMN.to_string(), Value::String(id.to_string()));
            self.check(&merged)?;
            txn.set(self.name(), id, Value::Object(merged));
            Ok(true)
        })?
    }

    pub fn delete(&self, id: &str) -> DocumentResult<bool> {
        self.doc.transact(|txn| self.delete_in(txn, id))
    }

    pub fn delete_in(&self, txn: &mut Transaction<'_>, id: &str) -> bool {
        txn.delete(self.name(), id)
    }

    /// Removes every row inside an existing transaction.
    pub fn clear_in(&self, txn: &mut Transaction<'_>) -> usize {
        txn.clear(self.name())
    }

    pub fn get(&self, id: &str) -> RowResult {
        match self.doc.get(self.name(), id) {
            Some(value) => self.classify(id, value),
            None => RowResult::NotFound,
        }
    }

    /// Every stored row, classified, ordered by id.
    pub fn get_all(&self) -> Vec<RowResult> {
        self.doc
            .entries(self.name())
            .into_iter()
            .map(|(id, value)| self.classify(&id, value))
            .collect()
    }

    pub fn get_all_valid(&self) -> Vec<Row> {
        self.partition().0
    }

    pub fn get_all_invalid(&self) -> Vec<InvalidRow> {
        self.partition().1
    }

    /// Splits the table into valid rows and invalid rows from one read.
    pub fn partition(&self) -> (Vec<Row>, Vec<InvalidRow>) {
        let mut valid = Vec::new();
        let mut invalid = Vec::new();
        for result in self.get_all() {
            match result {
                RowResult::Valid(row) => valid.push(row),
                RowResult::Invalid(row) => invalid.push(row),
                RowResult::NotFound => {}
            }
        }
        (valid, invalid)
    }

    pub fn count(&self) -> usize {
        self.doc.entries(self.name()).len()
    }

    /// Observes committed row changes of this table.
    pub fn observe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&[ChangeEvent]) + Send + Sync + 'static,
    {
        let table = self.name().to_string();
        self.doc.observe(self.name(), move |changes| {
            let events: Vec<ChangeEvent> = changes
                .iter()
                .map(|change| ChangeEvent::from_key_change(&table, change))
                .collect();
            handler(&events);
        })
    }

    /// Classifies a stored value. The stored key must match the row's id.
    pub fn classify(&self, key: &str, value: Value) -> RowResult {
        let errors = match value.as_object() {
            Some(row) => {
                let mut errors = self.schema.validate(row).err().unwrap_or_default();
                if let Some(id) = TableSchema::row_id(row) {
                    if id != key {
                        errors.push(format!("`{}` {} does not match key {}", ID_COLUMN, id, key));
                    }
                }
                errors
            }
            None => vec!["row is not an object".to_string()],
        };

        match value {
            Value::Object(row) if errors.is_empty() => RowResult::Valid(row),
            value => RowResult::Invalid(InvalidRow {
                id: key.to_string(),
                errors,
                value,
            }),
        }
    }
}

/// All table accessors of one workspace, in schema order.
#[derive(Clone, Debug, Default)]
pub struct Tables {
    tables: Vec<TableHandle>,
}

impl Tables {
    pub fn new(doc: &Document, schema: &WorkspaceSchema) -> Self {
        Self {
            tables: schema
                .tables
                .iter()
                .map(|table| TableHandle::new(doc, table.clone()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TableHandle> {
        self.tables.iter().find(|t| t.name() == name)
    }

    pub fn require(&self, name: &str) -> DocumentResult<&TableHandle> {
        self.get(name)
            .ok_or_else(|| DocumentError::UnknownTable(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableHandle> {
        self.tables.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
