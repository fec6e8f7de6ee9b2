//! SQLite-backed mirror.
//!
//! Every mirrored table becomes a SQLite table with `id TEXT PRIMARY KEY`
//! plus one column per declared column. Column kinds map as follows:
//!
//! | kind    | SQLite  | stored as                 |
//! |---------|---------|---------------------------|
//! | text    | TEXT    | the string                |
//! | integer | INTEGER | i64                       |
//! | real    | REAL    | f64                       |
//! | boolean | INTEGER | 0 / 1                     |
//! | json    | TEXT    | serialized JSON           |
//!
//! `null` and absent values are stored as NULL and read back as absent
//! fields.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rusqlite::types::Value as SqlValue;
use serde_json::{Number, Value};
use tokio_rusqlite::Connection;
use tracing::{debug, info};
use workspace_document::{ColumnKind, ColumnSpec, Row, TableSchema, ID_COLUMN};

use crate::{MirrorError, MirrorResult, MirrorStore};

/// Convert a tokio_rusqlite::Error to MirrorError.
fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> MirrorError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => MirrorError::Sqlite(e),
        tokio_rusqlite::Error::ConnectionClosed => MirrorError::Closed,
        tokio_rusqlite::Error::Close(_) => MirrorError::Connection("Connection closed".to_string()),
        other => MirrorError::Connection(other.to_string()),
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Text | ColumnKind::Json => "TEXT",
        ColumnKind::Integer | ColumnKind::Boolean => "INTEGER",
        ColumnKind::Real => "REAL",
    }
}

fn create_table_sql(table: &TableSchema) -> String {
    let mut columns = vec![format!("{} TEXT PRIMARY KEY NOT NULL", quote(ID_COLUMN))];
    columns.extend(
        table
            .columns
            .iter()
            .map(|c| format!("{} {}", quote(&c.name), sql_type(c.kind))),
    );
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(&table.name),
        columns.join(", ")
    )
}

fn column_list(table: &TableSchema) -> String {
    std::iter::once(quote(ID_COLUMN))
        .chain(table.columns.iter().map(|c| quote(&c.name)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn invalid(table: &str, column: &str, reason: impl Into<String>) -> MirrorError {
    MirrorError::InvalidValue {
        table: table.to_string(),
        column: column.to_string(),
        reason: reason.into(),
    }
}

fn to_sql(table: &str, column: &ColumnSpec, value: Option<&Value>) -> MirrorResult<SqlValue> {
    let value = match value {
        None | Some(Value::Null) => return Ok(SqlValue::Null),
        Some(value) => value,
    };
    match (column.kind, value) {
        (ColumnKind::Text, Value::String(s)) => Ok(SqlValue::Text(s.clone())),
        (ColumnKind::Integer, Value::Number(n)) => n
            .as_i64()
            .map(SqlValue::Integer)
            .ok_or_else(|| invalid(table, &column.name, format!("{} is out of i64 range", n))),
        (ColumnKind::Real, Value::Number(n)) if n.is_f64() => n
            .as_f64()
            .map(SqlValue::Real)
            .ok_or_else(|| invalid(table, &column.name, format!("{} is not representable", n))),
        (ColumnKind::Boolean, Value::Bool(b)) => Ok(SqlValue::Integer(i64::from(*b))),
        (ColumnKind::Json, value) => Ok(SqlValue::Text(value.to_string())),
        (kind, other) => Err(invalid(
            table,
            &column.name,
            format!("expected {}, got {}", kind.as_str(), other),
        )),
    }
}

fn from_sql(table: &str, column: &ColumnSpec, value: SqlValue) -> MirrorResult<Option<Value>> {
    let decoded = match (column.kind, value) {
        (_, SqlValue::Null) => return Ok(None),
        (ColumnKind::Text, SqlValue::Text(s)) => Value::String(s),
        (ColumnKind::Integer, SqlValue::Integer(i)) => Value::Number(i.into()),
        (ColumnKind::Real, SqlValue::Real(f)) => Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| invalid(table, &column.name, format!("{} is not finite", f)))?,
        // Integral values written by other clients still read back as reals.
        (ColumnKind::Real, SqlValue::Integer(i)) => Number::from_f64(i as f64)
            .map(Value::Number)
            .ok_or_else(|| invalid(table, &column.name, format!("{} is not finite", i)))?,
        (ColumnKind::Boolean, SqlValue::Integer(i)) => Value::Bool(i != 0),
        (ColumnKind::Json, SqlValue::Text(s)) => serde_json::from_str(&s)
            .map_err(|e| invalid(table, &column.name, e.to_string()))?,
        (kind, other) => {
            return Err(invalid(
                table,
                &column.name,
                format!("cannot read {:?} as {}", other.data_type(), kind.as_str()),
            ))
        }
    };
    Ok(Some(decoded))
}

/// Mirror backed by a SQLite database on a dedicated executor thread.
#[derive(Clone)]
pub struct SqliteMirror {
    conn: Connection,
    path: String,
    tables: Arc<RwLock<HashMap<String, TableSchema>>>,
    closed: Arc<AtomicBool>,
}

impl SqliteMirror {
    /// Opens (creating if needed) the mirror database at `path`.
    pub async fn open(path: &Path) -> MirrorResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MirrorError::Connection(e.to_string()))?;
        }

        let path_str = path.to_string_lossy().to_string();
        info!(path = %path_str, "Opening SQLite mirror");

        let conn = Connection::open(&path_str)
            .await
            .map_err(|e| MirrorError::Connection(e.to_string()))?;

        conn.call(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        Ok(Self::from_connection(conn, path_str))
    }

    /// Opens a private in-memory mirror.
    pub async fn in_memory() -> MirrorResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| MirrorError::Connection(e.to_string()))?;
        Ok(Self::from_connection(conn, ":memory:".to_string()))
    }

    fn from_connection(conn: Connection, path: String) -> Self {
        Self {
            conn,
            path,
            tables: Arc::new(RwLock::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn table(&self, name: &str) -> MirrorResult<TableSchema> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MirrorError::Closed);
        }
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MirrorError::UnknownTable(name.to_string()))
    }

    /// Maps a row to `[id, col1, col2, ...]` in schema order.
    fn encode(schema: &TableSchema, id: &str, row: &Row) -> MirrorResult<Vec<SqlValue>> {
        let mut values = Vec::with_capacity(schema.columns.len() + 1);
        values.push(SqlValue::Text(id.to_string()));
        for column in &schema.columns {
            values.push(to_sql(&schema.name, column, row.get(&column.name))?);
        }
        Ok(values)
    }

    fn decode(schema: &TableSchema, raw: Vec<SqlValue>) -> MirrorResult<Row> {
        let mut values = raw.into_iter();
        let id = match values.next() {
            Some(SqlValue::Text(id)) => id,
            _ => return Err(invalid(&schema.name, ID_COLUMN, "id is not text")),
        };

        let mut row = Row::new();
        row.insert(ID_COLUMN.to_string(), Value::String(id));
        for (column, value) in schema.columns.iter().zip(values) {
            if let Some(value) = from_sql(&schema.name, column, value)? {
                row.insert(column.name.clone(), value);
            }
        }
        Ok(row)
    }
}

#[async_trait]
impl MirrorStore for SqliteMirror {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn ensure_schema(&self, tables: &[TableSchema]) -> MirrorResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MirrorError::Closed);
        }

        let owned = tables.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for table in &owned {
                    tx.execute_batch(&create_table_sql(table))?;

                    let existing: HashSet<String> = {
                        let mut stmt =
                            tx.prepare(&format!("PRAGMA table_info({})", quote(&table.name)))?;
                        let names = stmt
                            .query_map([], |row| row.get::<_, String>(1))?
                            .collect::<rusqlite::Result<HashSet<String>>>()?;
                        names
                    };
                    for column in &table.columns {
                        if !existing.contains(&column.name) {
                            tx.execute_batch(&format!(
                                "ALTER TABLE {} ADD COLUMN {} {}",
                                quote(&table.name),
                                quote(&column.name),
                                sql_type(column.kind)
                            ))?;
                        }
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_tokio_rusqlite)?;

        let mut known = self.tables.write();
        for table in tables {
            known.insert(table.name.clone(), table.clone());
        }
        debug!(path = %self.path, tables = tables.len(), "SQLite mirror schema ensured");
        Ok(())
    }

    async fn insert(&self, table: &str, row: &Row) -> MirrorResult<()> {
        let schema = self.table(table)?;
        let id = TableSchema::row_id(row).ok_or_else(|| invalid(table, ID_COLUMN, "missing id"))?;
        let values = Self::encode(&schema, id, row)?;
        let placeholders = (1..=values.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote(table),
            column_list(&schema),
            placeholders
        );

        self.conn
            .call(move |conn| {
                conn.execute(&sql, rusqlite::params_from_iter(values))?;
                Ok(())
            })
            .await
            .map_err(from_tokio_rusqlite)
    }

    async fn update(&self, table: &str, id: &str, row: &Row) -> MirrorResult<()> {
        let schema = self.table(table)?;
        let values = Self::encode(&schema, id, row)?;
        let assignments = if schema.columns.is_empty() {
            format!("{} = ?1", quote(ID_COLUMN))
        } else {
            schema
                .columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = ?{}", quote(&c.name), i + 2))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?1",
            quote(table),
            assignments,
            quote(ID_COLUMN)
        );

        let changed = self
            .conn
            .call(move |conn| Ok(conn.execute(&sql, rusqlite::params_from_iter(values))?))
            .await
            .map_err(from_tokio_rusqlite)?;

        if changed == 0 {
            return Err(MirrorError::RowNotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> MirrorResult<bool> {
        self.table(table)?;
        let sql = format!("DELETE FROM {} WHERE {} = ?1", quote(table), quote(ID_COLUMN));
        let id = id.to_string();

        let changed = self
            .conn
            .call(move |conn| Ok(conn.execute(&sql, [id])?))
            .await
            .map_err(from_tokio_rusqlite)?;
        Ok(changed > 0)
    }

    async fn select_all(&self, table: &str) -> MirrorResult<Vec<Row>> {
        let schema = self.table(table)?;
        let width = schema.columns.len() + 1;
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            column_list(&schema),
            quote(table),
            quote(ID_COLUMN)
        );

        let raw = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], |row| {
                        (0..width)
                            .map(|i| row.get::<_, SqlValue>(i))
                            .collect::<rusqlite::Result<Vec<_>>>()
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(from_tokio_rusqlite)?;

        raw.into_iter()
            .map(|values| Self::decode(&schema, values))
            .collect()
    }

    async fn delete_all(&self, table: &str) -> MirrorResult<usize> {
        self.table(table)?;
        let sql = format!("DELETE FROM {}", quote(table));

        self.conn
            .call(move |conn| Ok(conn.execute(&sql, [])?))
            .await
            .map_err(from_tokio_rusqlite)
    }

    async fn close(&self) -> MirrorResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.conn
            .clone()
            .close()
            .await
            .map_err(from_tokio_rusqlite)?;
        info!(path = %self.path, "SQLite mirror closed");
        Ok(())
    }
}
