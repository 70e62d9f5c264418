//! Upsert store: the idempotent writer behind every parley output table.
//!
//! Rows are keyed by (date, department) or (date, department, conversation). Two write
//! modes exist:
//! - `replace_partition`: cleanup-then-insert of every row matching a key predicate
//! - `update_columns`: column-level partial update of a single keyed row
//!
//! Missing tables are created with their default schema before the write. Any fault
//! after that is returned as `WriteOutcome::Failed`; only connectivity faults escape
//! as `Err`.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::ParleyError;
use crate::core::schemas;
use crate::core::time;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, ToSql, params_from_iter};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const ACTOR: &str = "parley";

/// Scalar cell value for dynamic-column tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl ColumnValue {
    fn sql_type(&self) -> &'static str {
        match self {
            ColumnValue::Null => "",
            ColumnValue::Integer(_) => "INTEGER",
            ColumnValue::Real(_) => "REAL",
            ColumnValue::Text(_) => "TEXT",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ColumnValue::Integer(v) => Some(*v as f64),
            ColumnValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Textual rendering of any non-null value, e.g. an INTEGER id as `"101"`.
    pub fn into_text(self) -> Option<String> {
        match self {
            ColumnValue::Null => None,
            ColumnValue::Integer(v) => Some(v.to_string()),
            ColumnValue::Real(v) => Some(v.to_string()),
            ColumnValue::Text(s) => Some(s),
        }
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::Text(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        ColumnValue::Text(value)
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::Integer(value)
    }
}

impl From<f64> for ColumnValue {
    fn from(value: f64) -> Self {
        ColumnValue::Real(value)
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ColumnValue::Null)
    }
}

impl ToSql for ColumnValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            ColumnValue::Null => ToSqlOutput::Owned(Value::Null),
            ColumnValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            ColumnValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            ColumnValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl From<ValueRef<'_>> for ColumnValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => ColumnValue::Null,
            ValueRef::Integer(v) => ColumnValue::Integer(v),
            ValueRef::Real(v) => ColumnValue::Real(v),
            ValueRef::Text(t) => ColumnValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => ColumnValue::Text(String::from_utf8_lossy(b).into_owned()),
        }
    }
}

/// One row to write: column name to value, column order is insertion order.
pub type Record = Vec<(String, ColumnValue)>;

/// A row read back from a table.
pub type RowMap = BTreeMap<String, ColumnValue>;

/// Default-schema family used when a table must be auto-created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    EvaluatorOutput,
    Summary,
    FlagSummary,
    FlagDetail,
}

impl TableKind {
    fn create_statements(self, table: &str) -> Vec<String> {
        match self {
            TableKind::EvaluatorOutput => vec![
                schemas::evaluator_output_schema(table),
                schemas::evaluator_output_index(table),
            ],
            TableKind::Summary => vec![schemas::summary_schema(table)],
            TableKind::FlagSummary => vec![schemas::flag_summary_schema(table)],
            TableKind::FlagDetail => vec![schemas::flag_detail_schema(table)],
        }
    }
}

/// Idempotency key of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionKey {
    Department {
        date: String,
        department: String,
    },
    Conversation {
        date: String,
        department: String,
        conversation_id: String,
    },
}

impl PartitionKey {
    pub fn department(date: &str, department: &str) -> Self {
        PartitionKey::Department {
            date: date.to_string(),
            department: department.to_string(),
        }
    }

    pub fn conversation(date: &str, department: &str, conversation_id: &str) -> Self {
        PartitionKey::Conversation {
            date: date.to_string(),
            department: department.to_string(),
            conversation_id: conversation_id.to_string(),
        }
    }

    pub fn predicate(&self) -> Record {
        match self {
            PartitionKey::Department { date, department } => vec![
                ("date".to_string(), date.as_str().into()),
                ("department".to_string(), department.as_str().into()),
            ],
            PartitionKey::Conversation {
                date,
                department,
                conversation_id,
            } => vec![
                ("date".to_string(), date.as_str().into()),
                ("department".to_string(), department.as_str().into()),
                ("conversation_id".to_string(), conversation_id.as_str().into()),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteOutcome {
    Written { rows: usize },
    Failed { reason: String },
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }
}

pub struct UpsertStore {
    root: PathBuf,
    broker: DbBroker,
}

impl UpsertStore {
    /// Open (creating if needed) the warehouse under `root` and check connectivity.
    pub fn open(root: &Path) -> Result<Self, ParleyError> {
        fs::create_dir_all(root)?;
        let store = Self {
            root: root.to_path_buf(),
            broker: DbBroker::new(root),
        };
        store.broker.with_conn(ACTOR, "store.open", "-", |_| Ok(()))?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn broker(&self) -> &DbBroker {
        &self.broker
    }

    /// Run a read-only closure. Errors propagate unchanged.
    pub fn with_read<F, R>(&self, op: &str, table: &str, f: F) -> Result<R, ParleyError>
    where
        F: FnOnce(&Connection) -> Result<R, ParleyError>,
    {
        self.broker.with_conn(ACTOR, op, table, f)
    }

    /// Run a mutating closure, downgrading non-connectivity faults to `Failed`.
    pub fn with_write<F>(&self, op: &str, table: &str, f: F) -> Result<WriteOutcome, ParleyError>
    where
        F: FnOnce(&Connection) -> Result<usize, ParleyError>,
    {
        match self.broker.with_conn(ACTOR, op, table, f) {
            Ok(rows) => Ok(WriteOutcome::Written { rows }),
            Err(e) if e.is_terminal() => Err(e),
            Err(e) => {
                tracing::warn!(op, table, error = %e, "write failed");
                Ok(WriteOutcome::Failed {
                    reason: e.to_string(),
                })
            }
        }
    }

    pub fn ensure_table(&self, table: &str, kind: TableKind) -> Result<WriteOutcome, ParleyError> {
        self.with_write("store.ensure_table", table, |conn| {
            create_if_missing(conn, table, kind)?;
            Ok(0)
        })
    }

    /// Delete every row matching `predicate`, then insert `rows`.
    pub fn replace_partition(
        &self,
        table: &str,
        kind: TableKind,
        predicate: &Record,
        rows: &[Record],
    ) -> Result<WriteOutcome, ParleyError> {
        self.with_write("store.replace_partition", table, |conn| {
            create_if_missing(conn, table, kind)?;
            for row in rows {
                ensure_record_columns(conn, table, row)?;
            }
            let tx = conn.unchecked_transaction()?;
            let (where_sql, where_params) = where_clause(predicate)?;
            let deleted = tx.execute(
                &format!("DELETE FROM {} WHERE {}", table, where_sql),
                params_from_iter(where_params.iter()),
            )?;
            for row in rows {
                insert_record(&tx, table, row)?;
            }
            tx.commit()?;
            tracing::debug!(table, deleted, inserted = rows.len(), "partition replaced");
            Ok(rows.len())
        })
    }

    /// Set `values` on the row identified by `key`, creating the row first if absent.
    pub fn update_columns(
        &self,
        table: &str,
        kind: TableKind,
        key: &PartitionKey,
        values: &Record,
    ) -> Result<WriteOutcome, ParleyError> {
        self.with_write("store.update_columns", table, |conn| {
            create_if_missing(conn, table, kind)?;
            ensure_record_columns(conn, table, values)?;

            let predicate = key.predicate();
            let (where_sql, where_params) = where_clause(&predicate)?;
            let exists: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE {}", table, where_sql),
                params_from_iter(where_params.iter()),
                |row| row.get(0),
            )?;
            let now = time::now_epoch_z();
            let has_updated_at = db::table_columns(conn, table)?
                .iter()
                .any(|c| c == "updated_at");

            if exists == 0 {
                let mut base = predicate.clone();
                if has_updated_at {
                    base.push(("updated_at".to_string(), now.as_str().into()));
                }
                insert_record(conn, table, &base)?;
            }

            let mut assignments: Record = values.clone();
            if has_updated_at {
                assignments.push(("updated_at".to_string(), now.into()));
            }
            if assignments.is_empty() {
                return Ok(0);
            }
            let set_sql = assignments
                .iter()
                .enumerate()
                .map(|(i, (name, _))| format!("{} = ?{}", name, i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let offset = assignments.len();
            let where_sql = predicate
                .iter()
                .enumerate()
                .map(|(i, (name, _))| format!("{} = ?{}", name, offset + i + 1))
                .collect::<Vec<_>>()
                .join(" AND ");
            let params = assignments
                .iter()
                .map(|(_, v)| v)
                .chain(predicate.iter().map(|(_, v)| v));
            let updated = conn.execute(
                &format!("UPDATE {} SET {} WHERE {}", table, set_sql, where_sql),
                params_from_iter(params),
            )?;
            Ok(updated)
        })
    }

    /// Read every row matching `predicate`. A missing table reads as empty.
    pub fn read_rows(&self, table: &str, predicate: &Record) -> Result<Vec<RowMap>, ParleyError> {
        db::validate_identifier(table, "table name")?;
        self.with_read("store.read_rows", table, |conn| {
            if !db::table_exists(conn, table)? {
                return Ok(Vec::new());
            }
            let (where_sql, where_params) = where_clause(predicate)?;
            let sql = if predicate.is_empty() {
                format!("SELECT * FROM {}", table)
            } else {
                format!("SELECT * FROM {} WHERE {}", table, where_sql)
            };
            let mut stmt = conn.prepare(&sql)?;
            let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let rows = stmt
                .query_map(params_from_iter(where_params.iter()), |row| {
                    let mut out = RowMap::new();
                    for (i, name) in names.iter().enumerate() {
                        out.insert(name.clone(), ColumnValue::from(row.get_ref(i)?));
                    }
                    Ok(out)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn create_if_missing(conn: &Connection, table: &str, kind: TableKind) -> Result<(), ParleyError> {
    db::validate_identifier(table, "table name")?;
    if db::table_exists(conn, table)? {
        return Ok(());
    }
    tracing::info!(table, ?kind, "creating missing table with default schema");
    for stmt in kind.create_statements(table) {
        conn.execute(&stmt, [])?;
    }
    Ok(())
}

fn ensure_record_columns(conn: &Connection, table: &str, record: &Record) -> Result<(), ParleyError> {
    let wanted: Vec<(String, &'static str)> = record
        .iter()
        .map(|(name, value)| (name.clone(), value.sql_type()))
        .collect();
    db::ensure_columns(conn, table, &wanted)?;
    Ok(())
}

fn where_clause(predicate: &Record) -> Result<(String, Vec<ColumnValue>), ParleyError> {
    let mut parts = Vec::with_capacity(predicate.len());
    let mut params = Vec::with_capacity(predicate.len());
    for (i, (name, value)) in predicate.iter().enumerate() {
        db::validate_identifier(name, "column name")?;
        parts.push(format!("{} = ?{}", name, i + 1));
        params.push(value.clone());
    }
    if parts.is_empty() {
        parts.push("1 = 1".to_string());
    }
    Ok((parts.join(" AND "), params))
}

fn insert_record(conn: &Connection, table: &str, record: &Record) -> Result<(), ParleyError> {
    let names = record
        .iter()
        .map(|(name, _)| {
            db::validate_identifier(name, "column name")?;
            Ok(name.as_str())
        })
        .collect::<Result<Vec<_>, ParleyError>>()?;
    let placeholders = (1..=names.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            names.join(", "),
            placeholders
        ),
        params_from_iter(record.iter().map(|(_, v)| v)),
    )?;
    Ok(())
}
