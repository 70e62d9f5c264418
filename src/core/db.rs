use crate::core::error::ParleyError;
use crate::core::schemas;
use regex::Regex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

pub fn db_connect(db_path: &Path) -> Result<Connection, ParleyError> {
    let unavailable = |source: rusqlite::Error| ParleyError::StorageUnavailable {
        path: db_path.to_path_buf(),
        source,
    };
    let conn = Connection::open(db_path).map_err(unavailable)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(unavailable)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(unavailable)?;
    Ok(conn)
}

pub fn warehouse_db_path(root: &Path) -> PathBuf {
    root.join(schemas::WAREHOUSE_DB_NAME)
}

/// Table and column names are interpolated into SQL, so only plain identifiers pass.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

pub fn validate_identifier(name: &str, what: &str) -> Result<(), ParleyError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(ParleyError::ValidationError(format!(
            "invalid {} '{}': expected [A-Za-z_][A-Za-z0-9_]*",
            what, name
        )))
    }
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, ParleyError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, ParleyError> {
    validate_identifier(table, "table name")?;
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Add any of `columns` the table lacks. Returns the names that were added.
pub fn ensure_columns(
    conn: &Connection,
    table: &str,
    columns: &[(String, &'static str)],
) -> Result<Vec<String>, ParleyError> {
    let existing = table_columns(conn, table)?;
    let mut added = Vec::new();
    for (name, sql_type) in columns {
        validate_identifier(name, "column name")?;
        if existing.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            continue;
        }
        conn.execute(
            &format!("ALTER TABLE {} ADD COLUMN {} {}", table, name, sql_type),
            [],
        )?;
        added.push(name.clone());
    }
    Ok(added)
}
