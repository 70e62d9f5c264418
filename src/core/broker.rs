use crate::core::db;
use crate::core::error::ParleyError;
use crate::core::time;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The DB Broker is the single gateway to the warehouse file.
/// Access is serialized in-process; every operation leaves an audit line.
pub struct DbBroker {
    db_path: PathBuf,
    audit_log_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub target: String,
    pub status: String,
}

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            db_path: db::warehouse_db_path(root),
            audit_log_path: root.join("broker.events.jsonl"),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn audit_log_path(&self) -> &Path {
        &self.audit_log_path
    }

    /// Execute a closure with a serialized connection to the warehouse.
    ///
    /// Connection failures surface as `StorageUnavailable`; closure errors pass through.
    pub fn with_conn<F, R>(&self, actor: &str, op_name: &str, target: &str, f: F) -> Result<R, ParleyError>
    where
        F: FnOnce(&Connection) -> Result<R, ParleyError>,
    {
        static DB_LOCK: Mutex<()> = Mutex::new(());
        let _lock = DB_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let conn = db::db_connect(&self.db_path)?;
        let result = f(&conn);

        let status = if result.is_ok() { "success" } else { "error" };
        if let Err(e) = self.log_event(actor, op_name, target, status) {
            tracing::warn!(op = op_name, error = %e, "broker audit append failed");
        }

        result
    }

    fn log_event(&self, actor: &str, op: &str, target: &str, status: &str) -> Result<(), ParleyError> {
        use std::fs::OpenOptions;
        use std::io::Write;

        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            target: target.to_string(),
            status: status.to_string(),
        };
        let line = serde_json::to_string(&ev)
            .map_err(|e| ParleyError::ValidationError(format!("broker event: {}", e)))?;

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)?;
        writeln!(f, "{}", line)?;
        Ok(())
    }
}
