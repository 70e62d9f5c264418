use rusqlite;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Judge invocation failed: {0}")]
    JudgeError(String),
    #[error("Metric '{name}' failed: {reason}")]
    MetricError { name: String, reason: String },
    #[error("Storage unavailable at {}: {source}", path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
}

impl ParleyError {
    /// Connectivity faults are the only storage errors that escape a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ParleyError::StorageUnavailable { .. })
    }
}
