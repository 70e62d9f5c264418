//! Default table schemas for everything parley writes.
//!
//! Source tables are owned upstream and never created here. Output tables are
//! auto-created on first write with these layouts; metric and flag columns are
//! added on demand because their set depends on each department's configuration.

pub const WAREHOUSE_DB_NAME: &str = "warehouse.db";

pub const DEFAULT_SUMMARY_TABLE: &str = "department_summary";
pub const FLAG_SUMMARY_TABLE: &str = "flag_summary";
pub const FLAG_DETAIL_TABLE: &str = "flag_detail";

/// Narrative metric columns hold this when their metric produced nothing.
pub const NARRATIVE_ZERO_STATE: &str = "N/A";

pub fn evaluator_output_schema(table: &str) -> String {
    format!(
        "
    CREATE TABLE IF NOT EXISTS {table} (
        id TEXT PRIMARY KEY,
        date TEXT NOT NULL,
        department TEXT NOT NULL,
        evaluator_name TEXT NOT NULL,
        conversation_id TEXT NOT NULL,
        segment_index INTEGER NOT NULL DEFAULT 0,
        last_skill TEXT,
        encoded_document TEXT NOT NULL,
        document_hash TEXT NOT NULL,
        token_estimate INTEGER NOT NULL DEFAULT 0,
        raw_model_text TEXT,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        completed_at TEXT,
        UNIQUE(date, department, evaluator_name, conversation_id, segment_index)
    )
"
    )
}

pub fn evaluator_output_index(table: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_partition ON {table}(date, department, evaluator_name, status)"
    )
}

/// Department summaries: one row per (date, department); metric columns are added later.
pub fn summary_schema(table: &str) -> String {
    format!(
        "
    CREATE TABLE IF NOT EXISTS {table} (
        date TEXT NOT NULL,
        department TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY(date, department)
    )
"
    )
}

pub fn flag_summary_schema(table: &str) -> String {
    format!(
        "
    CREATE TABLE IF NOT EXISTS {table} (
        date TEXT NOT NULL,
        department TEXT NOT NULL,
        total_conversations INTEGER NOT NULL DEFAULT 0,
        flagged_conversations INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        PRIMARY KEY(date, department)
    )
"
    )
}

pub fn flag_detail_schema(table: &str) -> String {
    format!(
        "
    CREATE TABLE IF NOT EXISTS {table} (
        date TEXT NOT NULL,
        department TEXT NOT NULL,
        conversation_id TEXT NOT NULL,
        overall TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY(date, department, conversation_id)
    )
"
    )
}

/// Default schema for a department's raw message table. Only tests and fixtures create it.
pub fn source_messages_schema(table: &str) -> String {
    format!(
        "
    CREATE TABLE IF NOT EXISTS {table} (
        conversation_id TEXT NOT NULL,
        sent_at TEXT NOT NULL,
        sender TEXT,
        skill TEXT,
        type TEXT,
        text TEXT,
        customer_id TEXT,
        agent_id TEXT
    )
"
    )
}
