//! Reads raw message rows from a department's source table.
//!
//! Source tables belong upstream and vary in shape. Absent optional columns are
//! selected as NULL and degrade to defaults, and numeric cells read as text. A
//! table without `conversation_id` or `sent_at` cannot be grouped and reads as empty.

use crate::core::db;
use crate::core::error::ParleyError;
use crate::core::message::{self, Conversation, Message, MessageType, SenderRole};
use crate::core::schemas;
use crate::core::store::{ColumnValue, UpsertStore};
use crate::core::time;
use chrono::NaiveDate;
use rusqlite::{Row, params};

const SOURCE_COLUMNS: [&str; 8] = [
    "conversation_id",
    "sent_at",
    "sender",
    "skill",
    "type",
    "text",
    "customer_id",
    "agent_id",
];

/// Rows read from a source table for one date window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceBatch {
    pub messages: Vec<Message>,
    /// Rows without a conversation id, or whose cells could not be read.
    pub skipped_rows: usize,
}

impl SourceBatch {
    pub fn into_conversations(self) -> Vec<Conversation> {
        message::group_conversations(self.messages)
    }
}

/// Cells are read by their stored type and rendered as text, so a numeric id
/// column reads the same as a TEXT one.
fn cell_text(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(ColumnValue::from(row.get_ref(idx)?).into_text())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn read_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let seq = row.get_ref(0)?.as_i64().unwrap_or(0);
    Ok(Message {
        conversation_id: cell_text(row, 1)?.map(|c| c.trim().to_string()).unwrap_or_default(),
        sent_at: time::normalize_timestamp(&cell_text(row, 2)?.unwrap_or_default()),
        sender_role: cell_text(row, 3)?
            .as_deref()
            .map(SenderRole::parse)
            .unwrap_or(SenderRole::System),
        skill: non_blank(cell_text(row, 4)?),
        message_type: cell_text(row, 5)?
            .as_deref()
            .map(MessageType::parse)
            .unwrap_or(MessageType::Normal),
        text: cell_text(row, 6)?.unwrap_or_default(),
        customer_id: non_blank(cell_text(row, 7)?),
        agent_id: non_blank(cell_text(row, 8)?),
        seq: seq.max(0) as u64,
    })
}

/// Messages whose `sent_at` date falls in `[start, end]`, in ingestion order.
///
/// Unreadable rows are skipped and counted; only table-level faults are errors.
pub fn load_batch(
    store: &UpsertStore,
    table: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<SourceBatch, ParleyError> {
    db::validate_identifier(table, "source table")?;
    store.with_read("source.load", table, |conn| {
        if !db::table_exists(conn, table)? {
            tracing::warn!(table, "source table missing; no messages loaded");
            return Ok(SourceBatch::default());
        }
        let present = db::table_columns(conn, table)?;
        let has = |c: &str| present.iter().any(|p| p.eq_ignore_ascii_case(c));
        if !has("conversation_id") || !has("sent_at") {
            tracing::warn!(table, "source table lacks conversation_id/sent_at; skipped");
            return Ok(SourceBatch::default());
        }

        let select = SOURCE_COLUMNS
            .iter()
            .map(|c| {
                if has(c) {
                    c.to_string()
                } else {
                    format!("NULL AS {}", c)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT rowid, {} FROM {} WHERE substr(sent_at, 1, 10) BETWEEN ?1 AND ?2 ORDER BY rowid",
            select, table
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![time::format_date(start), time::format_date(end)])?;

        let mut batch = SourceBatch::default();
        while let Some(row) = rows.next()? {
            match read_message(row) {
                Ok(m) if !m.conversation_id.is_empty() => batch.messages.push(m),
                Ok(_) => batch.skipped_rows += 1,
                Err(e) => {
                    tracing::debug!(table, error = %e, "unreadable source row skipped");
                    batch.skipped_rows += 1;
                }
            }
        }
        if batch.skipped_rows > 0 {
            tracing::warn!(table, skipped = batch.skipped_rows, "source rows skipped");
        }
        Ok(batch)
    })
}

pub fn load_messages(
    store: &UpsertStore,
    table: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<Message>, ParleyError> {
    Ok(load_batch(store, table, start, end)?.messages)
}

pub fn load_conversations(
    store: &UpsertStore,
    table: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<Conversation>, ParleyError> {
    Ok(load_batch(store, table, start, end)?.into_conversations())
}

/// Append messages to a source table, creating it with the default layout if absent.
pub fn append_messages(
    store: &UpsertStore,
    table: &str,
    messages: &[Message],
) -> Result<usize, ParleyError> {
    db::validate_identifier(table, "source table")?;
    store.with_read("source.append", table, |conn| {
        conn.execute(&schemas::source_messages_schema(table), [])?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (conversation_id, sent_at, sender, skill, type, text, customer_id, agent_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                table
            ))?;
            for m in messages {
                stmt.execute(params![
                    m.conversation_id,
                    m.sent_at,
                    m.sender_role.as_str(),
                    m.skill,
                    m.message_type.as_str(),
                    m.text,
                    m.customer_id,
                    m.agent_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(messages.len())
    })
}
