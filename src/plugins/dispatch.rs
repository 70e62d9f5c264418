//! Evaluation dispatcher: stages documents as pending output rows, asks the judge,
//! and completes each row exactly once.
//!
//! One batched invocation is made per (department, evaluator, date). If the batch
//! call faults, every row is retried once on its own with the same instructions.
//! A row-level fault completes the row with a `[parley_judge error]` sentinel, so it
//! reads as failed downstream instead of staying pending.

use crate::core::config::{DepartmentProfile, EvaluatorSpec};
use crate::core::error::ParleyError;
use crate::core::store::{ColumnValue, Record, RowMap, TableKind, UpsertStore, WriteOutcome};
use crate::core::time;
use crate::plugins::encode::{self, Document};
use regex::Regex;
use rusqlite::params;
use serde::Serialize;
use std::sync::LazyLock;

pub const INHERITED_INSTRUCTIONS_TOKEN: &str = "{{inherited_instructions}}";
pub const CURRENT_SKILL_TOKEN: &str = "{{current_skill}}";
pub const JUDGE_ERROR_PREFIX: &str = "[parley_judge error]";

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_COMPLETED: &str = "completed";

/// Judge providers report faults in-band as e.g. `[openai_chat error] ...`.
static PROVIDER_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[[A-Za-z0-9_\- ]+ error\]").expect("static regex"));

/// Whether completed model text represents a failed evaluation.
pub fn is_failed_output(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || PROVIDER_ERROR.is_match(trimmed)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JudgeRequest {
    pub document_text: String,
    pub instructions: String,
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// The LLM judge capability.
pub trait Judge: Send + Sync {
    fn invoke(&self, request: &JudgeRequest) -> Result<String, ParleyError>;

    /// Table-wide projection. Must return one text per request, in order.
    fn invoke_batch(&self, requests: &[JudgeRequest]) -> Result<Vec<String>, ParleyError> {
        requests.iter().map(|r| self.invoke(r)).collect()
    }
}

/// Substitute the per-conversation placeholders. Absent values become empty strings.
pub fn render_instructions(template: &str, inherited: Option<&str>, skill: Option<&str>) -> String {
    template
        .replace(INHERITED_INSTRUCTIONS_TOKEN, inherited.unwrap_or_default())
        .replace(CURRENT_SKILL_TOKEN, skill.unwrap_or_default())
}

/// Resolve an evaluator's instructions for one document's last-observed skill.
pub fn instructions_for(
    profile: &DepartmentProfile,
    spec: &EvaluatorSpec,
    last_skill: Option<&str>,
) -> String {
    let inherited = last_skill
        .and_then(|s| profile.upstream_instructions.get(s))
        .map(String::as_str);
    render_instructions(spec.template_for(last_skill), inherited, last_skill)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOutcome {
    Pending,
    Succeeded,
    Failed,
}

/// One row of an evaluator output table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluatorOutputRow {
    pub id: String,
    pub date: String,
    pub department: String,
    pub evaluator_name: String,
    pub conversation_id: String,
    pub segment_index: i64,
    pub last_skill: Option<String>,
    pub raw_model_text: Option<String>,
    pub status: String,
}

impl EvaluatorOutputRow {
    fn from_row(row: &RowMap) -> Self {
        let text = |k: &str| row.get(k).and_then(ColumnValue::as_str).map(str::to_string);
        Self {
            id: text("id").unwrap_or_default(),
            date: text("date").unwrap_or_default(),
            department: text("department").unwrap_or_default(),
            evaluator_name: text("evaluator_name").unwrap_or_default(),
            conversation_id: text("conversation_id").unwrap_or_default(),
            segment_index: row
                .get("segment_index")
                .and_then(ColumnValue::as_f64)
                .map(|v| v as i64)
                .unwrap_or(0),
            last_skill: text("last_skill"),
            raw_model_text: text("raw_model_text"),
            status: text("status").unwrap_or_else(|| STATUS_PENDING.to_string()),
        }
    }

    pub fn outcome(&self) -> RowOutcome {
        if self.status != STATUS_COMPLETED {
            return RowOutcome::Pending;
        }
        match self.raw_model_text.as_deref() {
            Some(text) if !is_failed_output(text) => RowOutcome::Succeeded,
            _ => RowOutcome::Failed,
        }
    }
}

/// Output rows for (date, department), optionally narrowed to one evaluator.
pub fn read_outputs(
    store: &UpsertStore,
    table: &str,
    date: &str,
    department: &str,
    evaluator: Option<&str>,
) -> Result<Vec<EvaluatorOutputRow>, ParleyError> {
    let mut predicate: Record = vec![
        ("date".to_string(), date.into()),
        ("department".to_string(), department.into()),
    ];
    if let Some(name) = evaluator {
        predicate.push(("evaluator_name".to_string(), name.into()));
    }
    let mut rows: Vec<EvaluatorOutputRow> = store
        .read_rows(table, &predicate)?
        .iter()
        .map(EvaluatorOutputRow::from_row)
        .collect();
    rows.sort_by(|a, b| {
        a.conversation_id
            .cmp(&b.conversation_id)
            .then(a.segment_index.cmp(&b.segment_index))
    });
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchSummary {
    pub evaluator: String,
    pub output_table: String,
    pub staged: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Judge answers whose completion write failed.
    pub uncommitted: usize,
    pub batch_fallback: bool,
    pub writes: Vec<WriteOutcome>,
}

impl DispatchSummary {
    fn new(spec: &EvaluatorSpec) -> Self {
        Self {
            evaluator: spec.name.clone(),
            output_table: spec.output_table.clone(),
            staged: 0,
            completed: 0,
            succeeded: 0,
            failed: 0,
            uncommitted: 0,
            batch_fallback: false,
            writes: Vec::new(),
        }
    }
}

struct StagedRow {
    id: String,
    request: JudgeRequest,
}

pub struct Dispatcher<'a> {
    store: &'a UpsertStore,
    judge: &'a dyn Judge,
}

impl<'a> Dispatcher<'a> {
    pub fn new(store: &'a UpsertStore, judge: &'a dyn Judge) -> Self {
        Self { store, judge }
    }

    /// Replace this evaluator's rows for (date, department) with `documents` and evaluate them.
    pub fn dispatch(
        &self,
        date: &str,
        profile: &DepartmentProfile,
        spec: &EvaluatorSpec,
        documents: &[Document],
    ) -> Result<DispatchSummary, ParleyError> {
        let mut summary = DispatchSummary::new(spec);
        let created_at = time::now_epoch_z();

        let mut staged = Vec::with_capacity(documents.len());
        let mut records = Vec::with_capacity(documents.len());
        for doc in documents {
            let id = time::new_event_id();
            let text = doc.text();
            let record: Record = vec![
                ("id".to_string(), id.as_str().into()),
                ("date".to_string(), date.into()),
                ("department".to_string(), profile.name.as_str().into()),
                ("evaluator_name".to_string(), spec.name.as_str().into()),
                ("conversation_id".to_string(), doc.conversation_id.as_str().into()),
                ("segment_index".to_string(), i64::from(doc.segment_index).into()),
                ("last_skill".to_string(), doc.last_skill.clone().into()),
                ("encoded_document".to_string(), text.as_str().into()),
                ("document_hash".to_string(), doc.hash().into()),
                (
                    "token_estimate".to_string(),
                    (encode::estimate_tokens(&text) as i64).into(),
                ),
                ("raw_model_text".to_string(), ColumnValue::Null),
                ("status".to_string(), STATUS_PENDING.into()),
                ("created_at".to_string(), created_at.as_str().into()),
            ];
            records.push(record);
            staged.push(StagedRow {
                id,
                request: JudgeRequest {
                    instructions: instructions_for(profile, spec, doc.last_skill.as_deref()),
                    document_text: text,
                    model_name: spec.model.clone(),
                    temperature: spec.decoding.temperature,
                    max_tokens: spec.decoding.max_tokens,
                },
            });
        }

        let predicate: Record = vec![
            ("date".to_string(), date.into()),
            ("department".to_string(), profile.name.as_str().into()),
            ("evaluator_name".to_string(), spec.name.as_str().into()),
        ];
        let staging = self.store.replace_partition(
            &spec.output_table,
            TableKind::EvaluatorOutput,
            &predicate,
            &records,
        )?;
        let staged_ok = staging.is_written();
        summary.writes.push(staging);
        if !staged_ok || staged.is_empty() {
            return Ok(summary);
        }
        summary.staged = staged.len();

        let texts = self.evaluate(&staged, &mut summary);
        let completion = self.complete(&spec.output_table, &staged, &texts)?;
        match &completion {
            WriteOutcome::Written { rows } => {
                summary.completed = *rows;
                for text in &texts {
                    if is_failed_output(text) {
                        summary.failed += 1;
                    } else {
                        summary.succeeded += 1;
                    }
                }
            }
            WriteOutcome::Failed { reason } => {
                summary.uncommitted = texts.len();
                tracing::warn!(
                    department = %profile.name,
                    evaluator = %spec.name,
                    date,
                    reason = %reason,
                    "judge answers not committed; rows stay pending"
                );
            }
        }
        summary.writes.push(completion);

        tracing::info!(
            department = %profile.name,
            evaluator = %spec.name,
            date,
            staged = summary.staged,
            succeeded = summary.succeeded,
            failed = summary.failed,
            fallback = summary.batch_fallback,
            "evaluator dispatched"
        );
        Ok(summary)
    }

    fn evaluate(&self, staged: &[StagedRow], summary: &mut DispatchSummary) -> Vec<String> {
        let requests: Vec<JudgeRequest> = staged.iter().map(|s| s.request.clone()).collect();
        match self.judge.invoke_batch(&requests) {
            Ok(texts) if texts.len() == requests.len() => return texts,
            Ok(texts) => tracing::warn!(
                evaluator = %summary.evaluator,
                expected = requests.len(),
                got = texts.len(),
                "batch returned wrong row count; falling back to row-by-row"
            ),
            Err(e) => tracing::warn!(
                evaluator = %summary.evaluator,
                error = %e,
                "batch invocation failed; falling back to row-by-row"
            ),
        }
        summary.batch_fallback = true;
        requests
            .iter()
            .map(|r| match self.judge.invoke(r) {
                Ok(text) => text,
                Err(e) => format!("{} {}", JUDGE_ERROR_PREFIX, e),
            })
            .collect()
    }

    /// pending -> completed, guarded so a row is never completed twice.
    fn complete(
        &self,
        table: &str,
        staged: &[StagedRow],
        texts: &[String],
    ) -> Result<WriteOutcome, ParleyError> {
        let completed_at = time::now_epoch_z();
        self.store.with_write("dispatch.complete", table, |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut updated = 0;
            {
                let mut stmt = tx.prepare(&format!(
                    "UPDATE {} SET raw_model_text = ?1, status = ?2, completed_at = ?3 WHERE id = ?4 AND status = ?5",
                    table
                ))?;
                for (row, text) in staged.iter().zip(texts) {
                    updated += stmt.execute(params![
                        text,
                        STATUS_COMPLETED,
                        completed_at,
                        row.id,
                        STATUS_PENDING
                    ])?;
                }
            }
            tx.commit()?;
            Ok(updated)
        })
    }
}
