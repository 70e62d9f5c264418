//! Flag aggregation: merge independent flag sources into a per-conversation flag
//! vector and a per-department summary.
//!
//! Status per (conversation, source):
//! - `NOT_APPLICABLE` when the department does not subscribe to the source
//! - `NOT_ASSESSED` when the source could not be read, or a row failed or did not parse
//! - `YES` when any successful row satisfies the predicate
//! - `NO` otherwise
//!
//! A conversation is flagged overall iff at least one source says `YES`.

use crate::core::config::{DepartmentProfile, FlagPredicate, FlagSource, Registry};
use crate::core::error::ParleyError;
use crate::core::schemas;
use crate::core::store::{ColumnValue, PartitionKey, Record, TableKind, UpsertStore, WriteOutcome};
use crate::core::time;
use crate::plugins::dispatch::{self, EvaluatorOutputRow, RowOutcome};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagStatus {
    Yes,
    No,
    NotAssessed,
    NotApplicable,
}

impl FlagStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FlagStatus::Yes => "YES",
            FlagStatus::No => "NO",
            FlagStatus::NotAssessed => "NOT_ASSESSED",
            FlagStatus::NotApplicable => "NOT_APPLICABLE",
        }
    }
}

/// Column holding a source's status (detail table) or YES count (summary table).
pub fn flag_column(source: &str) -> String {
    format!("flag_{}", source)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationFlags {
    pub conversation_id: String,
    pub statuses: BTreeMap<String, FlagStatus>,
    pub overall: FlagStatus,
}

impl ConversationFlags {
    pub fn status(&self, source: &str) -> Option<FlagStatus> {
        self.statuses.get(source).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagSummary {
    pub date: String,
    pub department: String,
    pub total_conversations: usize,
    pub flagged_conversations: usize,
    /// YES count per source; one conversation may count under several sources.
    pub per_source: BTreeMap<String, usize>,
    pub not_assessed: BTreeMap<String, usize>,
    pub writes: Vec<WriteOutcome>,
}

/// A predicate over one successful row. `Err` means the row could not be read.
pub fn predicate_holds(predicate: &FlagPredicate, pattern: Option<&Regex>, text: &str) -> Result<bool, String> {
    match predicate {
        FlagPredicate::Presence => Ok(true),
        FlagPredicate::BooleanTrue { field } => match serde_json::from_str::<Value>(text.trim()) {
            Ok(Value::Object(map)) => Ok(map.get(field).is_some_and(truthy)),
            Ok(other) => Ok(truthy(&other)),
            Err(_) => bare_bool(text).ok_or_else(|| format!("not a boolean answer: {}", text.trim())),
        },
        FlagPredicate::SentinelMatch { .. } => Ok(pattern.is_some_and(|re| re.is_match(text))),
        FlagPredicate::NestedThreshold { path, threshold } => {
            let value: Value = serde_json::from_str(text.trim()).map_err(|e| e.to_string())?;
            let mut cursor = &value;
            for part in path.split('.') {
                match cursor.get(part) {
                    Some(next) => cursor = next,
                    None => return Ok(false),
                }
            }
            let number = match cursor {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .ok_or_else(|| format!("non-numeric value at {}", path))?;
            Ok(number >= *threshold)
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => bare_bool(s).unwrap_or(false),
        _ => false,
    }
}

fn bare_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Status of one source for one conversation's rows.
pub fn source_status(
    predicate: &FlagPredicate,
    pattern: Option<&Regex>,
    rows: &[&EvaluatorOutputRow],
) -> FlagStatus {
    let mut unreadable = false;
    for row in rows {
        match (row.outcome(), row.raw_model_text.as_deref()) {
            (RowOutcome::Succeeded, Some(text)) => match predicate_holds(predicate, pattern, text) {
                Ok(true) => return FlagStatus::Yes,
                Ok(false) => {}
                Err(_) => unreadable = true,
            },
            _ => unreadable = true,
        }
    }
    if unreadable {
        FlagStatus::NotAssessed
    } else {
        FlagStatus::No
    }
}

/// Rows of one source, grouped by conversation. `None` if the source cannot be used.
type SourceRows = Option<BTreeMap<String, Vec<EvaluatorOutputRow>>>;

pub struct FlagAggregator<'a> {
    store: &'a UpsertStore,
    registry: &'a Registry,
}

impl<'a> FlagAggregator<'a> {
    pub fn new(store: &'a UpsertStore, registry: &'a Registry) -> Self {
        Self { store, registry }
    }

    fn load_source(&self, source: &FlagSource, date: &str, department: &str) -> SourceRows {
        match dispatch::read_outputs(
            self.store,
            &source.output_table,
            date,
            department,
            Some(&source.evaluator),
        ) {
            Ok(rows) => {
                let mut grouped: BTreeMap<String, Vec<EvaluatorOutputRow>> = BTreeMap::new();
                for row in rows {
                    grouped.entry(row.conversation_id.clone()).or_default().push(row);
                }
                Some(grouped)
            }
            Err(e) => {
                tracing::warn!(source = %source.name, department, error = %e, "flag source unreadable");
                None
            }
        }
    }

    /// Conversations evaluated for the department on `date`, across its evaluators.
    fn universe(&self, profile: &DepartmentProfile, date: &str) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for spec in &profile.evaluators {
            match dispatch::read_outputs(self.store, &spec.output_table, date, &profile.name, Some(&spec.name)) {
                Ok(rows) => ids.extend(rows.into_iter().map(|r| r.conversation_id)),
                Err(e) => {
                    tracing::warn!(evaluator = %spec.name, error = %e, "evaluator output unreadable")
                }
            }
        }
        ids
    }

    /// Flag vectors for every conversation of (date, department), without writing.
    pub fn evaluate(&self, profile: &DepartmentProfile, date: &str) -> Vec<ConversationFlags> {
        let mut conversations = self.universe(profile, date);
        let mut loaded: BTreeMap<&str, (SourceRows, Option<Regex>)> = BTreeMap::new();
        for source in self.registry.flag_sources() {
            if !profile.flag_applies(&source.name) {
                continue;
            }
            let rows = self.load_source(source, date, &profile.name);
            if let Some(rows) = &rows {
                conversations.extend(rows.keys().cloned());
            }
            let pattern = match &source.predicate {
                FlagPredicate::SentinelMatch { pattern } => Regex::new(pattern).ok(),
                _ => None,
            };
            loaded.insert(source.name.as_str(), (rows, pattern));
        }

        conversations
            .into_iter()
            .map(|conversation_id| {
                let statuses: BTreeMap<String, FlagStatus> = self
                    .registry
                    .flag_sources()
                    .iter()
                    .map(|source| {
                        let status = match loaded.get(source.name.as_str()) {
                            None => FlagStatus::NotApplicable,
                            Some((None, _)) => FlagStatus::NotAssessed,
                            Some((Some(_), None))
                                if matches!(source.predicate, FlagPredicate::SentinelMatch { .. }) =>
                            {
                                FlagStatus::NotAssessed
                            }
                            Some((Some(rows), pattern)) => {
                                let mine: Vec<&EvaluatorOutputRow> = rows
                                    .get(&conversation_id)
                                    .map(|r| r.iter().collect())
                                    .unwrap_or_default();
                                source_status(&source.predicate, pattern.as_ref(), &mine)
                            }
                        };
                        (source.name.clone(), status)
                    })
                    .collect();
                let overall = if statuses.values().any(|s| *s == FlagStatus::Yes) {
                    FlagStatus::Yes
                } else {
                    FlagStatus::No
                };
                ConversationFlags {
                    conversation_id,
                    statuses,
                    overall,
                }
            })
            .collect()
    }

    /// Evaluate, replace the detail rows, and upsert the summary row.
    pub fn aggregate(&self, profile: &DepartmentProfile, date: &str) -> Result<FlagSummary, ParleyError> {
        let flags = self.evaluate(profile, date);
        let sources = self.registry.flag_sources();

        let mut per_source: BTreeMap<String, usize> = BTreeMap::new();
        let mut not_assessed: BTreeMap<String, usize> = BTreeMap::new();
        for source in sources {
            let count = |wanted: FlagStatus| {
                flags
                    .iter()
                    .filter(|f| f.status(&source.name) == Some(wanted))
                    .count()
            };
            per_source.insert(source.name.clone(), count(FlagStatus::Yes));
            not_assessed.insert(source.name.clone(), count(FlagStatus::NotAssessed));
        }
        let flagged = flags.iter().filter(|f| f.overall == FlagStatus::Yes).count();

        let updated_at = time::now_epoch_z();
        let detail_rows: Vec<Record> = flags
            .iter()
            .map(|f| {
                let mut record: Record = vec![
                    ("date".to_string(), date.into()),
                    ("department".to_string(), profile.name.as_str().into()),
                    ("conversation_id".to_string(), f.conversation_id.as_str().into()),
                    ("overall".to_string(), f.overall.as_str().into()),
                    ("updated_at".to_string(), updated_at.as_str().into()),
                ];
                for (source, status) in &f.statuses {
                    record.push((flag_column(source), status.as_str().into()));
                }
                record
            })
            .collect();
        let detail = self.store.replace_partition(
            schemas::FLAG_DETAIL_TABLE,
            TableKind::FlagDetail,
            &PartitionKey::department(date, &profile.name).predicate(),
            &detail_rows,
        )?;

        let mut counts: Record = vec![
            ("total_conversations".to_string(), ColumnValue::Integer(flags.len() as i64)),
            ("flagged_conversations".to_string(), ColumnValue::Integer(flagged as i64)),
        ];
        for (source, yes) in &per_source {
            counts.push((flag_column(source), ColumnValue::Integer(*yes as i64)));
        }
        let summary = self.store.update_columns(
            schemas::FLAG_SUMMARY_TABLE,
            TableKind::FlagSummary,
            &PartitionKey::department(date, &profile.name),
            &counts,
        )?;

        tracing::info!(
            department = %profile.name,
            date,
            conversations = flags.len(),
            flagged,
            "flags aggregated"
        );
        Ok(FlagSummary {
            date: date.to_string(),
            department: profile.name.clone(),
            total_conversations: flags.len(),
            flagged_conversations: flagged,
            per_source,
            not_assessed,
            writes: vec![detail, summary],
        })
    }
}
