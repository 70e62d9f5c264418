//! Metric engine: ordered, dependency-gated, fault-isolated department metrics.
//!
//! Each configured metric definition names a metric in a `MetricRegistry` (its
//! `metric` field, or its own name) and the summary columns it fills. One metric
//! may back several definitions; a column belongs to exactly one definition. Definitions run in ascending `order`. A definition
//! whose required evaluators are not configured is skipped, and a definition
//! whose metric errors or panics is failed; both null only their own columns.
//! Nulls are materialized when the summary row is written: numeric columns get
//! 0, narrative columns get `N/A`.

use crate::core::config::{ColumnKind, ColumnSpec, DepartmentProfile, MetricDefinitionConfig, Registry};
use crate::core::error::ParleyError;
use crate::core::output;
use crate::core::schemas;
use crate::core::store::{ColumnValue, PartitionKey, Record, TableKind, UpsertStore, WriteOutcome};
use crate::plugins::dispatch::{self, EvaluatorOutputRow, RowOutcome};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Null,
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    fn materialize(&self, kind: ColumnKind) -> ColumnValue {
        match (self, kind) {
            (MetricValue::Number(v), _) => ColumnValue::Real(*v),
            (MetricValue::Text(s), _) => ColumnValue::Text(s.clone()),
            (MetricValue::Null, ColumnKind::Numeric) => ColumnValue::Real(0.0),
            (MetricValue::Null, ColumnKind::Narrative) => {
                ColumnValue::Text(schemas::NARRATIVE_ZERO_STATE.to_string())
            }
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Number(value)
    }
}

impl From<usize> for MetricValue {
    fn from(value: usize) -> Self {
        MetricValue::Number(value as f64)
    }
}

impl<T: Into<MetricValue>> From<Option<T>> for MetricValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(MetricValue::Null)
    }
}

/// What a metric computes.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricResult {
    /// Fills the first output column; the rest are nulled.
    Single(MetricValue),
    /// Zipped positionally onto the output columns.
    Tuple(Vec<MetricValue>),
    /// Keyed by department; the running department's entry is zipped.
    Mapping(BTreeMap<String, Vec<MetricValue>>),
}

/// Everything a metric may read for one (date, department).
pub struct MetricContext<'a> {
    pub date: &'a str,
    pub department: &'a DepartmentProfile,
    pub registry: &'a Registry,
    pub store: &'a UpsertStore,
    /// Evaluators in scope: the definition's requirements, or all configured ones.
    pub evaluators: Vec<String>,
}

impl MetricContext<'_> {
    /// Evaluator name to output table, for the evaluators in scope.
    pub fn evaluator_tables(&self) -> BTreeMap<String, String> {
        self.department
            .evaluators
            .iter()
            .filter(|e| self.evaluators.contains(&e.name))
            .map(|e| (e.name.clone(), e.output_table.clone()))
            .collect()
    }

    /// Output rows of every in-scope evaluator for this date and department.
    pub fn outputs(&self) -> Result<Vec<EvaluatorOutputRow>, ParleyError> {
        outputs_for(self.store, self.department, self.date, &self.evaluators)
    }
}

fn outputs_for(
    store: &UpsertStore,
    department: &DepartmentProfile,
    date: &str,
    evaluators: &[String],
) -> Result<Vec<EvaluatorOutputRow>, ParleyError> {
    let mut rows = Vec::new();
    for spec in department
        .evaluators
        .iter()
        .filter(|e| evaluators.contains(&e.name))
    {
        rows.extend(dispatch::read_outputs(
            store,
            &spec.output_table,
            date,
            &department.name,
            Some(&spec.name),
        )?);
    }
    Ok(rows)
}

pub trait Metric: Send + Sync {
    fn compute(&self, ctx: &MetricContext<'_>) -> Result<MetricResult, ParleyError>;
}

/// Metric name to implementation. Resolution is by explicit lookup.
pub struct MetricRegistry {
    metrics: BTreeMap<String, Box<dyn Metric>>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl MetricRegistry {
    pub fn empty() -> Self {
        Self {
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("evaluation_volume", EvaluationVolume);
        registry.register("judge_success_rate", JudgeSuccessRate);
        registry.register("mean_score", MeanScore);
        registry.register("coverage_by_department", CoverageByDepartment);
        registry.register("summary_excerpt", SummaryExcerpt);
        registry
    }

    pub fn register<M: Metric + 'static>(&mut self, name: &str, metric: M) {
        self.metrics.insert(name.to_string(), Box::new(metric));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Metric> {
        self.metrics.get(name).map(|m| m.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.metrics.keys().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Computed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricOutcome {
    pub name: String,
    pub status: MetricStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub values: Vec<(String, MetricValue)>,
}

impl MetricOutcome {
    pub fn value(&self, column: &str) -> Option<&MetricValue> {
        self.values.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub outcomes: Vec<MetricOutcome>,
    pub write: WriteOutcome,
}

impl MetricsReport {
    pub fn count(&self, status: MetricStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn outcome(&self, name: &str) -> Option<&MetricOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

pub struct MetricEngine<'a> {
    metrics: &'a MetricRegistry,
}

impl<'a> MetricEngine<'a> {
    pub fn new(metrics: &'a MetricRegistry) -> Self {
        Self { metrics }
    }

    /// Compute every configured metric and upsert the department summary row.
    pub fn run(
        &self,
        store: &UpsertStore,
        registry: &Registry,
        department: &DepartmentProfile,
        date: &str,
    ) -> Result<MetricsReport, ParleyError> {
        let outcomes = self.compute_all(store, registry, department, date);

        let mut record: Record = Vec::new();
        for definition in &department.metrics {
            let Some(outcome) = outcomes.iter().find(|o| o.name == definition.name) else {
                continue;
            };
            for column in &definition.columns {
                let value = outcome
                    .value(column.name())
                    .cloned()
                    .unwrap_or(MetricValue::Null)
                    .materialize(column.kind());
                record.push((column.name().to_string(), value));
            }
        }

        let write = store.update_columns(
            &department.summary_table,
            TableKind::Summary,
            &PartitionKey::department(date, &department.name),
            &record,
        )?;
        tracing::info!(
            department = %department.name,
            date,
            computed = outcomes.iter().filter(|o| o.status == MetricStatus::Computed).count(),
            skipped = outcomes.iter().filter(|o| o.status == MetricStatus::Skipped).count(),
            failed = outcomes.iter().filter(|o| o.status == MetricStatus::Failed).count(),
            "metrics computed"
        );
        Ok(MetricsReport { outcomes, write })
    }

    /// Compute without writing. Outcomes are in execution order.
    pub fn compute_all(
        &self,
        store: &UpsertStore,
        registry: &Registry,
        department: &DepartmentProfile,
        date: &str,
    ) -> Vec<MetricOutcome> {
        let mut definitions: Vec<&MetricDefinitionConfig> = department.metrics.iter().collect();
        definitions.sort_by_key(|d| d.order);

        let configured: BTreeSet<&str> = department.evaluators.iter().map(|e| e.name.as_str()).collect();
        definitions
            .into_iter()
            .map(|definition| {
                let missing: Vec<&str> = definition
                    .requires
                    .iter()
                    .map(String::as_str)
                    .filter(|r| !configured.contains(r))
                    .collect();
                if !missing.is_empty() {
                    tracing::debug!(
                        metric = %definition.name,
                        missing = ?missing,
                        "metric skipped; required evaluators not configured"
                    );
                    return null_outcome(
                        definition,
                        MetricStatus::Skipped,
                        format!("missing evaluators: {}", missing.join(", ")),
                    );
                }
                let evaluators = if definition.requires.is_empty() {
                    configured.iter().map(|s| s.to_string()).collect()
                } else {
                    definition.requires.clone()
                };
                let ctx = MetricContext {
                    date,
                    department,
                    registry,
                    store,
                    evaluators,
                };
                match self.compute_one(definition, &ctx) {
                    Ok(result) => MetricOutcome {
                        name: definition.name.clone(),
                        status: MetricStatus::Computed,
                        reason: None,
                        values: zip_result(&definition.columns, result, &department.name),
                    },
                    Err(e) => {
                        tracing::warn!(metric = %definition.name, error = %e, "metric failed");
                        null_outcome(definition, MetricStatus::Failed, e.to_string())
                    }
                }
            })
            .collect()
    }

    fn compute_one(
        &self,
        definition: &MetricDefinitionConfig,
        ctx: &MetricContext<'_>,
    ) -> Result<MetricResult, ParleyError> {
        let metric = self
            .metrics
            .get(definition.compute_name())
            .ok_or_else(|| ParleyError::MetricError {
                name: definition.name.clone(),
                reason: format!("no metric '{}' registered", definition.compute_name()),
            })?;
        match panic::catch_unwind(AssertUnwindSafe(|| metric.compute(ctx))) {
            Ok(result) => result,
            Err(payload) => Err(ParleyError::MetricError {
                name: definition.name.clone(),
                reason: format!("panicked: {}", panic_payload_to_string(payload.as_ref())),
            }),
        }
    }
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn null_outcome(definition: &MetricDefinitionConfig, status: MetricStatus, reason: String) -> MetricOutcome {
    MetricOutcome {
        name: definition.name.clone(),
        status,
        reason: Some(reason),
        values: definition
            .columns
            .iter()
            .map(|c| (c.name().to_string(), MetricValue::Null))
            .collect(),
    }
}

fn zip_result(columns: &[ColumnSpec], result: MetricResult, department: &str) -> Vec<(String, MetricValue)> {
    let values = match result {
        MetricResult::Single(v) => vec![v],
        MetricResult::Tuple(vs) => vs,
        MetricResult::Mapping(mut by_department) => by_department.remove(department).unwrap_or_default(),
    };
    let mut values = values.into_iter();
    columns
        .iter()
        .map(|c| (c.name().to_string(), values.next().unwrap_or(MetricValue::Null)))
        .collect()
}

/// Numeric score carried by a judge answer: a bare number or a JSON `score` field.
pub fn parse_score(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return v.is_finite().then_some(v);
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    match value.get("score")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// (total rows, completed rows, failed rows).
pub struct EvaluationVolume;

impl Metric for EvaluationVolume {
    fn compute(&self, ctx: &MetricContext<'_>) -> Result<MetricResult, ParleyError> {
        let rows = ctx.outputs()?;
        let completed = rows.iter().filter(|r| r.outcome() != RowOutcome::Pending).count();
        let failed = rows.iter().filter(|r| r.outcome() == RowOutcome::Failed).count();
        Ok(MetricResult::Tuple(vec![
            rows.len().into(),
            completed.into(),
            failed.into(),
        ]))
    }
}

/// Share of completed rows that succeeded; null when nothing completed.
pub struct JudgeSuccessRate;

impl Metric for JudgeSuccessRate {
    fn compute(&self, ctx: &MetricContext<'_>) -> Result<MetricResult, ParleyError> {
        let rows = ctx.outputs()?;
        let completed = rows.iter().filter(|r| r.outcome() != RowOutcome::Pending).count();
        let succeeded = rows.iter().filter(|r| r.outcome() == RowOutcome::Succeeded).count();
        let rate = (completed > 0).then(|| succeeded as f64 / completed as f64);
        Ok(MetricResult::Single(rate.into()))
    }
}

/// (mean score, scored rows) over successful rows with a readable score.
pub struct MeanScore;

impl Metric for MeanScore {
    fn compute(&self, ctx: &MetricContext<'_>) -> Result<MetricResult, ParleyError> {
        let scores: Vec<f64> = ctx
            .outputs()?
            .iter()
            .filter(|r| r.outcome() == RowOutcome::Succeeded)
            .filter_map(|r| r.raw_model_text.as_deref().and_then(parse_score))
            .collect();
        let mean = (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64);
        Ok(MetricResult::Tuple(vec![mean.into(), scores.len().into()]))
    }
}

/// Distinct evaluated conversations for every configured department on the date.
pub struct CoverageByDepartment;

impl Metric for CoverageByDepartment {
    fn compute(&self, ctx: &MetricContext<'_>) -> Result<MetricResult, ParleyError> {
        let mut coverage = BTreeMap::new();
        for department in ctx.registry.departments() {
            let names: Vec<String> = department.evaluators.iter().map(|e| e.name.clone()).collect();
            let conversations: BTreeSet<String> = outputs_for(ctx.store, department, ctx.date, &names)?
                .into_iter()
                .filter(|r| r.outcome() != RowOutcome::Pending)
                .map(|r| r.conversation_id)
                .collect();
            coverage.insert(department.name.clone(), vec![conversations.len().into()]);
        }
        Ok(MetricResult::Mapping(coverage))
    }
}

/// Short narrative sample of successful judge answers.
pub struct SummaryExcerpt;

const EXCERPT_ITEMS: usize = 3;
const EXCERPT_CHARS: usize = 120;

impl Metric for SummaryExcerpt {
    fn compute(&self, ctx: &MetricContext<'_>) -> Result<MetricResult, ParleyError> {
        let answers: Vec<String> = ctx
            .outputs()?
            .into_iter()
            .filter(|r| r.outcome() == RowOutcome::Succeeded)
            .filter_map(|r| r.raw_model_text)
            .collect();
        if answers.is_empty() {
            return Ok(MetricResult::Single(MetricValue::Null));
        }
        Ok(MetricResult::Single(MetricValue::Text(output::preview_messages(
            &answers,
            EXCERPT_ITEMS,
            EXCERPT_CHARS,
        ))))
    }
}
