//! End-to-end runs: encode, dispatch, compute metrics, aggregate flags.
//!
//! A (date, department) run is sequential. `run_date` fans departments out over
//! rayon; a failing department is reported in the summary and never stops the rest.
//! Re-running a date is idempotent: every write replaces or overwrites its partition.

use crate::core::config::{EncodingVariant, Registry};
use crate::core::error::ParleyError;
use crate::core::message::Conversation;
use crate::core::source;
use crate::core::store::{UpsertStore, WriteOutcome};
use crate::core::time;
use crate::plugins::dispatch::{DispatchSummary, Dispatcher, Judge};
use crate::plugins::encode::{self, ConversionStats};
use crate::plugins::flags::{FlagAggregator, FlagSummary};
use crate::plugins::metrics::{MetricEngine, MetricRegistry, MetricsReport};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluatorRun {
    pub evaluator: String,
    pub encoding: &'static str,
    pub conversion: ConversionStats,
    pub dispatch: DispatchSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepartmentRunSummary {
    pub run_id: String,
    pub date: String,
    pub department: String,
    pub skipped_source_rows: usize,
    pub evaluators: Vec<EvaluatorRun>,
    pub metrics: MetricsReport,
    pub flags: FlagSummary,
}

impl DepartmentRunSummary {
    fn writes(&self) -> impl Iterator<Item = &WriteOutcome> {
        self.evaluators
            .iter()
            .flat_map(|e| e.dispatch.writes.iter())
            .chain(std::iter::once(&self.metrics.write))
            .chain(self.flags.writes.iter())
    }

    pub fn failed_writes(&self) -> usize {
        self.writes().filter(|w| !w.is_written()).count()
    }

    pub fn failed_rows(&self) -> usize {
        self.evaluators.iter().map(|e| e.dispatch.failed).sum()
    }

    /// `ok` when every write landed, `partial` otherwise.
    pub fn status(&self) -> &'static str {
        if self.failed_writes() == 0 { "ok" } else { "partial" }
    }

    pub fn to_envelope(&self) -> serde_json::Value {
        time::command_envelope(
            "parley.run_department",
            self.status(),
            json!({ "summary": self }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepartmentFailure {
    pub department: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateRunSummary {
    pub date: String,
    pub departments: Vec<DepartmentRunSummary>,
    pub failures: Vec<DepartmentFailure>,
}

impl DateRunSummary {
    pub fn status(&self) -> &'static str {
        if self.failures.is_empty() && self.departments.iter().all(|d| d.status() == "ok") {
            "ok"
        } else {
            "partial"
        }
    }

    pub fn to_envelope(&self) -> serde_json::Value {
        time::command_envelope(
            "parley.run_date",
            self.status(),
            json!({
                "date": self.date,
                "succeeded": self.departments.len(),
                "failed": self.failures.len(),
                "departments": self.departments,
                "failures": self.failures,
            }),
        )
    }
}

pub struct Pipeline<'a> {
    registry: &'a Registry,
    store: &'a UpsertStore,
    judge: &'a dyn Judge,
    metrics: MetricRegistry,
}

impl<'a> Pipeline<'a> {
    /// Pipeline with the built-in metrics.
    pub fn new(registry: &'a Registry, store: &'a UpsertStore, judge: &'a dyn Judge) -> Self {
        Self {
            registry,
            store,
            judge,
            metrics: MetricRegistry::with_builtins(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricRegistry) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &Registry {
        self.registry
    }

    pub fn run_department(
        &self,
        date: NaiveDate,
        department: &str,
    ) -> Result<DepartmentRunSummary, ParleyError> {
        let profile = self
            .registry
            .department(department)
            .ok_or_else(|| ParleyError::NotFound(format!("department '{}'", department)))?;
        let day = time::format_date(date);
        tracing::info!(department, date = %day, "department run started");

        let daily = source::load_batch(self.store, &profile.source_table, date, date)?;
        // The window covers the day, so its skip count is the run's.
        let mut skipped_source_rows = daily.skipped_rows;
        let daily = daily.into_conversations();
        let windowed: Option<Vec<Conversation>> = if profile.load_window_days() > 1 {
            let (start, end) = time::date_window(date, profile.load_window_days());
            let window = source::load_batch(self.store, &profile.source_table, start, end)?;
            skipped_source_rows = window.skipped_rows;
            Some(window.into_conversations())
        } else {
            None
        };

        let dispatcher = Dispatcher::new(self.store, self.judge);
        let mut evaluators = Vec::with_capacity(profile.evaluators.len());
        for spec in &profile.evaluators {
            let conversations = match (&spec.encoding, &windowed) {
                (EncodingVariant::GroupedByIdentity, Some(window)) => window,
                _ => &daily,
            };
            let mut conversion = ConversionStats::default();
            let documents = encode::encoder_for(spec).encode(conversations, profile, &mut conversion);
            let dispatch = dispatcher.dispatch(&day, profile, spec, &documents)?;
            evaluators.push(EvaluatorRun {
                evaluator: spec.name.clone(),
                encoding: spec.encoding.as_str(),
                conversion,
                dispatch,
            });
        }

        let metrics = MetricEngine::new(&self.metrics).run(self.store, self.registry, profile, &day)?;
        let flags = FlagAggregator::new(self.store, self.registry).aggregate(profile, &day)?;

        let summary = DepartmentRunSummary {
            run_id: time::new_event_id(),
            date: day,
            department: profile.name.clone(),
            skipped_source_rows,
            evaluators,
            metrics,
            flags,
        };
        tracing::info!(
            department,
            date = %summary.date,
            status = summary.status(),
            failed_rows = summary.failed_rows(),
            skipped_source_rows = summary.skipped_source_rows,
            "department run finished"
        );
        Ok(summary)
    }

    /// Run every configured department for `date` in parallel.
    pub fn run_date(&self, date: NaiveDate) -> DateRunSummary {
        let names = self.registry.department_names();
        let results: Vec<(String, Result<DepartmentRunSummary, ParleyError>)> = names
            .into_par_iter()
            .map(|name| {
                let result = self.run_department(date, &name);
                (name, result)
            })
            .collect();

        let mut departments = Vec::new();
        let mut failures = Vec::new();
        for (department, result) in results {
            match result {
                Ok(summary) => departments.push(summary),
                Err(e) => {
                    tracing::warn!(department = %department, error = %e, "department run failed");
                    failures.push(DepartmentFailure {
                        department,
                        error: e.to_string(),
                    });
                }
            }
        }
        DateRunSummary {
            date: time::format_date(date),
            departments,
            failures,
        }
    }
}
