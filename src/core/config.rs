//! Department, evaluator, metric, and flag-source registry.
//!
//! Loaded once from TOML, validated, then shared by reference with every component.
//! Nothing here is mutable after `Registry::load` returns.
//!
//! ```toml
//! [departments.billing]
//! source_table = "billing_messages"
//! bot_skills = ["billing_bot"]
//! agent_skills = ["billing_agents"]
//! flag_sources = ["escalation"]
//!
//! [[departments.billing.evaluators]]
//! name = "resolution"
//! encoding = "linear-dialogue"
//! instructions = "Did the bot resolve the request? {{current_skill}}"
//! model = "judge-large"
//! output_table = "billing_resolution"
//!
//! [[departments.billing.metrics]]
//! name = "judge_success_rate"
//! columns = ["resolution_success_rate"]
//! requires = ["resolution"]
//! order = 1
//!
//! [[flag_sources]]
//! name = "escalation"
//! output_table = "billing_resolution"
//! evaluator = "resolution"
//! predicate = { kind = "sentinel-match", pattern = "(?i)escalat" }
//! ```

use crate::core::db;
use crate::core::error::ParleyError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Column names the output tables reserve for their keys.
const RESERVED_COLUMNS: &[&str] = &[
    "date",
    "department",
    "updated_at",
    "conversation_id",
    "overall",
    "total_conversations",
    "flagged_conversations",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncodingVariant {
    LinearDialogue,
    PerSegment,
    StructuredObject,
    GroupedByIdentity,
}

impl EncodingVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            EncodingVariant::LinearDialogue => "linear-dialogue",
            EncodingVariant::PerSegment => "per-segment",
            EncodingVariant::StructuredObject => "structured-object",
            EncodingVariant::GroupedByIdentity => "grouped-by-identity",
        }
    }
}

/// How tool events appear in text encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolRendering {
    #[default]
    NameOnly,
    WithContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodingParams {
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for DecodingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> u32 {
    1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorSpec {
    pub name: String,
    pub encoding: EncodingVariant,
    pub instructions: String,
    pub model: String,
    #[serde(flatten)]
    pub decoding: DecodingParams,
    pub output_table: String,
    /// Instruction templates keyed by last-observed skill; `instructions` is the fallback.
    #[serde(default)]
    pub skill_instructions: BTreeMap<String, String>,
    #[serde(default)]
    pub tool_rendering: ToolRendering,
}

impl EvaluatorSpec {
    pub fn template_for(&self, skill: Option<&str>) -> &str {
        skill
            .and_then(|s| self.skill_instructions.get(s))
            .map(String::as_str)
            .unwrap_or(&self.instructions)
    }
}

/// Options of the per-segment encoder's marking sub-mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentOptions {
    #[serde(default)]
    pub marker_skill: Option<String>,
    #[serde(default = "default_skill_length_threshold")]
    pub skill_length_threshold: usize,
    #[serde(default = "default_marking_tag")]
    pub tag: String,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            marker_skill: None,
            skill_length_threshold: default_skill_length_threshold(),
            tag: default_marking_tag(),
        }
    }
}

fn default_skill_length_threshold() -> usize {
    24
}

fn default_marking_tag() -> String {
    "marked".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    #[default]
    Numeric,
    Narrative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSpec {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        kind: ColumnKind,
    },
}

impl ColumnSpec {
    pub fn name(&self) -> &str {
        match self {
            ColumnSpec::Name(n) => n,
            ColumnSpec::Detailed { name, .. } => name,
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            ColumnSpec::Name(_) => ColumnKind::Numeric,
            ColumnSpec::Detailed { kind, .. } => *kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinitionConfig {
    pub name: String,
    /// Registered metric to compute; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub order: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FlagPredicate {
    /// Any output row for the conversation.
    Presence,
    /// A JSON field (or the bare text) reads as true.
    BooleanTrue {
        #[serde(default = "default_flag_field")]
        field: String,
    },
    /// The raw model text matches a regex.
    SentinelMatch { pattern: String },
    /// A dot-separated JSON path holds a number at or above `threshold`.
    NestedThreshold { path: String, threshold: f64 },
}

impl MetricDefinitionConfig {
    pub fn compute_name(&self) -> &str {
        self.metric.as_deref().unwrap_or(&self.name)
    }
}

fn default_flag_field() -> String {
    "flag".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagSource {
    pub name: String,
    pub output_table: String,
    pub evaluator: String,
    pub predicate: FlagPredicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepartmentProfile {
    #[serde(default)]
    pub name: String,
    pub source_table: String,
    #[serde(default)]
    pub bot_skills: BTreeSet<String>,
    #[serde(default)]
    pub agent_skills: BTreeSet<String>,
    #[serde(default = "default_summary_table")]
    pub summary_table: String,
    #[serde(default)]
    pub evaluators: Vec<EvaluatorSpec>,
    #[serde(default)]
    pub metrics: Vec<MetricDefinitionConfig>,
    /// Flag sources applicable to this department; all others are NOT_APPLICABLE.
    #[serde(default)]
    pub flag_sources: Vec<String>,
    /// Skill to the instructions the department's own bot runs under.
    #[serde(default)]
    pub upstream_instructions: BTreeMap<String, String>,
    #[serde(default = "default_grouping_window_days")]
    pub grouping_window_days: u32,
    #[serde(default)]
    pub segment: SegmentOptions,
}

fn default_summary_table() -> String {
    crate::core::schemas::DEFAULT_SUMMARY_TABLE.to_string()
}

fn default_grouping_window_days() -> u32 {
    7
}

impl DepartmentProfile {
    /// Minimal profile for the given skill sets; everything else defaults.
    pub fn new(name: &str, source_table: &str, bot_skills: &[&str], agent_skills: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            source_table: source_table.to_string(),
            bot_skills: bot_skills.iter().map(|s| s.to_string()).collect(),
            agent_skills: agent_skills.iter().map(|s| s.to_string()).collect(),
            summary_table: default_summary_table(),
            evaluators: Vec::new(),
            metrics: Vec::new(),
            flag_sources: Vec::new(),
            upstream_instructions: BTreeMap::new(),
            grouping_window_days: default_grouping_window_days(),
            segment: SegmentOptions::default(),
        }
    }

    pub fn evaluator(&self, name: &str) -> Option<&EvaluatorSpec> {
        self.evaluators.iter().find(|e| e.name == name)
    }

    pub fn has_evaluator(&self, name: &str) -> bool {
        self.evaluator(name).is_some()
    }

    pub fn flag_applies(&self, source: &str) -> bool {
        self.flag_sources.iter().any(|s| s == source)
    }

    /// Widest message window any of this department's evaluators needs, in days.
    pub fn load_window_days(&self) -> u32 {
        if self
            .evaluators
            .iter()
            .any(|e| e.encoding == EncodingVariant::GroupedByIdentity)
        {
            self.grouping_window_days.max(1)
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Registry {
    departments: BTreeMap<String, DepartmentProfile>,
    flag_sources: Vec<FlagSource>,
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self, ParleyError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| ParleyError::ConfigError(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ParleyError> {
        let raw: RegistryFile =
            toml::from_str(content).map_err(|e| ParleyError::ConfigError(e.to_string()))?;
        // A `[departments.<name>]` table takes its name from the key.
        let departments = raw
            .departments
            .into_iter()
            .map(|(name, mut profile)| {
                profile.name = name;
                profile
            })
            .collect();
        Self::new(departments, raw.flag_sources)
    }

    /// Build and validate a registry from already-constructed profiles.
    pub fn new(
        departments: Vec<DepartmentProfile>,
        flag_sources: Vec<FlagSource>,
    ) -> Result<Self, ParleyError> {
        let mut by_name = BTreeMap::new();
        for profile in departments {
            if by_name.contains_key(&profile.name) {
                return Err(ParleyError::ConfigError(format!(
                    "duplicate department '{}'",
                    profile.name
                )));
            }
            by_name.insert(profile.name.clone(), profile);
        }
        let registry = Self {
            departments: by_name,
            flag_sources,
        };
        registry.validate()?;
        Ok(registry)
    }

    pub fn department(&self, name: &str) -> Option<&DepartmentProfile> {
        self.departments.get(name)
    }

    pub fn departments(&self) -> impl Iterator<Item = &DepartmentProfile> {
        self.departments.values()
    }

    pub fn department_names(&self) -> Vec<String> {
        self.departments.keys().cloned().collect()
    }

    pub fn flag_sources(&self) -> &[FlagSource] {
        &self.flag_sources
    }

    pub fn flag_source(&self, name: &str) -> Option<&FlagSource> {
        self.flag_sources.iter().find(|f| f.name == name)
    }

    fn validate(&self) -> Result<(), ParleyError> {
        let mut flag_names = BTreeSet::new();
        for source in &self.flag_sources {
            config_identifier(&source.name, "flag source name")?;
            config_identifier(&source.output_table, "flag source output_table")?;
            if !flag_names.insert(source.name.as_str()) {
                return Err(ParleyError::ConfigError(format!(
                    "duplicate flag source '{}'",
                    source.name
                )));
            }
            if let FlagPredicate::SentinelMatch { pattern } = &source.predicate {
                Regex::new(pattern).map_err(|e| {
                    ParleyError::ConfigError(format!(
                        "flag source '{}' has invalid pattern: {}",
                        source.name, e
                    ))
                })?;
            }
        }

        for (key, profile) in &self.departments {
            if key.trim().is_empty() {
                return Err(ParleyError::ConfigError(
                    "department name must be non-empty".to_string(),
                ));
            }
            config_identifier(&profile.source_table, "source_table")?;
            config_identifier(&profile.summary_table, "summary_table")?;

            let mut evaluator_names = BTreeSet::new();
            for spec in &profile.evaluators {
                config_identifier(&spec.output_table, "evaluator output_table")?;
                if !evaluator_names.insert(spec.name.as_str()) {
                    return Err(ParleyError::ConfigError(format!(
                        "department '{}' declares evaluator '{}' twice",
                        key, spec.name
                    )));
                }
            }

            let mut metric_names = BTreeSet::new();
            let mut column_owners: BTreeMap<&str, &str> = BTreeMap::new();
            for metric in &profile.metrics {
                if !metric_names.insert(metric.name.as_str()) {
                    return Err(ParleyError::ConfigError(format!(
                        "department '{}' declares metric '{}' twice",
                        key, metric.name
                    )));
                }
                if metric.columns.is_empty() {
                    return Err(ParleyError::ConfigError(format!(
                        "metric '{}' in department '{}' declares no columns",
                        metric.name, key
                    )));
                }
                for column in &metric.columns {
                    config_identifier(column.name(), "metric column")?;
                    if RESERVED_COLUMNS.contains(&column.name()) {
                        return Err(ParleyError::ConfigError(format!(
                            "metric column '{}' is reserved",
                            column.name()
                        )));
                    }
                    if let Some(owner) = column_owners.insert(column.name(), metric.name.as_str()) {
                        return Err(ParleyError::ConfigError(format!(
                            "department '{}' declares column '{}' in both metric '{}' and '{}'",
                            key,
                            column.name(),
                            owner,
                            metric.name
                        )));
                    }
                }
            }

            for source in &profile.flag_sources {
                if !flag_names.contains(source.as_str()) {
                    return Err(ParleyError::ConfigError(format!(
                        "department '{}' refers to unknown flag source '{}'",
                        key, source
                    )));
                }
            }
        }
        Ok(())
    }
}

fn config_identifier(name: &str, what: &str) -> Result<(), ParleyError> {
    db::validate_identifier(name, what).map_err(|e| ParleyError::ConfigError(e.to_string()))
}

#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default)]
    departments: BTreeMap<String, DepartmentProfile>,
    #[serde(default)]
    flag_sources: Vec<FlagSource>,
}
