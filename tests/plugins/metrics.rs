use parley::ParleyError;
use parley::core::config::{
    ColumnKind, ColumnSpec, DepartmentProfile, EncodingVariant, EvaluatorSpec,
    MetricDefinitionConfig, Registry, ToolRendering,
};
use parley::core::message::{Conversation, Message, MessageType, SenderRole};
use parley::core::store::{ColumnValue, PartitionKey, UpsertStore};
use parley::plugins::dispatch::{Dispatcher, Judge, JudgeRequest};
use parley::plugins::encode::{self, ConversionStats};
use parley::plugins::metrics::{
    Metric, MetricContext, MetricEngine, MetricRegistry, MetricResult, MetricStatus, MetricValue,
};
use tempfile::tempdir;

const DATE: &str = "2024-05-01";

struct ScoreJudge;

impl Judge for ScoreJudge {
    fn invoke(&self, request: &JudgeRequest) -> Result<String, ParleyError> {
        if request.document_text.contains("broken") {
            Ok("[openai_chat error]".to_string())
        } else {
            Ok("{\"score\": 4, \"reason\": \"polite and correct\"}".to_string())
        }
    }
}

struct Approves;

impl Judge for Approves {
    fn invoke(&self, _request: &JudgeRequest) -> Result<String, ParleyError> {
        Ok("{\"score\": 5}".to_string())
    }
}

struct Explodes;

impl Metric for Explodes {
    fn compute(&self, _ctx: &MetricContext<'_>) -> Result<MetricResult, ParleyError> {
        panic!("metric blew up");
    }
}

struct Errors;

impl Metric for Errors {
    fn compute(&self, _ctx: &MetricContext<'_>) -> Result<MetricResult, ParleyError> {
        Err(ParleyError::ValidationError("bad input".to_string()))
    }
}

struct Constant;

impl Metric for Constant {
    fn compute(&self, _ctx: &MetricContext<'_>) -> Result<MetricResult, ParleyError> {
        Ok(MetricResult::Single(MetricValue::Text("constant".to_string())))
    }
}

fn spec() -> EvaluatorSpec {
    EvaluatorSpec {
        name: "quality".to_string(),
        encoding: EncodingVariant::LinearDialogue,
        instructions: "Score the chat 1-5 as JSON.".to_string(),
        model: "judge".to_string(),
        decoding: Default::default(),
        output_table: "billing_quality".to_string(),
        skill_instructions: Default::default(),
        tool_rendering: ToolRendering::NameOnly,
    }
}

fn metric(name: &str, columns: Vec<ColumnSpec>, requires: &[&str], order: i32) -> MetricDefinitionConfig {
    MetricDefinitionConfig {
        name: name.to_string(),
        metric: None,
        columns,
        requires: requires.iter().map(|s| s.to_string()).collect(),
        order,
    }
}

fn numeric(name: &str) -> ColumnSpec {
    ColumnSpec::Name(name.to_string())
}

fn narrative(name: &str) -> ColumnSpec {
    ColumnSpec::Detailed {
        name: name.to_string(),
        kind: ColumnKind::Narrative,
    }
}

fn registry() -> Registry {
    let mut billing = DepartmentProfile::new("billing", "billing_messages", &["billing_bot"], &[]);
    billing.evaluators = vec![spec()];
    billing.metrics = vec![
        metric("summary_excerpt", vec![narrative("excerpt")], &[], 9),
        metric("evaluation_volume", vec![numeric("total"), numeric("completed"), numeric("failed_rows")], &[], 1),
        metric("explodes", vec![numeric("boom")], &[], 2),
        metric("errors", vec![numeric("oops")], &[], 3),
        metric("judge_success_rate", vec![numeric("success_rate")], &["quality"], 4),
        metric("mean_score", vec![numeric("mean_score"), numeric("scored")], &["quality"], 5),
        metric("constant", vec![narrative("ghost_note")], &["ghost"], 6),
        metric("coverage_by_department", vec![numeric("coverage")], &[], 7),
        metric("not_registered", vec![numeric("unknown_col")], &[], 8),
    ];
    let sales = DepartmentProfile::new("sales", "sales_messages", &["sales_bot"], &[]);
    Registry::new(vec![billing, sales], vec![]).unwrap()
}

fn metric_registry() -> MetricRegistry {
    let mut metrics = MetricRegistry::with_builtins();
    metrics.register("explodes", Explodes);
    metrics.register("errors", Errors);
    metrics.register("constant", Constant);
    metrics
}

fn seed(store: &UpsertStore, registry: &Registry) {
    let profile = registry.department("billing").unwrap();
    let chat = |id: &str, text: &str| {
        Conversation::new(
            id,
            vec![
                Message::new(id, "2024-05-01 09:00:00", SenderRole::Consumer, MessageType::Normal, text),
                Message::new(id, "2024-05-01 09:00:01", SenderRole::Bot, MessageType::Normal, "sure")
                    .with_skill("billing_bot"),
            ],
        )
    };
    let mut stats = ConversionStats::default();
    let docs = encode::encoder_for(&spec()).encode(
        &[chat("c1", "refund please"), chat("c2", "broken chat")],
        profile,
        &mut stats,
    );
    Dispatcher::new(store, &ScoreJudge).dispatch(DATE, profile, &spec(), &docs).unwrap();
}

fn summary_row(store: &UpsertStore) -> std::collections::BTreeMap<String, ColumnValue> {
    let rows = store
        .read_rows("department_summary", &PartitionKey::department(DATE, "billing").predicate())
        .unwrap();
    assert_eq!(rows.len(), 1);
    rows.into_iter().next().unwrap()
}

#[test]
fn test_faulting_metric_leaves_others_populated() {
    let tmp = tempdir().unwrap();
    let store = UpsertStore::open(tmp.path()).unwrap();
    let registry = registry();
    seed(&store, &registry);

    let metrics = metric_registry();
    let report = MetricEngine::new(&metrics)
        .run(&store, &registry, registry.department("billing").unwrap(), DATE)
        .unwrap();

    // 1. Outcomes run in `order`, each isolated
    let names: Vec<&str> = report.outcomes.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "evaluation_volume",
            "explodes",
            "errors",
            "judge_success_rate",
            "mean_score",
            "constant",
            "coverage_by_department",
            "not_registered",
            "summary_excerpt",
        ]
    );
    assert_eq!(report.outcome("explodes").unwrap().status, MetricStatus::Failed);
    assert_eq!(report.outcome("errors").unwrap().status, MetricStatus::Failed);
    assert_eq!(report.outcome("not_registered").unwrap().status, MetricStatus::Failed);
    assert_eq!(report.outcome("constant").unwrap().status, MetricStatus::Skipped);
    assert_eq!(report.count(MetricStatus::Computed), 5);

    // 2. The summary row holds real values next to materialized nulls
    let row = summary_row(&store);
    assert_eq!(row["total"], ColumnValue::Real(2.0));
    assert_eq!(row["completed"], ColumnValue::Real(2.0));
    assert_eq!(row["failed_rows"], ColumnValue::Real(1.0));
    assert_eq!(row["success_rate"], ColumnValue::Real(0.5));
    assert_eq!(row["mean_score"], ColumnValue::Real(4.0));
    assert_eq!(row["scored"], ColumnValue::Real(1.0));
    assert_eq!(row["coverage"], ColumnValue::Real(2.0));
    assert_eq!(row["boom"], ColumnValue::Real(0.0));
    assert_eq!(row["oops"], ColumnValue::Real(0.0));
    assert_eq!(row["unknown_col"], ColumnValue::Real(0.0));
    assert_eq!(row["ghost_note"], ColumnValue::Text("N/A".to_string()));
    assert!(row["excerpt"].as_str().unwrap().contains("polite and correct"));
}

#[test]
fn test_department_without_outputs_gets_zero_state_row() {
    let tmp = tempdir().unwrap();
    let store = UpsertStore::open(tmp.path()).unwrap();
    let registry = registry();

    let metrics = metric_registry();
    MetricEngine::new(&metrics)
        .run(&store, &registry, registry.department("billing").unwrap(), DATE)
        .unwrap();
    let row = summary_row(&store);
    assert_eq!(row["total"], ColumnValue::Real(0.0));
    assert_eq!(row["success_rate"], ColumnValue::Real(0.0));
    assert_eq!(row["excerpt"], ColumnValue::Text("N/A".to_string()));
}

#[test]
fn test_rerun_overwrites_summary_values() {
    let tmp = tempdir().unwrap();
    let store = UpsertStore::open(tmp.path()).unwrap();
    let registry = registry();
    seed(&store, &registry);
    let metrics = metric_registry();
    let engine = MetricEngine::new(&metrics);
    let billing = registry.department("billing").unwrap();

    engine.run(&store, &registry, billing, DATE).unwrap();
    let first = summary_row(&store);
    engine.run(&store, &registry, billing, DATE).unwrap();
    let second = summary_row(&store);
    assert_eq!(first["total"], second["total"]);
    assert_eq!(first["success_rate"], second["success_rate"]);
}

#[test]
fn test_one_metric_backs_several_definitions() {
    let tmp = tempdir().unwrap();
    let store = UpsertStore::open(tmp.path()).unwrap();

    // 1. judge_success_rate computed once per evaluator, into separate columns
    let mut tone = spec();
    tone.name = "tone".to_string();
    tone.output_table = "billing_tone".to_string();
    let mut billing = DepartmentProfile::new("billing", "billing_messages", &["billing_bot"], &[]);
    billing.evaluators = vec![spec(), tone.clone()];
    let mut quality_rate = metric("quality_success_rate", vec![numeric("quality_success")], &["quality"], 1);
    quality_rate.metric = Some("judge_success_rate".to_string());
    let mut tone_rate = metric("tone_success_rate", vec![numeric("tone_success")], &["tone"], 2);
    tone_rate.metric = Some("judge_success_rate".to_string());
    billing.metrics = vec![quality_rate, tone_rate];
    let registry = Registry::new(vec![billing], vec![]).unwrap();

    // 2. quality sees one provider failure; tone approves everything
    seed(&store, &registry);
    let profile = registry.department("billing").unwrap();
    let chat = Conversation::new(
        "c1",
        vec![
            Message::new("c1", "2024-05-01 09:00:00", SenderRole::Consumer, MessageType::Normal, "hello"),
            Message::new("c1", "2024-05-01 09:00:01", SenderRole::Bot, MessageType::Normal, "hi")
                .with_skill("billing_bot"),
        ],
    );
    let mut stats = ConversionStats::default();
    let docs = encode::encoder_for(&tone).encode(&[chat], profile, &mut stats);
    Dispatcher::new(&store, &Approves).dispatch(DATE, profile, &tone, &docs).unwrap();

    let metrics = MetricRegistry::with_builtins();
    let report = MetricEngine::new(&metrics).run(&store, &registry, profile, DATE).unwrap();
    assert_eq!(report.count(MetricStatus::Computed), 2);
    let row = summary_row(&store);
    assert_eq!(row["quality_success"], ColumnValue::Real(0.5));
    assert_eq!(row["tone_success"], ColumnValue::Real(1.0));
}

#[test]
fn test_column_declared_by_two_definitions_is_rejected() {
    let mut billing = DepartmentProfile::new("billing", "billing_messages", &["billing_bot"], &[]);
    billing.evaluators = vec![spec()];
    billing.metrics = vec![
        metric("evaluation_volume", vec![numeric("total")], &[], 1),
        metric("coverage_by_department", vec![numeric("total")], &[], 2),
    ];
    match Registry::new(vec![billing], vec![]) {
        Err(ParleyError::ConfigError(msg)) => assert!(msg.contains("column 'total'"), "{}", msg),
        other => panic!("expected config error, got {:?}", other.map(|_| ())),
    }
}
