use parley::ParleyError;
use parley::core::config::{DepartmentProfile, EncodingVariant, EvaluatorSpec, ToolRendering};
use parley::core::message::{Conversation, Message, MessageType, SenderRole};
use parley::core::store::UpsertStore;
use parley::plugins::dispatch::{
    Dispatcher, Judge, JudgeRequest, RowOutcome, STATUS_COMPLETED, STATUS_PENDING, read_outputs,
};
use parley::plugins::encode::{self, ConversionStats, Document};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::tempdir;

const DATE: &str = "2024-05-01";

/// Answers from a fixed script keyed by a substring of the document.
struct ScriptedJudge {
    answers: Vec<(&'static str, &'static str)>,
    fail_batch: bool,
    batch_calls: AtomicUsize,
    single_calls: AtomicUsize,
    seen_instructions: Mutex<Vec<String>>,
}

impl ScriptedJudge {
    fn new(answers: Vec<(&'static str, &'static str)>) -> Self {
        Self {
            answers,
            fail_batch: false,
            batch_calls: AtomicUsize::new(0),
            single_calls: AtomicUsize::new(0),
            seen_instructions: Mutex::new(Vec::new()),
        }
    }
}

impl Judge for ScriptedJudge {
    fn invoke(&self, request: &JudgeRequest) -> Result<String, ParleyError> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        self.seen_instructions.lock().unwrap().push(request.instructions.clone());
        self.answers
            .iter()
            .find(|(needle, _)| request.document_text.contains(needle))
            .map(|(_, answer)| answer.to_string())
            .ok_or_else(|| ParleyError::JudgeError("no scripted answer".to_string()))
    }

    fn invoke_batch(&self, requests: &[JudgeRequest]) -> Result<Vec<String>, ParleyError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_batch {
            return Err(ParleyError::JudgeError("batch endpoint down".to_string()));
        }
        requests.iter().map(|r| self.invoke(r)).collect()
    }
}

/// Blocks updates to the output table before answering, so completion cannot land.
struct LockingJudge {
    db_path: PathBuf,
}

impl Judge for LockingJudge {
    fn invoke(&self, _request: &JudgeRequest) -> Result<String, ParleyError> {
        Ok("{\"score\": 5}".to_string())
    }

    fn invoke_batch(&self, requests: &[JudgeRequest]) -> Result<Vec<String>, ParleyError> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            "CREATE TRIGGER IF NOT EXISTS lock_quality BEFORE UPDATE ON billing_quality
             BEGIN SELECT RAISE(ABORT, 'table locked'); END;",
        )?;
        requests.iter().map(|r| self.invoke(r)).collect()
    }
}

fn profile() -> DepartmentProfile {
    let mut p = DepartmentProfile::new("billing", "billing_messages", &["billing_bot", "refund_bot"], &[]);
    p.upstream_instructions
        .insert("refund_bot".to_string(), "Always confirm the amount.".to_string());
    p
}

fn spec() -> EvaluatorSpec {
    let mut skill_instructions = BTreeMap::new();
    skill_instructions.insert(
        "refund_bot".to_string(),
        "Refund review. Upstream: {{inherited_instructions}} Skill: {{current_skill}}".to_string(),
    );
    EvaluatorSpec {
        name: "quality".to_string(),
        encoding: EncodingVariant::LinearDialogue,
        instructions: "General review of {{current_skill}}".to_string(),
        model: "judge-large".to_string(),
        decoding: Default::default(),
        output_table: "billing_quality".to_string(),
        skill_instructions,
        tool_rendering: ToolRendering::NameOnly,
    }
}

fn chat(id: &str, skill: &str, text: &str) -> Conversation {
    Conversation::new(
        id,
        vec![
            Message::new(id, "2024-05-01 09:00:00", SenderRole::Consumer, MessageType::Normal, text),
            Message::new(id, "2024-05-01 09:00:01", SenderRole::Bot, MessageType::Normal, "on it")
                .with_skill(skill),
        ],
    )
}

fn documents(conversations: &[Conversation]) -> Vec<Document> {
    let mut stats = ConversionStats::default();
    encode::encoder_for(&spec()).encode(conversations, &profile(), &mut stats)
}

#[test]
fn test_dispatch_completes_every_row_once() {
    let tmp = tempdir().unwrap();
    let store = UpsertStore::open(tmp.path()).unwrap();
    let judge = ScriptedJudge::new(vec![("alpha", "{\"score\": 5}"), ("beta", "[openai_chat error]")]);
    let docs = documents(&[chat("c1", "billing_bot", "alpha"), chat("c2", "billing_bot", "beta")]);

    // 1. Dispatch once through the batch path
    let summary = Dispatcher::new(&store, &judge).dispatch(DATE, &profile(), &spec(), &docs).unwrap();
    assert_eq!(summary.staged, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert!(!summary.batch_fallback);
    assert_eq!(judge.batch_calls.load(Ordering::SeqCst), 1);

    // 2. Rows are completed; the provider sentinel reads as failed
    let rows = read_outputs(&store, "billing_quality", DATE, "billing", Some("quality")).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.status == STATUS_COMPLETED));
    assert_eq!(rows[0].outcome(), RowOutcome::Succeeded);
    assert_eq!(rows[1].raw_model_text.as_deref(), Some("[openai_chat error]"));
    assert_eq!(rows[1].outcome(), RowOutcome::Failed);
}

#[test]
fn test_batch_fault_falls_back_row_by_row() {
    let tmp = tempdir().unwrap();
    let store = UpsertStore::open(tmp.path()).unwrap();
    let mut judge = ScriptedJudge::new(vec![("alpha", "fine")]);
    judge.fail_batch = true;
    let docs = documents(&[chat("c1", "billing_bot", "alpha"), chat("c2", "billing_bot", "gamma")]);

    let summary = Dispatcher::new(&store, &judge).dispatch(DATE, &profile(), &spec(), &docs).unwrap();
    assert!(summary.batch_fallback);
    assert_eq!(judge.single_calls.load(Ordering::SeqCst), 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);

    let rows = read_outputs(&store, "billing_quality", DATE, "billing", None).unwrap();
    let gamma = rows.iter().find(|r| r.conversation_id == "c2").unwrap();
    assert!(gamma.raw_model_text.as_deref().unwrap().starts_with("[parley_judge error]"));
}

#[test]
fn test_instructions_resolve_by_last_skill_with_placeholders() {
    let tmp = tempdir().unwrap();
    let store = UpsertStore::open(tmp.path()).unwrap();
    let judge = ScriptedJudge::new(vec![("alpha", "ok"), ("beta", "ok")]);
    let docs = documents(&[chat("c1", "refund_bot", "alpha"), chat("c2", "billing_bot", "beta")]);

    Dispatcher::new(&store, &judge).dispatch(DATE, &profile(), &spec(), &docs).unwrap();
    let seen = judge.seen_instructions.lock().unwrap().clone();
    assert!(seen.contains(&"Refund review. Upstream: Always confirm the amount. Skill: refund_bot".to_string()));
    assert!(seen.contains(&"General review of billing_bot".to_string()));
}

#[test]
fn test_redispatch_replaces_previous_rows() {
    let tmp = tempdir().unwrap();
    let store = UpsertStore::open(tmp.path()).unwrap();
    let judge = ScriptedJudge::new(vec![("alpha", "ok"), ("beta", "ok")]);
    let dispatcher = Dispatcher::new(&store, &judge);

    let both = documents(&[chat("c1", "billing_bot", "alpha"), chat("c2", "billing_bot", "beta")]);
    dispatcher.dispatch(DATE, &profile(), &spec(), &both).unwrap();
    dispatcher.dispatch(DATE, &profile(), &spec(), &both).unwrap();
    assert_eq!(read_outputs(&store, "billing_quality", DATE, "billing", None).unwrap().len(), 2);

    let one = documents(&[chat("c1", "billing_bot", "alpha")]);
    dispatcher.dispatch(DATE, &profile(), &spec(), &one).unwrap();
    assert_eq!(read_outputs(&store, "billing_quality", DATE, "billing", None).unwrap().len(), 1);
}

#[test]
fn test_empty_document_set_makes_no_judge_call() {
    let tmp = tempdir().unwrap();
    let store = UpsertStore::open(tmp.path()).unwrap();
    let judge = ScriptedJudge::new(vec![]);
    let summary = Dispatcher::new(&store, &judge).dispatch(DATE, &profile(), &spec(), &[]).unwrap();
    assert_eq!(summary.staged, 0);
    assert_eq!(judge.batch_calls.load(Ordering::SeqCst), 0);
    assert!(summary.writes.iter().all(|w| w.is_written()));
}

#[test]
fn test_failed_completion_reports_answers_as_uncommitted() {
    let tmp = tempdir().unwrap();
    let store = UpsertStore::open(tmp.path()).unwrap();
    let judge = LockingJudge {
        db_path: store.broker().db_path().to_path_buf(),
    };
    let docs = documents(&[chat("c1", "billing_bot", "alpha"), chat("c2", "billing_bot", "beta")]);

    // 1. Staging lands, completion is rejected
    let summary = Dispatcher::new(&store, &judge).dispatch(DATE, &profile(), &spec(), &docs).unwrap();
    assert_eq!(summary.staged, 2);
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.uncommitted, 2);
    assert!(summary.writes[0].is_written());
    assert!(!summary.writes[1].is_written());

    // 2. Nothing was completed behind the summary's back
    let rows = read_outputs(&store, "billing_quality", DATE, "billing", None).unwrap();
    assert!(rows.iter().all(|r| r.status == STATUS_PENDING));
}
