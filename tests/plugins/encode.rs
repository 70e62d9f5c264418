use parley::core::config::{
    DepartmentProfile, EncodingVariant, EvaluatorSpec, Registry, SegmentOptions, ToolRendering,
};
use parley::core::message::{Conversation, Message, MessageType, SenderRole};
use parley::plugins::dedup::{Signature, dedup_by};
use parley::plugins::encode::{
    self, ConversationEncoder, ConversionStats, DocumentBody, LinearDialogueEncoder,
    PerSegmentEncoder,
};
use proptest::prelude::*;

fn profile() -> DepartmentProfile {
    DepartmentProfile::new("billing", "billing_messages", &["billing_bot"], &["billing_agents"])
}

fn spec(encoding: EncodingVariant) -> EvaluatorSpec {
    EvaluatorSpec {
        name: "quality".to_string(),
        encoding,
        instructions: "Rate the chat.".to_string(),
        model: "judge".to_string(),
        decoding: Default::default(),
        output_table: "billing_quality".to_string(),
        skill_instructions: Default::default(),
        tool_rendering: ToolRendering::NameOnly,
    }
}

fn consumer(id: &str, at: &str, text: &str) -> Message {
    Message::new(id, at, SenderRole::Consumer, MessageType::Normal, text)
}

fn bot(id: &str, at: &str, text: &str) -> Message {
    Message::new(id, at, SenderRole::Bot, MessageType::Normal, text).with_skill("billing_bot")
}

fn agent(id: &str, at: &str, text: &str, agent_id: &str) -> Message {
    Message::new(id, at, SenderRole::Agent, MessageType::Normal, text)
        .with_skill("billing_agents")
        .with_agent(agent_id)
}

fn body_lines(text: &str) -> Vec<String> {
    text.lines().skip(1).map(str::to_string).collect()
}

#[test]
fn test_per_segment_keeps_only_bot_run_deduplicated() {
    let conv = Conversation::new(
        "c1",
        vec![
            consumer("c1", "2024-05-01 10:00:00", "hi"),
            bot("c1", "2024-05-01 10:00:01", "hello"),
            bot("c1", "2024-05-01 10:00:01", "hello"),
            agent("c1", "2024-05-01 10:00:05", "how can I help", "A1"),
        ],
    );
    let mut stats = ConversionStats::default();
    let docs = PerSegmentEncoder::new(ToolRendering::NameOnly).encode(&[conv], &profile(), &mut stats);

    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].conversation_id, "c1");
    assert_eq!(docs[0].segment_index, 0);
    assert_eq!(body_lines(&docs[0].text()), vec!["Consumer: hi", "Bot: hello"]);
    assert_eq!(stats.duplicates_suppressed, 1);
}

#[test]
fn test_per_segment_indexes_runs_and_drops_runs_without_consumer() {
    let conv = Conversation::new(
        "c2",
        vec![
            consumer("c2", "2024-05-01 10:00:00", "first question"),
            bot("c2", "2024-05-01 10:00:01", "first answer"),
            agent("c2", "2024-05-01 10:00:02", "taking over", "A1"),
            consumer("c2", "2024-05-01 10:00:03", "thanks"),
            bot("c2", "2024-05-01 10:00:04", "back again"),
            bot("c2", "2024-05-01 10:00:05", "anything else?"),
        ],
    );
    let mut stats = ConversionStats::default();
    let docs = PerSegmentEncoder::new(ToolRendering::NameOnly).encode(&[conv], &profile(), &mut stats);

    // Runs: 0 = bot (with consumer), 1 = agent (+consumer), 2 = bot (no consumer).
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].segment_index, 0);
}

#[test]
fn test_per_segment_marking_tags_turns() {
    let mut p = profile();
    p.bot_skills.insert("handoff".to_string());
    p.segment = SegmentOptions {
        marker_skill: Some("handoff".to_string()),
        skill_length_threshold: 12,
        tag: "handoff".to_string(),
    };
    let conv = Conversation::new(
        "c3",
        vec![
            consumer("c3", "2024-05-01 10:00:00", "help"),
            Message::new("c3", "2024-05-01 10:00:01", SenderRole::Bot, MessageType::Normal, "one sec")
                .with_skill("handoff"),
            consumer("c3", "2024-05-01 10:00:02", "ok"),
        ],
    );
    let mut stats = ConversionStats::default();
    let docs = PerSegmentEncoder::new(ToolRendering::NameOnly).encode(&[conv], &p, &mut stats);
    assert_eq!(
        body_lines(&docs[0].text()),
        vec!["Consumer: help", "Bot [handoff]: one sec", "Consumer [handoff]: ok"]
    );
}

#[test]
fn test_participant_gating_holds_for_every_variant() {
    let bot_only = Conversation::new(
        "lonely",
        vec![
            bot("lonely", "2024-05-01 10:00:00", "hello?"),
            bot("lonely", "2024-05-01 10:00:10", "still there?"),
        ],
    );
    let consumer_only = Conversation::new(
        "unanswered",
        vec![consumer("unanswered", "2024-05-01 10:00:00", "hello?")],
    );
    for variant in [
        EncodingVariant::LinearDialogue,
        EncodingVariant::PerSegment,
        EncodingVariant::StructuredObject,
        EncodingVariant::GroupedByIdentity,
    ] {
        let mut stats = ConversionStats::default();
        let docs = encode::encoder_for(&spec(variant)).encode(
            &[bot_only.clone(), consumer_only.clone()],
            &profile(),
            &mut stats,
        );
        assert!(docs.is_empty(), "{:?} produced a document", variant);
        assert_eq!(stats.skipped_missing_participants, 2);
    }
}

#[test]
fn test_foreign_bot_counts_as_responder_and_reads_as_agent() {
    let conv = Conversation::new(
        "c4",
        vec![
            consumer("c4", "2024-05-01 10:00:00", "hi"),
            Message::new("c4", "2024-05-01 10:00:01", SenderRole::Bot, MessageType::Normal, "sales here")
                .with_skill("sales_bot"),
        ],
    );
    let mut stats = ConversionStats::default();
    let docs = LinearDialogueEncoder::new(ToolRendering::NameOnly).encode(&[conv], &profile(), &mut stats);
    assert_eq!(docs.len(), 1);
    assert!(docs[0].text().contains("Agent: sales here"));
}

#[test]
fn test_with_content_rendering_includes_tool_response() {
    let conv = Conversation::new(
        "c5",
        vec![
            consumer("c5", "2024-05-01 10:00:00", "where is my invoice"),
            Message::new(
                "c5",
                "2024-05-01 10:00:01",
                SenderRole::Bot,
                MessageType::ToolCall,
                r#"{"tool_calls":[{"id":"x1","function":{"name":"find_invoice","arguments":"{}"}}]}"#,
            )
            .with_skill("billing_bot"),
            Message::new(
                "c5",
                "2024-05-01 10:00:02",
                SenderRole::System,
                MessageType::ToolResponse,
                r#"{"tool_call_id":"x1","content":"INV-42 due"}"#,
            ),
        ],
    );
    let mut stats = ConversionStats::default();
    let name_only = LinearDialogueEncoder::new(ToolRendering::NameOnly).encode(&[conv.clone()], &profile(), &mut stats);
    let with_content = LinearDialogueEncoder::new(ToolRendering::WithContent).encode(&[conv], &profile(), &mut stats);
    assert!(!name_only[0].text().contains("INV-42"));
    assert!(with_content[0].text().contains("[tool call: find_invoice at 2024-05-01 10:00:01] INV-42 due"));
}

#[test]
fn test_unconfigured_department_is_counted_not_raised() {
    let registry = Registry::new(vec![profile()], vec![]).unwrap();
    let conv = Conversation::new("c6", vec![consumer("c6", "2024-05-01 10:00:00", "hi")]);
    let (docs, stats) = encode::encode_for_department(&registry, "sales", &spec(EncodingVariant::LinearDialogue), &[conv]);
    assert!(docs.is_empty());
    assert_eq!(stats.skipped_unconfigured, 1);
}

#[test]
fn test_document_hash_is_stable() {
    let conv = Conversation::new(
        "c7",
        vec![consumer("c7", "2024-05-01 10:00:00", "hi"), bot("c7", "2024-05-01 10:00:01", "hello")],
    );
    let mut stats = ConversionStats::default();
    let a = LinearDialogueEncoder::new(ToolRendering::NameOnly).encode(&[conv.clone()], &profile(), &mut stats);
    let b = LinearDialogueEncoder::new(ToolRendering::NameOnly).encode(&[conv], &profile(), &mut stats);
    assert_eq!(a[0].hash(), b[0].hash());
    assert_eq!(a[0].hash().len(), 64);
    assert!(matches!(a[0].body, DocumentBody::Text(_)));
}

fn arb_signature() -> impl Strategy<Value = Signature> {
    (0u8..3, 0u8..3, 0u8..2, 0u8..2).prop_map(|(t, x, s, k)| Signature {
        time: format!("t{}", t),
        text: format!("x{}", x),
        sender: format!("s{}", s),
        kind: format!("k{}", k),
    })
}

proptest! {
    #[test]
    fn test_dedup_leaves_no_adjacent_duplicates(items in proptest::collection::vec(arb_signature(), 0..40)) {
        let total = items.len();
        let (kept, suppressed) = dedup_by(items, Clone::clone);
        prop_assert_eq!(kept.len() + suppressed, total);
        for pair in kept.windows(2) {
            prop_assert_ne!(&pair[0], &pair[1]);
        }
    }
}
