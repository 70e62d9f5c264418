//! Conversation encoders: turn ordered messages into judge-ready documents.
//!
//! Every variant shares one preparation pass:
//! 1. drop transfer, private, and tool-response messages
//! 2. classify roles against the department profile
//! 3. collapse immediate repeats
//! 4. substitute a placeholder for empty normal text
//!
//! A conversation that ends up empty, or without both a responder and a consumer,
//! produces no document. Such exclusions are counted in `ConversionStats`, never raised.

pub mod grouped;
pub mod linear;
pub mod segment;
pub mod structured;

use crate::core::config::{DepartmentProfile, EncodingVariant, EvaluatorSpec, Registry, ToolRendering};
use crate::core::message::{Conversation, MessageType};
use crate::plugins::classify::{self, FOREIGN_AGENT_ID, Role};
use crate::plugins::dedup::{self, Signature};
use crate::plugins::tool_call::{ToolCallResolver, ToolResolution};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use tiktoken_rs::CoreBPE;

pub use grouped::GroupedByIdentityEncoder;
pub use linear::LinearDialogueEncoder;
pub use segment::{MarkingMachine, MarkingState, PerSegmentEncoder};
pub use structured::StructuredObjectEncoder;

/// Stands in for a normal message that carried no text.
pub const EMPTY_TEXT_PLACEHOLDER: &str = "[empty message]";

static BPE: LazyLock<Option<CoreBPE>> = LazyLock::new(|| tiktoken_rs::cl100k_base().ok());

/// cl100k token count, or a chars/4 estimate if the tokenizer is unavailable.
pub fn estimate_tokens(text: &str) -> usize {
    match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// One retained message after preparation.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub sent_at: String,
    pub role: Role,
    /// Agent identity for agents, `FOREIGN_AGENT_ID` for foreign bots.
    pub responder_id: Option<String>,
    pub skill: Option<String>,
    pub message_type: MessageType,
    pub text: String,
    pub tool: Option<ToolResolution>,
}

impl Turn {
    pub fn label(&self) -> &'static str {
        self.role.label()
    }

    pub fn is_tool(&self) -> bool {
        self.message_type == MessageType::ToolCall
    }

    fn signature(&self) -> Signature {
        Signature {
            time: self.sent_at.clone(),
            text: self.text.clone(),
            sender: format!(
                "{}:{}",
                self.label(),
                self.responder_id.as_deref().unwrap_or_default()
            ),
            kind: self.message_type.as_str().to_string(),
        }
    }

    /// `<role>: <text>` line; tool events show name and time, plus content when asked.
    pub fn render_line(&self, tools: ToolRendering) -> String {
        match &self.tool {
            Some(resolution) if self.is_tool() => match (tools, &resolution.content) {
                (ToolRendering::WithContent, Some(content)) => format!(
                    "{}: [tool call: {} at {}] {}",
                    self.label(),
                    resolution.display_name(),
                    self.sent_at,
                    content
                ),
                _ => format!(
                    "{}: [tool call: {} at {}]",
                    self.label(),
                    resolution.display_name(),
                    self.sent_at
                ),
            },
            _ => format!("{}: {}", self.label(), self.text),
        }
    }
}

/// A conversation that passed preparation and participant gating.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedConversation {
    pub id: String,
    pub customer_id: Option<String>,
    pub last_skill: Option<String>,
    pub started_at: String,
    pub turns: Vec<Turn>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentBody {
    Text(String),
    Structured(serde_json::Value),
}

/// Encoded representation of one conversation, segment, or customer group.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub conversation_id: String,
    pub segment_index: u32,
    pub customer_id: Option<String>,
    pub last_skill: Option<String>,
    /// Conversations folded into this document (more than one only when grouped).
    pub member_ids: Vec<String>,
    pub body: DocumentBody,
}

impl Document {
    pub fn text(&self) -> String {
        match &self.body {
            DocumentBody::Text(t) => t.clone(),
            DocumentBody::Structured(v) => v.to_string(),
        }
    }

    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversionStats {
    pub conversations: usize,
    pub encoded: usize,
    pub documents: usize,
    pub skipped_missing_participants: usize,
    pub skipped_empty: usize,
    pub skipped_unconfigured: usize,
    pub duplicates_suppressed: usize,
    pub token_estimate: usize,
}

impl ConversionStats {
    pub fn record_documents(&mut self, docs: &[Document]) {
        self.documents += docs.len();
        self.token_estimate += docs.iter().map(|d| estimate_tokens(&d.text())).sum::<usize>();
    }

    pub fn skipped(&self) -> usize {
        self.skipped_missing_participants + self.skipped_empty + self.skipped_unconfigured
    }

    pub fn merge(&mut self, other: &ConversionStats) {
        self.conversations += other.conversations;
        self.encoded += other.encoded;
        self.documents += other.documents;
        self.skipped_missing_participants += other.skipped_missing_participants;
        self.skipped_empty += other.skipped_empty;
        self.skipped_unconfigured += other.skipped_unconfigured;
        self.duplicates_suppressed += other.duplicates_suppressed;
        self.token_estimate += other.token_estimate;
    }
}

pub trait ConversationEncoder {
    fn variant(&self) -> EncodingVariant;

    /// Encode a batch of conversations. Implementations call `prepare` for gating.
    fn encode(
        &self,
        conversations: &[Conversation],
        profile: &DepartmentProfile,
        stats: &mut ConversionStats,
    ) -> Vec<Document>;
}

pub fn encoder_for(spec: &EvaluatorSpec) -> Box<dyn ConversationEncoder> {
    match spec.encoding {
        EncodingVariant::LinearDialogue => Box::new(LinearDialogueEncoder::new(spec.tool_rendering)),
        EncodingVariant::PerSegment => Box::new(PerSegmentEncoder::new(spec.tool_rendering)),
        EncodingVariant::StructuredObject => {
            Box::new(StructuredObjectEncoder::new(spec.tool_rendering))
        }
        EncodingVariant::GroupedByIdentity => {
            Box::new(GroupedByIdentityEncoder::new(spec.tool_rendering))
        }
    }
}

/// Encode for a department looked up by name; an unknown department yields nothing.
pub fn encode_for_department(
    registry: &Registry,
    department: &str,
    spec: &EvaluatorSpec,
    conversations: &[Conversation],
) -> (Vec<Document>, ConversionStats) {
    let mut stats = ConversionStats::default();
    let Some(profile) = registry.department(department) else {
        stats.conversations = conversations.len();
        stats.skipped_unconfigured = conversations.len();
        tracing::warn!(department, "department not configured; nothing encoded");
        return (Vec::new(), stats);
    };
    let docs = encoder_for(spec).encode(conversations, profile, &mut stats);
    tracing::debug!(
        department,
        evaluator = %spec.name,
        encoding = spec.encoding.as_str(),
        documents = docs.len(),
        skipped = stats.skipped(),
        "conversations encoded"
    );
    (docs, stats)
}

/// Shared preparation and participant gating. Counts the conversation in `stats`.
pub fn prepare(
    conversation: &Conversation,
    profile: &DepartmentProfile,
    stats: &mut ConversionStats,
) -> Option<PreparedConversation> {
    stats.conversations += 1;
    let resolver = ToolCallResolver::new(&conversation.messages);

    let turns: Vec<Turn> = conversation
        .messages
        .iter()
        .filter(|m| {
            !matches!(
                m.message_type,
                MessageType::Transfer | MessageType::Private | MessageType::ToolResponse
            )
        })
        .map(|m| {
            let role = classify::classify(m.sender_role, m.skill.as_deref(), profile);
            let responder_id = match role {
                Role::Agent => Some(m.agent_id.clone().unwrap_or_else(|| "agent".to_string())),
                Role::ForeignBot => Some(FOREIGN_AGENT_ID.to_string()),
                _ => None,
            };
            let tool = (m.message_type == MessageType::ToolCall).then(|| resolver.resolve(m));
            Turn {
                sent_at: m.sent_at.clone(),
                role,
                responder_id,
                skill: m.skill.clone(),
                message_type: m.message_type,
                text: m.text.clone(),
                tool,
            }
        })
        .collect();

    let (mut turns, suppressed) = dedup::dedup_by(turns, Turn::signature);
    stats.duplicates_suppressed += suppressed;

    for turn in turns.iter_mut() {
        if turn.message_type == MessageType::Normal && turn.text.trim().is_empty() {
            turn.text = EMPTY_TEXT_PLACEHOLDER.to_string();
        }
    }

    if turns.is_empty() {
        stats.skipped_empty += 1;
        return None;
    }
    let has_responder = turns.iter().any(|t| t.role.is_responder());
    let has_consumer = turns.iter().any(|t| t.role == Role::Consumer);
    if !has_responder || !has_consumer {
        stats.skipped_missing_participants += 1;
        return None;
    }

    stats.encoded += 1;
    Some(PreparedConversation {
        id: conversation.id.clone(),
        customer_id: conversation.customer_id().map(str::to_string),
        last_skill: conversation.last_skill().map(str::to_string),
        started_at: conversation.started_at().unwrap_or_default().to_string(),
        turns,
    })
}
