//! Structured-object encoding: a nested JSON record per conversation.

use super::{ConversationEncoder, ConversionStats, Document, DocumentBody, PreparedConversation};
use crate::core::config::{DepartmentProfile, EncodingVariant, ToolRendering};
use crate::core::message::Conversation;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct StructuredConversation<'a> {
    customer_id: Option<&'a str>,
    conversation_id: &'a str,
    turns: Vec<StructuredTurn<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StructuredTurn<'a> {
    Message {
        timestamp: &'a str,
        sender: &'static str,
        text: &'a str,
    },
    /// Tool turns are always attributed to the bot.
    Tool {
        timestamp: &'a str,
        sender: &'static str,
        tool_name: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_content: Option<&'a str>,
    },
}

pub struct StructuredObjectEncoder {
    tools: ToolRendering,
}

impl StructuredObjectEncoder {
    pub fn new(tools: ToolRendering) -> Self {
        Self { tools }
    }

    pub fn to_value(&self, conversation: &PreparedConversation) -> serde_json::Value {
        let turns = conversation
            .turns
            .iter()
            .map(|t| match &t.tool {
                Some(resolution) if t.is_tool() => StructuredTurn::Tool {
                    timestamp: &t.sent_at,
                    sender: "bot",
                    tool_name: resolution.display_name(),
                    tool_content: match self.tools {
                        ToolRendering::WithContent => resolution.content.as_deref(),
                        ToolRendering::NameOnly => None,
                    },
                },
                _ => StructuredTurn::Message {
                    timestamp: &t.sent_at,
                    sender: t.label(),
                    text: &t.text,
                },
            })
            .collect();
        let record = StructuredConversation {
            customer_id: conversation.customer_id.as_deref(),
            conversation_id: &conversation.id,
            turns,
        };
        serde_json::to_value(record).unwrap_or(serde_json::Value::Null)
    }
}

impl ConversationEncoder for StructuredObjectEncoder {
    fn variant(&self) -> EncodingVariant {
        EncodingVariant::StructuredObject
    }

    fn encode(
        &self,
        conversations: &[Conversation],
        profile: &DepartmentProfile,
        stats: &mut ConversionStats,
    ) -> Vec<Document> {
        let docs: Vec<Document> = conversations
            .iter()
            .filter_map(|c| super::prepare(c, profile, stats))
            .map(|prepared| Document {
                body: DocumentBody::Structured(self.to_value(&prepared)),
                conversation_id: prepared.id.clone(),
                segment_index: 0,
                customer_id: prepared.customer_id.clone(),
                last_skill: prepared.last_skill.clone(),
                member_ids: vec![prepared.id],
            })
            .collect();
        stats.record_documents(&docs);
        docs
    }
}
