//! Linear dialogue: one `<role>: <text>` line per retained message.

use super::{ConversationEncoder, ConversionStats, Document, DocumentBody, PreparedConversation};
use crate::core::config::{DepartmentProfile, EncodingVariant, ToolRendering};
use crate::core::message::Conversation;

pub struct LinearDialogueEncoder {
    tools: ToolRendering,
}

impl LinearDialogueEncoder {
    pub fn new(tools: ToolRendering) -> Self {
        Self { tools }
    }
}

/// Header, dialogue lines, footer.
pub fn render_dialogue(conversation: &PreparedConversation, tools: ToolRendering) -> String {
    let mut out = Vec::with_capacity(conversation.turns.len() + 2);
    out.push(format!("--- Conversation {} ---", conversation.id));
    out.extend(conversation.turns.iter().map(|t| t.render_line(tools)));
    out.push("--- End of conversation ---".to_string());
    out.join("\n")
}

impl ConversationEncoder for LinearDialogueEncoder {
    fn variant(&self) -> EncodingVariant {
        EncodingVariant::LinearDialogue
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
                body: DocumentBody::Text(render_dialogue(&prepared, self.tools)),
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
