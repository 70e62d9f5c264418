//! Grouped-by-identity encoding: every conversation of one customer in the window,
//! rendered as linear dialogue and concatenated under a chat-count header.
//!
//! The caller supplies the multi-day window; conversations without a customer
//! identity form their own single-chat group. Their documents are keyed
//! `conversation:<id>` so they never share a key with a customer.

use super::linear::render_dialogue;
use super::{ConversationEncoder, ConversionStats, Document, DocumentBody, PreparedConversation};
use crate::core::config::{DepartmentProfile, EncodingVariant, ToolRendering};
use crate::core::message::Conversation;
use std::collections::BTreeMap;

const ANONYMOUS_PREFIX: &str = "conversation:";

/// Customers and anonymous conversations live in separate key spaces.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    Customer(String),
    Conversation(String),
}

impl GroupKey {
    fn document_id(&self) -> String {
        match self {
            GroupKey::Customer(id) => id.clone(),
            GroupKey::Conversation(id) => format!("{}{}", ANONYMOUS_PREFIX, id),
        }
    }

    fn header(&self, chats: usize) -> String {
        let noun = if chats == 1 { "chat" } else { "chats" };
        match self {
            GroupKey::Customer(id) => format!("=== Customer {}: {} {} ===", id, chats, noun),
            GroupKey::Conversation(id) => format!("=== Conversation {}: {} {} ===", id, chats, noun),
        }
    }
}

pub struct GroupedByIdentityEncoder {
    tools: ToolRendering,
}

impl GroupedByIdentityEncoder {
    pub fn new(tools: ToolRendering) -> Self {
        Self { tools }
    }

    fn render_group(&self, key: &GroupKey, members: &[PreparedConversation]) -> String {
        let mut out = vec![key.header(members.len())];
        out.extend(members.iter().map(|m| render_dialogue(m, self.tools)));
        out.join("\n\n")
    }
}

impl ConversationEncoder for GroupedByIdentityEncoder {
    fn variant(&self) -> EncodingVariant {
        EncodingVariant::GroupedByIdentity
    }

    fn encode(
        &self,
        conversations: &[Conversation],
        profile: &DepartmentProfile,
        stats: &mut ConversionStats,
    ) -> Vec<Document> {
        let mut groups: BTreeMap<GroupKey, Vec<PreparedConversation>> = BTreeMap::new();
        for prepared in conversations
            .iter()
            .filter_map(|c| super::prepare(c, profile, stats))
        {
            let key = match &prepared.customer_id {
                Some(customer) => GroupKey::Customer(customer.clone()),
                None => GroupKey::Conversation(prepared.id.clone()),
            };
            groups.entry(key).or_default().push(prepared);
        }

        let docs: Vec<Document> = groups
            .into_iter()
            .map(|(key, mut members)| {
                members.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
                Document {
                    body: DocumentBody::Text(self.render_group(&key, &members)),
                    customer_id: members.iter().find_map(|m| m.customer_id.clone()),
                    last_skill: members.iter().rev().find_map(|m| m.last_skill.clone()),
                    member_ids: members.iter().map(|m| m.id.clone()).collect(),
                    segment_index: 0,
                    conversation_id: key.document_id(),
                }
            })
            .collect();
        stats.record_documents(&docs);
        docs
    }
}
