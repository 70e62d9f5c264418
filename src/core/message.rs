//! Raw chat events and the conversations materialized from them.

use crate::core::time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Bot,
    Agent,
    Consumer,
    System,
}

impl SenderRole {
    /// Unknown senders are treated as system traffic.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bot" | "virtual_agent" | "automation" => SenderRole::Bot,
            "agent" | "human_agent" => SenderRole::Agent,
            "consumer" | "customer" | "user" | "visitor" => SenderRole::Consumer,
            _ => SenderRole::System,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SenderRole::Bot => "bot",
            SenderRole::Agent => "agent",
            SenderRole::Consumer => "consumer",
            SenderRole::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Normal,
    ToolCall,
    ToolResponse,
    Transfer,
    Private,
}

impl MessageType {
    /// Unknown types are treated as normal text.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "tool-call" | "tool" | "function-call" => MessageType::ToolCall,
            "tool-response" | "tool-result" | "function-response" => MessageType::ToolResponse,
            "transfer" => MessageType::Transfer,
            "private" | "private-message" | "whisper" => MessageType::Private,
            _ => MessageType::Normal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Normal => "normal",
            MessageType::ToolCall => "tool-call",
            MessageType::ToolResponse => "tool-response",
            MessageType::Transfer => "transfer",
            MessageType::Private => "private",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub conversation_id: String,
    pub sent_at: String,
    pub sender_role: SenderRole,
    pub skill: Option<String>,
    pub message_type: MessageType,
    pub text: String,
    pub customer_id: Option<String>,
    pub agent_id: Option<String>,
    /// Ingestion order; breaks `sent_at` ties.
    pub seq: u64,
}

impl Message {
    pub fn new(
        conversation_id: &str,
        sent_at: &str,
        sender_role: SenderRole,
        message_type: MessageType,
        text: &str,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            sent_at: time::normalize_timestamp(sent_at),
            sender_role,
            skill: None,
            message_type,
            text: text.to_string(),
            customer_id: None,
            agent_id: None,
            seq: 0,
        }
    }

    pub fn with_skill(mut self, skill: &str) -> Self {
        self.skill = Some(skill.to_string());
        self
    }

    pub fn with_customer(mut self, customer_id: &str) -> Self {
        self.customer_id = Some(customer_id.to_string());
        self
    }

    pub fn with_agent(mut self, agent_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }
}

/// Messages sharing a conversation id, in (sent_at, seq) order.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: &str, mut messages: Vec<Message>) -> Self {
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.seq.cmp(&b.seq)));
        Self {
            id: id.to_string(),
            messages,
        }
    }

    /// First customer identity carried by any message.
    pub fn customer_id(&self) -> Option<&str> {
        self.messages
            .iter()
            .find_map(|m| m.customer_id.as_deref().filter(|c| !c.trim().is_empty()))
    }

    /// Last skill observed on any message.
    pub fn last_skill(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find_map(|m| m.skill.as_deref().filter(|s| !s.trim().is_empty()))
    }

    pub fn participants(&self) -> Vec<SenderRole> {
        let mut roles: Vec<SenderRole> = Vec::new();
        for m in &self.messages {
            if !roles.contains(&m.sender_role) {
                roles.push(m.sender_role);
            }
        }
        roles
    }

    pub fn started_at(&self) -> Option<&str> {
        self.messages.first().map(|m| m.sent_at.as_str())
    }
}

/// Group messages by conversation id. Output is ordered by conversation id.
pub fn group_conversations(messages: Vec<Message>) -> Vec<Conversation> {
    let mut grouped: BTreeMap<String, Vec<Message>> = BTreeMap::new();
    for m in messages {
        grouped.entry(m.conversation_id.clone()).or_default().push(m);
    }
    grouped
        .into_iter()
        .map(|(id, msgs)| Conversation::new(&id, msgs))
        .collect()
}
