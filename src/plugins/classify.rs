//! Skill classifier: who is speaking, from the department's point of view.

use crate::core::config::DepartmentProfile;
use crate::core::message::SenderRole;
use serde::Serialize;

/// Identity given to bots that are not the department's own.
pub const FOREIGN_AGENT_ID: &str = "foreign-bot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    TargetBot,
    ForeignBot,
    Agent,
    Consumer,
    System,
}

impl Role {
    /// Label used in encoded dialogue. Foreign bots read as agents.
    pub fn label(self) -> &'static str {
        match self {
            Role::TargetBot => "Bot",
            Role::ForeignBot | Role::Agent => "Agent",
            Role::Consumer => "Consumer",
            Role::System => "System",
        }
    }

    /// Bots and agents answer the consumer.
    pub fn is_responder(self) -> bool {
        matches!(self, Role::TargetBot | Role::ForeignBot | Role::Agent)
    }
}

pub fn classify(sender: SenderRole, skill: Option<&str>, profile: &DepartmentProfile) -> Role {
    match sender {
        SenderRole::Bot => match skill {
            Some(s) if profile.bot_skills.contains(s) => Role::TargetBot,
            _ => Role::ForeignBot,
        },
        SenderRole::Agent => Role::Agent,
        SenderRole::Consumer => Role::Consumer,
        SenderRole::System => Role::System,
    }
}

/// Whether an agent message was routed through one of the department's agent skills.
pub fn is_department_agent(skill: Option<&str>, profile: &DepartmentProfile) -> bool {
    skill.is_some_and(|s| profile.agent_skills.contains(s))
}
