//! Per-segment encoding: one document per bot-owned responder run.
//!
//! A run is owned by the first responder that speaks in it; consumer and system
//! turns join the current run, or the next one if no responder has spoken yet.
//! A run ends when the responder identity changes (bot vs a specific agent).
//! Only bot-owned runs with at least one consumer turn become documents.

use super::{ConversationEncoder, ConversionStats, Document, DocumentBody, Turn};
use crate::core::config::{DepartmentProfile, EncodingVariant, SegmentOptions, ToolRendering};
use crate::core::message::Conversation;
use crate::plugins::classify::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkingState {
    Off,
    Marking,
}

/// Tags turns after the marker skill appears, until a long skill name takes over.
///
/// Entry: state is `Off` and the active skill equals the marker skill.
/// Exit: state is `Marking` and the active skill is at least the threshold long.
/// The active skill is the last skill seen on any turn.
#[derive(Debug)]
pub struct MarkingMachine<'a> {
    options: &'a SegmentOptions,
    state: MarkingState,
    active_skill: Option<String>,
}

impl<'a> MarkingMachine<'a> {
    pub fn new(options: &'a SegmentOptions) -> Self {
        Self {
            options,
            state: MarkingState::Off,
            active_skill: None,
        }
    }

    pub fn state(&self) -> MarkingState {
        self.state
    }

    /// Advance on one turn's skill; returns whether that turn is tagged.
    pub fn step(&mut self, skill: Option<&str>) -> bool {
        if let Some(s) = skill.filter(|s| !s.trim().is_empty()) {
            self.active_skill = Some(s.to_string());
        }
        let Some(active) = self.active_skill.as_deref() else {
            return false;
        };
        if self.state == MarkingState::Off && self.options.marker_skill.as_deref() == Some(active) {
            self.state = MarkingState::Marking;
        }
        if self.state == MarkingState::Marking
            && active.chars().count() >= self.options.skill_length_threshold
        {
            self.state = MarkingState::Off;
        }
        self.state == MarkingState::Marking
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Owner {
    Bot,
    Agent(String),
}

fn owner_of(turn: &Turn) -> Option<Owner> {
    match turn.role {
        Role::TargetBot => Some(Owner::Bot),
        Role::Agent | Role::ForeignBot => Some(Owner::Agent(
            turn.responder_id.clone().unwrap_or_default(),
        )),
        Role::Consumer | Role::System => None,
    }
}

struct Run {
    owner: Option<Owner>,
    lines: Vec<String>,
    has_consumer: bool,
    last_skill: Option<String>,
}

impl Run {
    fn new() -> Self {
        Self {
            owner: None,
            lines: Vec::new(),
            has_consumer: false,
            last_skill: None,
        }
    }
}

pub struct PerSegmentEncoder {
    tools: ToolRendering,
}

impl PerSegmentEncoder {
    pub fn new(tools: ToolRendering) -> Self {
        Self { tools }
    }

    fn split(&self, turns: &[Turn], options: &SegmentOptions) -> Vec<Run> {
        let mut machine = MarkingMachine::new(options);
        let mut runs = Vec::new();
        let mut current = Run::new();

        for turn in turns {
            let tagged = machine.step(turn.skill.as_deref());
            if let Some(owner) = owner_of(turn) {
                if current.owner.as_ref().is_some_and(|existing| *existing != owner) {
                    runs.push(std::mem::replace(&mut current, Run::new()));
                }
                if current.owner.is_none() {
                    current.owner = Some(owner);
                }
            }
            if turn.role == Role::Consumer {
                current.has_consumer = true;
            }
            if let Some(skill) = &turn.skill {
                current.last_skill = Some(skill.clone());
            }
            let line = turn.render_line(self.tools);
            current.lines.push(if tagged {
                tag_line(&line, turn.label(), &options.tag)
            } else {
                line
            });
        }
        if !current.lines.is_empty() {
            runs.push(current);
        }
        runs
    }
}

/// `Bot: hi` becomes `Bot [tag]: hi`.
fn tag_line(line: &str, label: &str, tag: &str) -> String {
    match line.strip_prefix(label) {
        Some(rest) => format!("{} [{}]{}", label, tag, rest),
        None => line.to_string(),
    }
}

impl ConversationEncoder for PerSegmentEncoder {
    fn variant(&self) -> EncodingVariant {
        EncodingVariant::PerSegment
    }

    fn encode(
        &self,
        conversations: &[Conversation],
        profile: &DepartmentProfile,
        stats: &mut ConversionStats,
    ) -> Vec<Document> {
        let mut docs = Vec::new();
        for conversation in conversations {
            let Some(prepared) = super::prepare(conversation, profile, stats) else {
                continue;
            };
            for (index, run) in self.split(&prepared.turns, &profile.segment).into_iter().enumerate() {
                if run.owner != Some(Owner::Bot) || !run.has_consumer {
                    continue;
                }
                let mut body = Vec::with_capacity(run.lines.len() + 1);
                body.push(format!("--- Conversation {} / segment {} ---", prepared.id, index));
                body.extend(run.lines);
                docs.push(Document {
                    conversation_id: prepared.id.clone(),
                    segment_index: index as u32,
                    customer_id: prepared.customer_id.clone(),
                    last_skill: run.last_skill.or_else(|| prepared.last_skill.clone()),
                    member_ids: vec![prepared.id.clone()],
                    body: DocumentBody::Text(body.join("\n")),
                });
            }
        }
        stats.record_documents(&docs);
        docs
    }
}
