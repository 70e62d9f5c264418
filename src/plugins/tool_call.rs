//! Pairs a tool-call message with its response by call id.
//!
//! Malformed payloads never raise: anything that cannot be read degrades to
//! `None`, and the caller renders the event with `UNKNOWN_TOOL`.

use crate::core::message::{Message, MessageType};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;

pub const UNKNOWN_TOOL: &str = "unknown_tool";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Response,
    Arguments,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolResolution {
    pub name: Option<String>,
    pub content: Option<String>,
    pub source: ResolutionSource,
}

impl ToolResolution {
    fn not_found() -> Self {
        Self {
            name: None,
            content: None,
            source: ResolutionSource::NotFound,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_TOOL)
    }
}

/// First call descriptor of a tool-call payload.
#[derive(Debug, Clone, PartialEq)]
struct CallDescriptor {
    name: Option<String>,
    call_id: Option<String>,
    arguments: Option<Value>,
}

/// Resolves tool calls against one conversation's full message list.
///
/// Responses are indexed once, so resolving every call in a conversation is linear.
pub struct ToolCallResolver {
    responses: FxHashMap<String, String>,
}

impl ToolCallResolver {
    pub fn new(conversation: &[Message]) -> Self {
        let mut responses = FxHashMap::default();
        for m in conversation
            .iter()
            .filter(|m| m.message_type == MessageType::ToolResponse)
        {
            let Ok(payload) = serde_json::from_str::<Value>(&m.text) else {
                continue;
            };
            for descriptor in descriptors(&payload) {
                if let Some(id) = call_id_of(descriptor) {
                    // First response for an id wins.
                    responses
                        .entry(id)
                        .or_insert_with(|| response_content(descriptor));
                }
            }
        }
        Self { responses }
    }

    pub fn resolve(&self, call: &Message) -> ToolResolution {
        let Some(descriptor) = first_call_descriptor(&call.text) else {
            return ToolResolution::not_found();
        };
        if descriptor.name.is_none() && descriptor.call_id.is_none() {
            return ToolResolution::not_found();
        }

        if let Some(content) = descriptor
            .call_id
            .as_ref()
            .and_then(|id| self.responses.get(id))
        {
            return ToolResolution {
                name: descriptor.name,
                content: Some(content.clone()),
                source: ResolutionSource::Response,
            };
        }

        match descriptor.arguments {
            Some(args) => ToolResolution {
                name: descriptor.name,
                content: Some(value_to_text(&args)),
                source: ResolutionSource::Arguments,
            },
            None if descriptor.name.is_some() => ToolResolution {
                name: descriptor.name,
                content: None,
                source: ResolutionSource::NotFound,
            },
            None => ToolResolution::not_found(),
        }
    }
}

/// Resolve a single call without building a reusable index.
pub fn resolve_tool_call(call: &Message, conversation: &[Message]) -> ToolResolution {
    ToolCallResolver::new(conversation).resolve(call)
}

fn first_call_descriptor(text: &str) -> Option<CallDescriptor> {
    let payload: Value = serde_json::from_str(text).ok()?;
    let descriptor = descriptors(&payload).into_iter().next()?;
    let function = descriptor.get("function");
    let name = descriptor
        .get("name")
        .or_else(|| function.and_then(|f| f.get("name")))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string);
    let arguments = descriptor
        .get("arguments")
        .or_else(|| function.and_then(|f| f.get("arguments")))
        .or_else(|| descriptor.get("args"))
        .filter(|v| !v.is_null())
        .map(parse_embedded_json);
    Some(CallDescriptor {
        name,
        call_id: call_id_of(descriptor),
        arguments,
    })
}

/// Descriptors of a payload: `{tool_calls: [...]}`, a bare array, or one object.
fn descriptors(payload: &Value) -> Vec<&Value> {
    if let Some(calls) = payload.get("tool_calls").and_then(Value::as_array) {
        return calls.iter().filter(|v| v.is_object()).collect();
    }
    if let Some(items) = payload.as_array() {
        return items.iter().filter(|v| v.is_object()).collect();
    }
    if payload.is_object() {
        return vec![payload];
    }
    Vec::new()
}

fn call_id_of(descriptor: &Value) -> Option<String> {
    ["tool_call_id", "call_id", "id"]
        .iter()
        .find_map(|k| descriptor.get(*k))
        .and_then(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn response_content(descriptor: &Value) -> String {
    match descriptor.get("content").or_else(|| descriptor.get("output")) {
        Some(v) => value_to_text(v),
        None => value_to_text(descriptor),
    }
}

/// Arguments often arrive as a JSON document inside a string.
fn parse_embedded_json(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
