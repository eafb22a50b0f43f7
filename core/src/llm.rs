//! The language model as an opaque capability.
//!
//! The engine only ever sends an ordered list of chat messages and receives
//! text back. Whether that text is free prose or a JSON plan is decided by the
//! caller through `json_mode`. The HTTP implementation lives in the API crate;
//! tests use a scripted double.

use std::future::Future;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    /// Ask the model for a single JSON object instead of prose.
    pub json_mode: bool,
}

pub trait ChatModel: Send + Sync {
    fn chat(
        &self,
        request: &ChatRequest,
    ) -> impl Future<Output = Result<String, LlmError>> + Send;
}

/// Keep a leading system message (if any) plus the last `turn_limit`
/// user/assistant turns. Other system messages inside the history are dropped.
pub fn bound_history(history: &[ChatMessage], turn_limit: usize) -> Vec<ChatMessage> {
    let mut bounded = Vec::new();
    if let Some(first) = history.first()
        && first.role == Role::System
    {
        bounded.push(first.clone());
    }

    let dialogue: Vec<&ChatMessage> = history
        .iter()
        .filter(|message| message.role != Role::System)
        .collect();
    let keep = turn_limit.saturating_mul(2);
    let start = dialogue.len().saturating_sub(keep);
    bounded.extend(dialogue[start..].iter().map(|message| (*message).clone()));
    bounded
}

/// Best-effort extraction of the JSON object inside a model reply that may
/// be wrapped in prose or code fences.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}
