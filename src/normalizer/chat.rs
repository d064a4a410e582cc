//! Chat-facing event shape and conversion from execution events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EventKind, StreamEvent, now_rfc3339};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatEventKind {
    Connected,
    MessageStart,
    ContentDelta,
    Thinking,
    ToolCall,
    ToolResult,
    MessageEnd,
    Error,
    Done,
}

/// Event delivered to chat subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    #[serde(rename = "type")]
    pub kind: ChatEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    pub timestamp: String,
}

impl ChatEvent {
    pub fn new(kind: ChatEventKind) -> Self {
        Self {
            kind,
            content: None,
            message_id: None,
            role: None,
            tool_call_id: None,
            name: None,
            input: None,
            output: None,
            is_error: false,
            timestamp: now_rfc3339(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_string());
        self
    }
}

/// Convert an execution event into a chat event. Kinds with no chat
/// counterpart (plain text, plan, non-final status) yield `None`.
pub fn to_chat_event(event: &StreamEvent, message_id: &str) -> Option<ChatEvent> {
    let base = |kind| {
        let mut chat = ChatEvent::new(kind).with_message_id(message_id);
        chat.timestamp = event.timestamp.clone();
        chat
    };

    let chat = match event.kind {
        EventKind::Output => {
            let mut chat = base(ChatEventKind::ContentDelta).with_content(event.content.clone());
            chat.role = Some(event.role.clone().unwrap_or_else(|| "assistant".to_string()));
            chat
        }
        EventKind::ToolCall => {
            let mut chat = base(ChatEventKind::ToolCall);
            chat.tool_call_id = Some(format!("tool-{}", Uuid::new_v4().simple()));
            chat.name = event.tool_name.clone();
            chat.input = event.tool_input.clone();
            chat
        }
        EventKind::ToolResult => {
            let mut chat = base(ChatEventKind::ToolResult);
            chat.name = event.tool_name.clone();
            chat.output = event.tool_output.clone().or_else(|| Some(event.content.clone()));
            chat.is_error = matches!(event.status.as_deref(), Some("error" | "failed"));
            chat
        }
        EventKind::Reasoning => base(ChatEventKind::Thinking).with_content(event.content.clone()),
        EventKind::Status => match event.status.as_deref() {
            Some("completed" | "done") => base(ChatEventKind::MessageEnd),
            _ => return None,
        },
        EventKind::Error => base(ChatEventKind::Error).with_content(event.content.clone()),
        EventKind::Done => base(ChatEventKind::Done).with_content(event.content.clone()),
        EventKind::Text | EventKind::Plan => return None,
    };
    Some(chat)
}
