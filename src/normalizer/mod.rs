//! Event normalizer. Maps heterogeneous execution output into one event taxonomy.
//!
//! Three sources feed it:
//! - JSON lines printed by a local CLI subprocess ([`json`])
//! - plain text lines from the same subprocess, filtered for noise ([`text`])
//! - server-sent events from the remote execution API ([`sse`])
//!
//! All of them produce [`StreamEvent`]s, which chat sessions further convert
//! into [`ChatEvent`]s.

pub mod chat;
pub mod json;
pub mod sse;
pub mod text;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use chat::{ChatEvent, ChatEventKind, to_chat_event};
pub use json::normalize_json_line;
pub use sse::{SseDecoder, SseFrame, normalize_sse_event};
pub use text::{NoiseFilter, OutputFormat, OutputStream, classify_line, strip_ansi};

/// Canonical event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    Text,
    Output,
    ToolCall,
    ToolResult,
    Reasoning,
    Plan,
    Error,
    Done,
}

/// One normalized execution event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub content: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl StreamEvent {
    /// New event stamped with the current time.
    pub fn new(kind: EventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: now_rfc3339(),
            tool_name: None,
            tool_input: None,
            tool_output: None,
            status: None,
            role: None,
            metadata: None,
        }
    }

    pub fn status(content: impl Into<String>, status: &str) -> Self {
        Self::new(EventKind::Status, content).with_status(status)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(EventKind::Error, content)
    }

    pub fn done(content: impl Into<String>) -> Self {
        Self::new(EventKind::Done, content)
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }

    /// Use an upstream timestamp when one was supplied.
    pub fn with_timestamp(mut self, timestamp: Option<&str>) -> Self {
        if let Some(ts) = timestamp.filter(|t| !t.is_empty()) {
            self.timestamp = ts.to_string();
        }
        self
    }

    /// `done` and `error` end a relay.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Done | EventKind::Error)
    }

    /// Whether the event carries anything worth relaying.
    pub fn has_payload(&self) -> bool {
        !self.content.is_empty() || self.tool_name.as_deref().is_some_and(|n| !n.is_empty())
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// String field of a JSON object, if present and a string.
pub(crate) fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Non-empty string field.
pub(crate) fn non_empty<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    str_field(obj, key).filter(|s| !s.is_empty())
}

pub(crate) fn obj_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    obj.get(key).and_then(Value::as_object)
}

/// Truncate to at most `max` characters, appending `...` when cut.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_snake_case_type() {
        let event = StreamEvent::status("Starting", "starting");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "starting");
        assert!(json.get("tool_name").is_none());
    }

    #[test]
    fn terminal_kinds() {
        assert!(StreamEvent::done("ok").is_terminal());
        assert!(StreamEvent::error("boom").is_terminal());
        assert!(!StreamEvent::new(EventKind::Output, "x").is_terminal());
    }

    #[test]
    fn truncate_counts_chars() {
        assert_eq!(truncate("héllo", 10), "héllo");
        assert_eq!(truncate("héllo", 2), "hé...");
    }
}
