//! Server-sent event decoding for the remote execution stream.

use serde_json::{Map, Value};

use super::{EventKind, StreamEvent, non_empty, obj_field, str_field};

/// One dispatched SSE block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub id: String,
    pub event: String,
    pub data: String,
}

/// Incremental SSE decoder. Accepts arbitrary byte chunks and yields a frame
/// per blank-line-terminated block that carried data.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    pending: SseFrame,
    has_data: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing block that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => self.pending.id = value.to_string(),
            "event" => self.pending.event = value.to_string(),
            "data" => {
                if self.has_data {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
                self.has_data = true;
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let frame = std::mem::take(&mut self.pending);
        let had_data = std::mem::take(&mut self.has_data);
        had_data.then_some(frame)
    }
}

/// Kind for an event name when the payload is not JSON.
fn kind_for_name(event_type: &str) -> EventKind {
    match event_type {
        "connected" | "status" | "history_complete" => EventKind::Status,
        "message" | "message_chunk" => EventKind::Output,
        "tool_started" => EventKind::ToolCall,
        "tool_completed" => EventKind::ToolResult,
        "thinking" | "reasoning" => EventKind::Reasoning,
        "error" => EventKind::Error,
        "done" | "complete" => EventKind::Done,
        _ => EventKind::Text,
    }
}

fn render_object(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_object).and_then(|m| serde_json::to_string(m).ok())
}

/// Map one remote SSE event to a canonical event.
///
/// Unrecognized event names become `text` events carrying their content, or
/// the raw data when there is none.
pub fn normalize_sse_event(event_type: &str, event_id: &str, data: &str) -> StreamEvent {
    let raw: Map<String, Value> = match serde_json::from_str::<Value>(data) {
        Ok(Value::Object(raw)) => raw,
        _ => {
            let mut event = StreamEvent::new(kind_for_name(event_type), data);
            attach_event_id(&mut event, event_id);
            return event;
        }
    };

    let mut event = match event_type {
        "connected" => {
            let content = non_empty(&raw, "execution_id")
                .map(|id| format!("Connected to execution: {id}"))
                .unwrap_or_default();
            StreamEvent::status(content, "connected")
        }

        "message" => {
            let mut event = StreamEvent::new(EventKind::Output, str_field(&raw, "content").unwrap_or_default());
            event.role = non_empty(&raw, "role").map(String::from);
            event
        }

        "message_chunk" => {
            let message = obj_field(&raw, "message");
            let content = message
                .and_then(|m| non_empty(m, "content"))
                .or_else(|| obj_field(&raw, "data").and_then(|d| non_empty(d, "content")))
                .or_else(|| non_empty(&raw, "content"))
                .unwrap_or_default();
            let mut event = StreamEvent::new(EventKind::Output, content);
            event.role = message.and_then(|m| non_empty(m, "role")).map(String::from);
            event
        }

        "tool_started" => {
            let data = obj_field(&raw, "data");
            let name = data
                .and_then(|d| non_empty(d, "tool_name"))
                .unwrap_or("tool")
                .to_string();
            let mut event = StreamEvent::new(EventKind::ToolCall, format!("Calling {name}"));
            event.tool_input = data.and_then(|d| {
                render_object(d.get("tool_arguments")).or_else(|| render_object(d.get("tool_input")))
            });
            event.tool_name = Some(name);
            event
        }

        "tool_completed" => {
            let data = obj_field(&raw, "data");
            let mut event = StreamEvent::new(EventKind::ToolResult, "");
            if let Some(data) = data {
                event.tool_name = non_empty(data, "tool_name").map(String::from);
                event.tool_output = match data.get("tool_output") {
                    Some(Value::String(s)) => Some(s.clone()),
                    other => render_object(other),
                };
                event.status = non_empty(data, "tool_status").map(String::from);
            }
            event.content = event.tool_output.clone().unwrap_or_default();
            event
        }

        "status" => {
            let state = match raw.get("status") {
                Some(Value::String(s)) => Some(s.as_str()),
                Some(Value::Object(obj)) => str_field(obj, "state"),
                _ => None,
            };
            match state {
                Some(state) => StreamEvent::status(format!("Status: {state}"), state),
                None => StreamEvent::new(EventKind::Status, ""),
            }
        }

        "error" => {
            let content = non_empty(&raw, "content")
                .or_else(|| non_empty(&raw, "error"))
                .unwrap_or_default();
            StreamEvent::error(content)
        }

        "done" | "complete" => StreamEvent::done(str_field(&raw, "content").unwrap_or_default()),

        "history_complete" => StreamEvent::status("", "history_loaded"),

        "thinking" | "reasoning" => {
            StreamEvent::new(EventKind::Reasoning, str_field(&raw, "content").unwrap_or_default())
        }

        _ => {
            let content = obj_field(&raw, "message")
                .and_then(|m| non_empty(m, "content"))
                .or_else(|| non_empty(&raw, "content"))
                .unwrap_or(data);
            StreamEvent::new(EventKind::Text, content)
        }
    };

    event = event.with_timestamp(str_field(&raw, "timestamp"));
    attach_event_id(&mut event, event_id);
    event
}

fn attach_event_id(event: &mut StreamEvent, event_id: &str) {
    if !event_id.is_empty() {
        let mut metadata = Map::new();
        metadata.insert("event_id".to_string(), Value::String(event_id.to_string()));
        event.metadata = Some(metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"id: 1\nevent: mess").is_empty());
        let frames = decoder.push(b"age\ndata: {\"content\":\"hi\"}\n\n: keepalive\n\nevent: done\r\ndata: {}\r\n\r\n");
        assert_eq!(
            frames,
            vec![
                SseFrame {
                    id: "1".into(),
                    event: "message".into(),
                    data: r#"{"content":"hi"}"#.into(),
                },
                SseFrame {
                    id: String::new(),
                    event: "done".into(),
                    data: "{}".into(),
                },
            ]
        );
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: one\ndata: two\n\n");
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn finish_flushes_unterminated_block() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: done\ndata: {}").is_empty());
        let frame = decoder.finish().unwrap();
        assert_eq!(frame.event, "done");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn tool_started_event() {
        let event = normalize_sse_event(
            "tool_started",
            "42",
            r#"{"data":{"tool_name":"grep","tool_input":{"pattern":"x"}}}"#,
        );
        assert_eq!(event.kind, EventKind::ToolCall);
        assert_eq!(event.tool_name.as_deref(), Some("grep"));
        assert_eq!(event.tool_input.as_deref(), Some(r#"{"pattern":"x"}"#));
        assert_eq!(event.metadata.unwrap()["event_id"], "42");
    }

    #[test]
    fn tool_completed_carries_status() {
        let event = normalize_sse_event(
            "tool_completed",
            "",
            r#"{"data":{"tool_name":"grep","tool_output":"3 matches","tool_status":"failed"}}"#,
        );
        assert_eq!(event.kind, EventKind::ToolResult);
        assert_eq!(event.tool_output.as_deref(), Some("3 matches"));
        assert_eq!(event.status.as_deref(), Some("failed"));
        assert!(event.metadata.is_none());
    }

    #[test]
    fn message_chunk_prefers_message_content() {
        let event = normalize_sse_event(
            "message_chunk",
            "",
            r#"{"message":{"content":"hello","role":"assistant"},"timestamp":"2024-05-01T00:00:00Z"}"#,
        );
        assert_eq!(event.kind, EventKind::Output);
        assert_eq!(event.content, "hello");
        assert_eq!(event.role.as_deref(), Some("assistant"));
        assert_eq!(event.timestamp, "2024-05-01T00:00:00Z");
    }

    #[test]
    fn status_and_history() {
        let event = normalize_sse_event("status", "", r#"{"status":{"state":"completed"}}"#);
        assert_eq!(event.status.as_deref(), Some("completed"));
        let event = normalize_sse_event("history_complete", "", "{}");
        assert_eq!(event.status.as_deref(), Some("history_loaded"));
    }

    #[test]
    fn non_json_data_keeps_raw_content() {
        let event = normalize_sse_event("error", "", "upstream exploded");
        assert_eq!(event.kind, EventKind::Error);
        assert_eq!(event.content, "upstream exploded");
    }

    #[test]
    fn unknown_event_passes_through_as_text() {
        let event = normalize_sse_event("usage_update", "7", r#"{"tokens":12}"#);
        assert_eq!(event.kind, EventKind::Text);
        assert_eq!(event.content, r#"{"tokens":12}"#);
        assert_eq!(event.metadata.unwrap()["event_id"], "7");

        let event = normalize_sse_event("custom", "", r#"{"content":"visible"}"#);
        assert_eq!(event.kind, EventKind::Text);
        assert_eq!(event.content, "visible");
    }
}
