//! JSON-line normalization for CLI streaming output.

use serde_json::{Map, Value};

use super::{EventKind, StreamEvent, non_empty, obj_field, str_field, truncate};

type Object = Map<String, Value>;

/// Tool invocation fields found in one region of a payload.
#[derive(Debug, Default)]
struct ToolCallFields {
    name: Option<String>,
    input: Option<String>,
}

/// Tool result fields found in one region of a payload.
#[derive(Debug, Default)]
struct ToolResultFields {
    name: Option<String>,
    output: Option<String>,
    is_error: bool,
}

type CallExtractor = fn(&Object) -> ToolCallFields;
type ResultExtractor = fn(&Object) -> ToolResultFields;

/// Tried in order; the first one that yields a name wins.
const CALL_EXTRACTORS: &[CallExtractor] = &[
    call_from_tool,
    call_from_data,
    call_from_tool_call,
    call_from_content,
    call_from_top_level,
];

/// Tried in order; each field is taken from the first extractor that has it.
const RESULT_EXTRACTORS: &[ResultExtractor] = &[
    result_from_tool,
    result_from_data,
    result_from_result,
    result_from_content,
    result_from_top_level,
];

/// Render a JSON object (or, when allowed, a string) as tool input/output text.
fn render(value: Option<&Value>, allow_string: bool) -> Option<String> {
    match value? {
        Value::Object(map) => serde_json::to_string(map).ok(),
        Value::String(s) if allow_string && !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn first_name(obj: &Object, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| non_empty(obj, k)).map(String::from)
}

// ── Tool call extractors ────────────────────────────────────────────────

fn call_from_tool(raw: &Object) -> ToolCallFields {
    let Some(tool) = obj_field(raw, "tool") else {
        return ToolCallFields::default();
    };
    ToolCallFields {
        name: first_name(tool, &["name"]),
        input: render(tool.get("input"), true),
    }
}

fn call_from_data(raw: &Object) -> ToolCallFields {
    let Some(data) = obj_field(raw, "data") else {
        return ToolCallFields::default();
    };
    let input = render(data.get("tool_input"), false)
        .or_else(|| render(data.get("input"), false))
        .or_else(|| render(data.get("tool_arguments"), false))
        .or_else(|| render(data.get("tool_input"), true));
    ToolCallFields {
        name: first_name(data, &["tool_name", "name"]),
        input,
    }
}

fn call_from_tool_call(raw: &Object) -> ToolCallFields {
    let Some(tc) = obj_field(raw, "tool_call") else {
        return ToolCallFields::default();
    };
    ToolCallFields {
        name: first_name(tc, &["name"]),
        input: render(tc.get("input"), true),
    }
}

fn call_from_content(raw: &Object) -> ToolCallFields {
    let Some(content) = obj_field(raw, "content") else {
        return ToolCallFields::default();
    };
    ToolCallFields {
        name: first_name(content, &["name"]),
        input: render(content.get("input"), false),
    }
}

fn call_from_top_level(raw: &Object) -> ToolCallFields {
    ToolCallFields {
        name: first_name(raw, &["tool_name", "name"]),
        input: render(raw.get("tool_input"), true).or_else(|| render(raw.get("input"), false)),
    }
}

fn extract_tool_call(raw: &Object) -> (String, Option<String>) {
    let mut name = None;
    let mut input = None;
    let mut fallback_input = None;

    for extract in CALL_EXTRACTORS {
        let fields = extract(raw);
        if name.is_none() && fields.name.is_some() {
            name = fields.name;
            input = fields.input;
        } else if fallback_input.is_none() {
            fallback_input = fields.input;
        }
    }

    (
        name.unwrap_or_else(|| "tool".to_string()),
        input.or(fallback_input),
    )
}

// ── Tool result extractors ──────────────────────────────────────────────

fn result_from_tool(raw: &Object) -> ToolResultFields {
    let Some(tool) = obj_field(raw, "tool") else {
        return ToolResultFields::default();
    };
    ToolResultFields {
        name: first_name(tool, &["name"]),
        output: render(tool.get("output"), true),
        is_error: tool.get("success").and_then(Value::as_bool) == Some(false),
    }
}

fn result_from_data(raw: &Object) -> ToolResultFields {
    let Some(data) = obj_field(raw, "data") else {
        return ToolResultFields::default();
    };
    let error = non_empty(data, "error").map(String::from);
    let output = error.clone().or_else(|| {
        render(data.get("tool_output"), true).or_else(|| render(data.get("output"), true))
    });
    ToolResultFields {
        name: first_name(data, &["tool_name", "name"]),
        output,
        is_error: error.is_some() || str_field(data, "tool_status") == Some("error"),
    }
}

fn result_from_result(raw: &Object) -> ToolResultFields {
    let Some(result) = obj_field(raw, "result") else {
        return ToolResultFields::default();
    };
    if let Some(error) = non_empty(result, "error") {
        return ToolResultFields {
            name: None,
            output: Some(error.to_string()),
            is_error: true,
        };
    }
    let output = match str_field(result, "output") {
        Some(s) => Some(s.to_string()).filter(|s| !s.is_empty()),
        None => serde_json::to_string(result).ok(),
    };
    ToolResultFields {
        name: None,
        output,
        is_error: false,
    }
}

fn result_from_content(raw: &Object) -> ToolResultFields {
    ToolResultFields {
        output: non_empty(raw, "content").map(String::from),
        ..Default::default()
    }
}

fn result_from_top_level(raw: &Object) -> ToolResultFields {
    ToolResultFields {
        name: first_name(raw, &["tool_name", "name"]),
        output: non_empty(raw, "tool_output").map(String::from),
        is_error: str_field(raw, "status") == Some("error"),
    }
}

fn extract_tool_result(raw: &Object) -> ToolResultFields {
    let mut merged = ToolResultFields::default();
    for extract in RESULT_EXTRACTORS {
        let fields = extract(raw);
        if merged.name.is_none() {
            merged.name = fields.name;
        }
        if merged.output.is_none() {
            merged.output = fields.output;
        }
        merged.is_error |= fields.is_error;
    }
    merged
}

// ── Dispatch ────────────────────────────────────────────────────────────

/// Normalize one line of CLI output.
///
/// Non-JSON lines become `text` events carrying the raw line. Returns `None`
/// only for payloads that deliberately carry nothing (empty message chunks).
pub fn normalize_json_line(line: &str) -> Option<StreamEvent> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(raw)) => normalize_object(&raw),
        _ => Some(StreamEvent::new(EventKind::Text, line)),
    }
}

/// Normalize an already-parsed JSON object.
pub fn normalize_object(raw: &Object) -> Option<StreamEvent> {
    let event_type = str_field(raw, "type").unwrap_or_default();
    let timestamp = str_field(raw, "timestamp");
    let raw_json = || serde_json::to_string(raw).unwrap_or_default();
    let text_of = |keys: &[&str]| first_name(raw, keys).unwrap_or_default();

    let event = match event_type {
        "connected" => {
            let content = match non_empty(raw, "execution_id") {
                Some(id) => format!("Connected to execution: {id}"),
                None => non_empty(raw, "content").unwrap_or("Connected").to_string(),
            };
            StreamEvent::status(content, "connected")
        }

        "message" => match obj_field(raw, "message") {
            Some(msg) if str_field(msg, "role") == Some("assistant") => {
                StreamEvent::new(EventKind::Text, str_field(msg, "content").unwrap_or_default())
                    .with_role("assistant")
            }
            Some(msg) if str_field(msg, "role") == Some("user") => {
                let content = str_field(msg, "content").unwrap_or_default();
                StreamEvent::status(format!("User: {}", truncate(content, 100)), "message")
            }
            _ => StreamEvent::new(EventKind::Text, raw_json()),
        },

        "status" => match raw.get("status") {
            Some(Value::Object(status)) => {
                let state = str_field(status, "state").unwrap_or_default();
                StreamEvent::status(format!("Status: {state}"), state)
            }
            Some(Value::String(state)) => {
                let content = non_empty(raw, "content")
                    .map(String::from)
                    .unwrap_or_else(|| format!("Status: {state}"));
                StreamEvent::status(content, state)
            }
            _ => match non_empty(raw, "content") {
                Some(content) => StreamEvent::new(EventKind::Status, content),
                None => StreamEvent::new(EventKind::Status, raw_json()),
            },
        },

        "tool_call" | "tool_use" | "tool_started" => {
            let (name, input) = extract_tool_call(raw);
            let mut event = StreamEvent::new(EventKind::ToolCall, format!("Calling {name}"));
            event.tool_name = Some(name);
            event.tool_input = input;
            event
        }

        "tool_result" | "tool_output" | "tool_completed" => {
            let fields = extract_tool_result(raw);
            let output = match (fields.output, fields.is_error) {
                (Some(out), true) if out.starts_with("Error: ") => out,
                (Some(out), true) => format!("Error: {out}"),
                (None, true) => "Error: ".to_string(),
                (Some(out), false) => out,
                (None, false) => "Completed successfully".to_string(),
            };
            let mut event = StreamEvent::new(EventKind::ToolResult, output.clone());
            event.tool_name = fields.name;
            event.tool_output = Some(output);
            if fields.is_error {
                event.status = Some("error".to_string());
            }
            event
        }

        "thinking" | "reasoning" => StreamEvent::new(EventKind::Reasoning, text_of(&["content", "thinking"])),

        "message_chunk" => {
            let content = obj_field(raw, "message")
                .and_then(|msg| str_field(msg, "content"))
                .or_else(|| str_field(raw, "content"))
                .unwrap_or_default();
            if content.is_empty() || content == "(no content)" {
                return None;
            }
            StreamEvent::new(EventKind::Output, content)
        }

        "text" => StreamEvent::new(EventKind::Text, text_of(&["content", "text"])),

        "output" | "content_block_delta" => {
            let content = first_name(raw, &["content", "text"]).unwrap_or_else(|| {
                obj_field(raw, "delta")
                    .and_then(|delta| str_field(delta, "text"))
                    .unwrap_or_default()
                    .to_string()
            });
            StreamEvent::new(EventKind::Output, content)
        }

        "metadata" => StreamEvent::new(EventKind::Status, ""),

        "run_started" => StreamEvent::status("Agent started processing...", "running"),

        "plan" => StreamEvent::new(EventKind::Plan, text_of(&["content", "plan"])),

        "error" => StreamEvent::error(text_of(&["content", "error", "message"])),

        "done" | "complete" | "completed" => StreamEvent::done(text_of(&["content"])),

        _ => StreamEvent::new(EventKind::Text, raw_json()),
    };

    Some(event.with_timestamp(timestamp))
}
