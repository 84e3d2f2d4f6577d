//! Decides whether an SSE frame carries real model output.
//!
//! The race is won by the first provider to say something, not the first to
//! connect: upstreams commonly answer `200` at once and then send nothing but
//! keep-alive comments for seconds.

use serde_json::Value;

/// Stream-termination payload used by OpenAI-compatible APIs.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Joined `data:` payload of a frame, or `None` when it has no data line.
///
/// Comment lines (`:` prefix) and other fields are ignored; one space after
/// the colon is stripped and multiple data lines are joined with `\n`.
pub fn data_payload(frame: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in frame.lines() {
        if line.starts_with(':') {
            continue;
        }
        let value = match line.strip_prefix("data") {
            Some("") => "",
            Some(rest) => match rest.strip_prefix(':') {
                Some(v) => v.strip_prefix(' ').unwrap_or(v),
                None => continue,
            },
            None => continue,
        };
        match data.as_mut() {
            Some(d) => {
                d.push('\n');
                d.push_str(value);
            }
            None => data = Some(value.to_string()),
        }
    }
    data
}

/// Whether a frame proves its stream is alive.
pub fn is_meaningful(frame: &str) -> bool {
    let Some(payload) = data_payload(frame) else {
        return false;
    };
    let payload = payload.trim();
    if payload.is_empty() || payload == DONE_SENTINEL {
        return false;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(value @ Value::Object(_)) => has_output(&value),
        Ok(Value::String(s)) => !s.is_empty(),
        Ok(_) => false,
        // Non-standard providers may stream bare text.
        Err(_) => true,
    }
}

/// Text carried by a frame, for clients rendering the stream.
///
/// Concatenates `delta.content` across choices; bare non-JSON payloads are
/// returned as-is.
pub fn delta_text(frame: &str) -> Option<String> {
    let payload = data_payload(frame)?;
    let trimmed = payload.trim();
    if trimmed.is_empty() || trimmed == DONE_SENTINEL {
        return None;
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => return Some(payload),
    };
    let mut out = String::new();
    for choice in choices(&value) {
        if let Some(delta) = choice.get("delta") {
            push_content(&mut out, delta.get("content"));
        } else if let Some(message) = choice.get("message") {
            push_content(&mut out, message.get("content"));
        } else if let Some(text) = choice.get("text").and_then(Value::as_str) {
            out.push_str(text);
        }
    }
    (!out.is_empty()).then_some(out)
}

fn choices(value: &Value) -> &[Value] {
    value
        .get("choices")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn has_output(value: &Value) -> bool {
    choices(value).iter().any(|choice| {
        let delta = choice.get("delta").or_else(|| choice.get("message"));
        let delta_has = delta.is_some_and(|d| {
            has_content(d.get("content")) || has_tool_call(d) || has_function_call(d.get("function_call"))
        });
        delta_has || non_empty_str(choice.get("text"))
    })
}

fn has_content(content: Option<&Value>) -> bool {
    match content {
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(parts)) => parts.iter().any(|p| non_empty_str(p.get("text"))),
        _ => false,
    }
}

fn has_tool_call(delta: &Value) -> bool {
    delta
        .get("tool_calls")
        .and_then(Value::as_array)
        .is_some_and(|calls| calls.iter().any(|c| has_function_call(c.get("function"))))
}

fn has_function_call(function: Option<&Value>) -> bool {
    function.is_some_and(|f| non_empty_str(f.get("name")) || non_empty_str(f.get("arguments")))
}

fn non_empty_str(value: Option<&Value>) -> bool {
    value.and_then(Value::as_str).is_some_and(|s| !s.is_empty())
}

fn push_content(out: &mut String, content: Option<&Value>) {
    match content {
        Some(Value::String(s)) => out.push_str(s),
        Some(Value::Array(parts)) => {
            for text in parts.iter().filter_map(|p| p.get("text").and_then(Value::as_str)) {
                out.push_str(text);
            }
        }
        _ => {}
    }
}
