//! Mapping from raw kernel notifications to execution events.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::backend::KernelMessage;
use crate::event::{CodeFormat, ExecutionEvent, ImageFormat, MsgType};

/// Outcome of classifying one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The kernel went idle; the cell is finished.
    Done,
    Event(ExecutionEvent),
    Ignored,
}

/// Rich display payloads in the order they are preferred.
const MIME_PRECEDENCE: [&str; 5] = [
    "image/png",
    "image/jpeg",
    "text/html",
    "text/plain",
    "application/javascript",
];

/// Classify a single notification. Pure and non-blocking.
pub fn classify(message: &KernelMessage) -> Classification {
    let content = &message.content;
    match message.msg_type.as_str() {
        "status" => {
            if content.get("execution_state").and_then(Value::as_str) == Some("idle") {
                Classification::Done
            } else {
                Classification::Ignored
            }
        }
        "stream" => match content.get("text").and_then(Value::as_str) {
            Some(text) => Classification::Event(ExecutionEvent::console(MsgType::Stream, text)),
            None => Classification::Ignored,
        },
        "error" => {
            let Some(lines) = content.get("traceback").and_then(Value::as_array) else {
                return Classification::Ignored;
            };
            let traceback = lines
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("\n");
            Classification::Event(ExecutionEvent::console(
                MsgType::Error,
                strip_ansi(&traceback),
            ))
        }
        "display_data" => rich_output(MsgType::DisplayData, content),
        "execute_result" => rich_output(MsgType::ExecuteResult, content),
        _ => Classification::Ignored,
    }
}

fn rich_output(msg_type: MsgType, content: &Value) -> Classification {
    let Some(data) = content.get("data").and_then(Value::as_object) else {
        return Classification::Ignored;
    };

    let Some((mime, value)) = MIME_PRECEDENCE
        .iter()
        .find_map(|mime| data.get(*mime).map(|value| (*mime, value)))
    else {
        return Classification::Ignored;
    };

    let payload = mime_text(value);
    let event = match mime {
        "image/png" => ExecutionEvent::image(msg_type, ImageFormat::Png, payload),
        "image/jpeg" => ExecutionEvent::image(msg_type, ImageFormat::Jpeg, payload),
        "text/html" => ExecutionEvent::code(msg_type, CodeFormat::Html, payload),
        "text/plain" => ExecutionEvent::console(msg_type, payload),
        _ => ExecutionEvent::code(msg_type, CodeFormat::Javascript, payload),
    };
    Classification::Event(event)
}

/// Mime bundle values are usually strings, but nbformat also allows a list
/// of lines.
fn mime_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(lines) => lines.iter().filter_map(Value::as_str).collect(),
        other => other.to_string(),
    }
}

fn ansi_escape() -> &'static Regex {
    static ANSI_ESCAPE: OnceLock<Regex> = OnceLock::new();
    ANSI_ESCAPE.get_or_init(|| {
        Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("ANSI escape pattern is valid")
    })
}

/// Remove ANSI CSI escape sequences (colors, cursor movement) from `text`.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ansi_escape().replace_all(text, "")
}
