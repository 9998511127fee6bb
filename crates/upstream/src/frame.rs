//! Upstream frame interpretation
//!
//! Each `data:` payload is usually a JSON object. Text may sit under
//! `content`, `text` or `delta`; a rotated secret may be piggybacked under
//! several keys; draw submissions carry the task id in `data.draw_result`.
//! Non-JSON payloads are plain text.

use serde_json::Value;

/// Frame types that only describe the conversation and carry no answer text.
const METADATA_TYPES: &[&str] = &["conversation", "user-message", "assistant-message"];

const TEXT_KEYS: &[&str] = &["content", "text", "delta"];

const SECRET_KEYS: &[&str] = &["token", "Token", "access_token"];

/// One interpreted upstream frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawChunk {
    /// Answer text, empty for metadata frames
    pub text: String,
    /// Replacement secret announced by the upstream
    pub rotated_secret: Option<String>,
    /// Draw task id, for image submissions
    pub draw_task: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Chunk(RawChunk),
    Done,
}

pub fn parse_frame(payload: &str) -> Frame {
    if payload == "[DONE]" {
        return Frame::Done;
    }
    let chunk = match serde_json::from_str::<Value>(payload) {
        Ok(obj @ Value::Object(_)) => {
            let is_metadata = obj
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(|t| METADATA_TYPES.contains(&t));
            RawChunk {
                text: if is_metadata { String::new() } else { text_of(&obj) },
                rotated_secret: rotated_secret(&obj),
                draw_task: draw_task(&obj),
            }
        }
        Ok(Value::String(s)) => RawChunk {
            text: s,
            ..RawChunk::default()
        },
        Ok(Value::Null) => RawChunk::default(),
        Ok(other) => RawChunk {
            text: other.to_string(),
            ..RawChunk::default()
        },
        Err(_) => RawChunk {
            text: payload.to_string(),
            ..RawChunk::default()
        },
    };
    Frame::Chunk(chunk)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn text_of(obj: &Value) -> String {
    TEXT_KEYS
        .iter()
        .find_map(|key| non_empty_str(obj.get(key)))
        .unwrap_or_default()
        .to_string()
}

fn rotated_secret(obj: &Value) -> Option<String> {
    SECRET_KEYS
        .iter()
        .find_map(|key| non_empty_str(obj.get(key)))
        .or_else(|| non_empty_str(obj.get("data").and_then(|d| d.get("token"))))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn draw_task(obj: &Value) -> Option<String> {
    match obj.pointer("/data/draw_result/task_id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
