//! Upstream request bodies
//!
//! Chat and draw calls share one envelope; only `type`, `online` and `draw`
//! differ.

use serde_json::{Value, json};

/// Flatten an OpenAI message list into the single prompt the upstream takes.
pub fn flatten_prompt<'a, I>(messages: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    messages
        .into_iter()
        .map(|(role, content)| match role {
            "system" => format!("System: {content}"),
            "user" => format!("User: {content}"),
            "assistant" => format!("Assistant: {content}"),
            other => format!("{other}: {content}"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A reference image already uploaded and registered as an asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub asset_id: String,
    /// 0-100
    pub weight: u8,
}

fn envelope(content: &str, model: &str, kind: &str, online: bool, draw: Value) -> Value {
    json!({
        "data": {
            "content": content,
            "model": model,
            "round": 5,
            "type": kind,
            "online": online,
            "file": {},
            "knowledge": [],
            "draw": draw,
            "suno_input": {},
            "video": {
                "ratio": "1:1",
                "original_image": { "image": {}, "weight": 50 }
            }
        }
    })
}

/// Body for a chat completion.
pub fn chat_payload(prompt: &str, model: &str) -> Value {
    envelope(prompt, model, "deepsearch", true, json!({}))
}

/// Body for a draw task, optionally seeded with a reference image.
pub fn draw_payload(prompt: &str, model: &str, ratio: &str, reference: Option<&Reference>) -> Value {
    let mut draw = json!({ "ratio": ratio });
    if let Some(reference) = reference {
        draw["original_image"] = json!({
            "asset": reference.asset_id,
            "weight": reference.weight,
        });
    }
    envelope(prompt, model, "draw", false, draw)
}
