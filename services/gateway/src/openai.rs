//! OpenAI-compatible request and response shapes
//!
//! Requests are parsed leniently: unknown fields are ignored and message
//! content may be a string or a list of typed parts. Responses are built as
//! `serde_json::Value` so the handlers can stream chunks without a second
//! set of response structs.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;
use upstream::model::{DEFAULT_CHAT_MODEL, DEFAULT_IMAGE_MODEL};

fn default_chat_model() -> String {
    DEFAULT_CHAT_MODEL.to_string()
}

fn default_image_model() -> String {
    DEFAULT_IMAGE_MODEL.to_string()
}

/// `POST /v1/chat/completions`
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default = "default_chat_model")]
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    /// Accepted for compatibility; the upstream has no equivalent
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        #[serde(default)]
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ImageUrl {
    Plain(String),
    Object { url: String },
}

impl ImageUrl {
    pub fn url(&self) -> &str {
        match self {
            ImageUrl::Plain(url) | ImageUrl::Object { url } => url,
        }
    }
}

/// An inline image sent along with a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub bytes: Vec<u8>,
    pub filename: String,
}

impl MessageContent {
    /// Text of the message; parts are joined with a single space.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } if !text.is_empty() => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// First inline `data:image/...` part, decoded.
    pub fn reference_image(&self) -> Option<ReferenceImage> {
        let MessageContent::Parts(parts) = self else {
            return None;
        };
        parts.iter().find_map(|part| match part {
            ContentPart::ImageUrl { image_url } => decode_image(image_url.url()),
            _ => None,
        })
    }
}

impl ChatCompletionRequest {
    /// `(role, text)` pairs, in order, for prompt flattening.
    pub fn flattened_messages(&self) -> Vec<(String, String)> {
        self.messages
            .iter()
            .map(|m| (m.role.clone(), m.content.text()))
            .collect()
    }

    /// Text of the last user message, used as an image prompt.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.text())
            .filter(|t| !t.trim().is_empty())
    }

    /// Inline image of the last user message that carries one.
    pub fn reference_image(&self) -> Option<ReferenceImage> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == "user")
            .find_map(|m| m.content.reference_image())
    }
}

/// Decode a `data:image/<fmt>;base64,<payload>` URL. Plain base64 is
/// accepted and treated as PNG. Remote URLs are not fetched.
pub fn decode_image(url: &str) -> Option<ReferenceImage> {
    let url = url.trim();
    let (format, payload) = match url.strip_prefix("data:image/") {
        Some(rest) => {
            let (format, payload) = rest.split_once(";base64,")?;
            (format.to_ascii_lowercase(), payload)
        }
        None if url.starts_with("http://") || url.starts_with("https://") => {
            warn!("remote reference image URLs are not supported, ignoring");
            return None;
        }
        None => ("png".to_string(), url),
    };
    let format = if format == "jpg" { "jpeg".to_string() } else { format };

    match STANDARD.decode(payload.trim()) {
        Ok(bytes) if !bytes.is_empty() => Some(ReferenceImage {
            bytes,
            filename: format!("reference.{format}"),
        }),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "reference image is not valid base64, ignoring");
            None
        }
    }
}

/// `POST /v1/images/generations`
#[derive(Debug, Deserialize)]
pub struct ImageGenerationRequest {
    #[serde(default = "default_image_model")]
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub response_format: Option<String>,
}

/// `POST /v1/images/edits`, JSON form: `image` is base64 or a data URL.
#[derive(Debug, Deserialize)]
pub struct ImageEditRequest {
    #[serde(default = "default_image_model")]
    pub model: String,
    pub prompt: String,
    pub image: String,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub response_format: Option<String>,
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().as_simple())
}

/// Non-streaming chat completion.
pub fn chat_completion(id: &str, model: &str, content: &str) -> Value {
    json!({
        "id": id,
        "object": "chat.completion",
        "created": unix_now(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": 0,
            "completion_tokens": 0,
            "total_tokens": 0,
        },
    })
}

/// One streamed chunk. `delta` is the raw delta object.
pub fn chat_chunk(id: &str, model: &str, delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": unix_now(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

/// Image generation/edit response.
pub fn image_response(urls: &[String], prompt: &str) -> Value {
    let data: Vec<Value> = urls
        .iter()
        .map(|url| json!({ "url": url, "revised_prompt": prompt }))
        .collect();
    json!({ "created": unix_now(), "data": data })
}

/// Markdown answer for an image model used through the chat endpoint.
pub fn image_markdown(urls: &[String], prompt: &str, model: &str) -> String {
    let mut out = String::new();
    for url in urls {
        out.push_str(&format!("![Generated Image]({url})\n\n"));
    }
    out.push_str(&format!("**Prompt:** {prompt}\n**Model:** {model}\n"));
    for url in urls {
        out.push_str(&format!("**URL:** {url}\n"));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_and_part_content() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": [
                    { "type": "text", "text": "what is" },
                    { "type": "image_url", "image_url": { "url": "https://x/y.png" } },
                    { "type": "text", "text": "rust" },
                    { "type": "input_audio", "input_audio": {} }
                ]},
                { "role": "assistant" }
            ],
            "temperature": 0.2,
            "unknown_field": true
        }))
        .unwrap();

        assert_eq!(req.model, DEFAULT_CHAT_MODEL);
        assert!(!req.stream);
        assert_eq!(
            req.flattened_messages(),
            vec![
                ("system".to_string(), "be brief".to_string()),
                ("user".to_string(), "what is rust".to_string()),
                ("assistant".to_string(), String::new()),
            ]
        );
        assert_eq!(req.last_user_text().as_deref(), Some("what is rust"));
        assert!(req.reference_image().is_none(), "remote URLs are not fetched");
    }

    #[test]
    fn missing_messages_is_rejected() {
        let parsed = serde_json::from_value::<ChatCompletionRequest>(json!({ "model": "x" }));
        assert!(parsed.is_err());
    }

    #[test]
    fn inline_image_is_decoded() {
        let payload = STANDARD.encode(b"\x89PNG fake");
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "FLUX-2-Pro",
            "messages": [{ "role": "user", "content": [
                { "type": "text", "text": "make it blue" },
                { "type": "image_url", "image_url": format!("data:image/jpg;base64,{payload}") }
            ]}]
        }))
        .unwrap();

        let image = req.reference_image().unwrap();
        assert_eq!(image.bytes, b"\x89PNG fake");
        assert_eq!(image.filename, "reference.jpeg");
    }

    #[test]
    fn bad_base64_is_ignored() {
        assert!(decode_image("data:image/png;base64,@@@").is_none());
        assert!(decode_image("data:image/png,nobase64").is_none());
    }

    #[test]
    fn bare_base64_is_png() {
        let image = decode_image(&STANDARD.encode(b"img")).unwrap();
        assert_eq!(image.filename, "reference.png");
    }

    #[test]
    fn image_requests_default_model() {
        let req: ImageGenerationRequest =
            serde_json::from_value(json!({ "prompt": "a cat", "size": "1920x1080" })).unwrap();
        assert_eq!(req.model, DEFAULT_IMAGE_MODEL);
        assert_eq!(req.size.as_deref(), Some("1920x1080"));

        let edit: ImageEditRequest =
            serde_json::from_value(json!({ "prompt": "bluer", "image": "aGk=" })).unwrap();
        assert_eq!(edit.model, DEFAULT_IMAGE_MODEL);
    }

    #[test]
    fn completion_shapes() {
        let done = chat_completion("chatcmpl-1", "m", "hi");
        assert_eq!(done["object"], "chat.completion");
        assert_eq!(done["choices"][0]["message"]["content"], "hi");
        assert_eq!(done["usage"]["total_tokens"], 0);

        let chunk = chat_chunk("chatcmpl-1", "m", json!({ "content": "h" }), None);
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert!(chunk["choices"][0]["finish_reason"].is_null());

        let images = image_response(&["https://img/1.png".to_string()], "a cat");
        assert_eq!(images["data"][0]["url"], "https://img/1.png");
        assert_eq!(images["data"][0]["revised_prompt"], "a cat");
    }

    #[test]
    fn image_markdown_lists_every_url() {
        let text = image_markdown(&["u1".to_string(), "u2".to_string()], "cat", "FLUX-2-Pro");
        assert!(text.starts_with("![Generated Image](u1)"));
        assert!(text.contains("![Generated Image](u2)"));
        assert!(text.contains("**Prompt:** cat"));
        assert!(text.ends_with("**URL:** u2"));
    }
}
