//! Public model names
//!
//! Chat models carry an output-mode suffix, image models an aspect-ratio
//! suffix. Both are parsed once per request into a `ModelSpec` so the
//! gateway never string-matches model names itself.

use serde::Serialize;

/// Chat models offered upstream, by their public (and upstream) name.
pub const CHAT_MODELS: &[&str] = &[
    "Gemini-3.0-Flash",
    "GPT-5.2-Instant",
    "gemini_2_5_flash",
    "gemini_2_5_pro",
    "Grok-4.1-Fast-Non-Reasoning",
    "Grok-4-Fast-Reasoning",
    "claude-sonnet-4",
];

/// Chat model used when the request names none.
pub const DEFAULT_CHAT_MODEL: &str = "Gemini-3.0-Flash";

/// Image models: public name → upstream name.
pub const IMAGE_MODELS: &[(&str, &str)] = &[
    ("Nano-Banana", "poe_model_Nano-Banana"),
    ("FLUX-2-Pro", "poe_model_FLUX-2-Pro"),
];

pub const DEFAULT_IMAGE_MODEL: &str = "FLUX-2-Pro";

pub const ASPECT_RATIOS: &[&str] = &["1:1", "4:3", "3:4", "16:9", "9:16", "1:2", "3:2", "2:3"];

pub const DEFAULT_RATIO: &str = "1:1";

const UPSTREAM_IMAGE_PREFIX: &str = "poe_model_";

/// Catalog timestamp (2024-01-01T00:00:00Z).
const CATALOG_CREATED: u64 = 1_704_067_200;

/// Post-processing applied to assembled chat text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Short answer only; the detailed report is cut off.
    Concise,
    /// Full report without markup or thinking traces.
    Report,
    /// Only the fenced HTML document.
    Markup,
}

impl OutputMode {
    /// Suffixes recognised on a chat model name. The first suffix of each
    /// mode is the one advertised in the catalog.
    const SUFFIXES: &'static [(&'static str, OutputMode)] = &[
        ("(简要答案)", OutputMode::Concise),
        ("(专业报告)", OutputMode::Report),
        ("(HTML)", OutputMode::Markup),
        ("(concise)", OutputMode::Concise),
        ("(report)", OutputMode::Report),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Concise => "concise",
            OutputMode::Report => "report",
            OutputMode::Markup => "html",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatModel {
    /// Upstream model name
    pub base: String,
    pub mode: OutputMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageModel {
    /// Public base name, without the ratio suffix
    pub base: String,
    /// Upstream model name (`poe_model_*`)
    pub upstream: String,
    pub ratio: &'static str,
    /// Whether the ratio came from the model name rather than the default
    pub explicit_ratio: bool,
}

impl ImageModel {
    /// Apply an OpenAI `size` when the model name did not pick a ratio.
    pub fn with_size(mut self, size: Option<&str>) -> Self {
        if !self.explicit_ratio {
            if let Some(ratio) = size.and_then(size_to_ratio) {
                self.ratio = ratio;
            }
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSpec {
    Chat(ChatModel),
    Image(ImageModel),
}

/// Whether a public model name selects image generation.
pub fn is_image_model(name: &str) -> bool {
    let name = name.trim();
    IMAGE_MODELS.iter().any(|(public, _)| name.starts_with(public))
}

/// Parse a public model name.
pub fn parse_model(name: &str) -> ModelSpec {
    let name = name.trim();
    if is_image_model(name) {
        ModelSpec::Image(parse_image_model(name))
    } else {
        ModelSpec::Chat(parse_chat_model(name))
    }
}

fn parse_chat_model(name: &str) -> ChatModel {
    let (base, mode) = OutputMode::SUFFIXES
        .iter()
        .find_map(|(suffix, mode)| name.strip_suffix(suffix).map(|base| (base.trim(), *mode)))
        .unwrap_or((name, OutputMode::Concise));

    let base = if base.is_empty() { DEFAULT_CHAT_MODEL } else { base };
    ChatModel {
        base: base.to_string(),
        mode,
    }
}

fn parse_image_model(name: &str) -> ImageModel {
    let (base, ratio) = match split_ratio_suffix(name) {
        Some((base, ratio)) => match ASPECT_RATIOS.iter().find(|r| **r == ratio) {
            Some(known) => (base, Some(*known)),
            None => {
                tracing::warn!(model = name, ratio, "unknown aspect ratio, using {DEFAULT_RATIO}");
                (base, None)
            }
        },
        None => (name, None),
    };

    ImageModel {
        base: base.to_string(),
        upstream: upstream_image_model(base),
        ratio: ratio.unwrap_or(DEFAULT_RATIO),
        explicit_ratio: ratio.is_some(),
    }
}

/// `"FLUX-2-Pro (16:9)"` → `("FLUX-2-Pro", "16:9")`
fn split_ratio_suffix(name: &str) -> Option<(&str, &str)> {
    let inner = name.strip_suffix(')')?;
    let open = inner.rfind('(')?;
    let ratio = &inner[open + 1..];
    let (w, h) = ratio.split_once(':')?;
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !numeric(w) || !numeric(h) {
        return None;
    }
    Some((inner[..open].trim(), ratio))
}

fn upstream_image_model(base: &str) -> String {
    if let Some((_, upstream)) = IMAGE_MODELS.iter().find(|(public, _)| *public == base) {
        return upstream.to_string();
    }
    if base.starts_with(UPSTREAM_IMAGE_PREFIX) {
        return base.to_string();
    }
    let lower = base.to_lowercase();
    IMAGE_MODELS
        .iter()
        .find(|(public, _)| lower.contains(&public.to_lowercase()))
        .or_else(|| IMAGE_MODELS.iter().find(|(public, _)| *public == DEFAULT_IMAGE_MODEL))
        .map(|(_, upstream)| upstream.to_string())
        .unwrap_or_else(|| format!("{UPSTREAM_IMAGE_PREFIX}{DEFAULT_IMAGE_MODEL}"))
}

/// Map an OpenAI `size` to a supported aspect ratio.
pub fn size_to_ratio(size: &str) -> Option<&'static str> {
    match size.trim() {
        "1024x1024" => Some("1:1"),
        "1024x768" => Some("4:3"),
        "768x1024" => Some("3:4"),
        "1920x1080" => Some("16:9"),
        "1080x1920" => Some("9:16"),
        "512x1024" => Some("1:2"),
        "1536x1024" => Some("3:2"),
        "1024x1536" => Some("2:3"),
        _ => None,
    }
}

/// One entry of `GET /v1/models`.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl CatalogEntry {
    fn new(id: String, kind: &'static str) -> Self {
        Self {
            id,
            object: "model",
            created: CATALOG_CREATED,
            owned_by: "zaiwenai",
            kind,
        }
    }
}

/// Every public model name with all of its suffix variants.
pub fn catalog() -> Vec<CatalogEntry> {
    let mut entries = Vec::new();
    for base in CHAT_MODELS {
        entries.push(CatalogEntry::new(base.to_string(), "chat"));
        for (suffix, _) in &OutputMode::SUFFIXES[..3] {
            entries.push(CatalogEntry::new(format!("{base} {suffix}"), "chat"));
        }
    }
    for (base, _) in IMAGE_MODELS {
        entries.push(CatalogEntry::new(base.to_string(), "image"));
        for ratio in ASPECT_RATIOS {
            entries.push(CatalogEntry::new(format!("{base} ({ratio})"), "image"));
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(name: &str) -> ChatModel {
        match parse_model(name) {
            ModelSpec::Chat(m) => m,
            other => panic!("expected chat model, got {other:?}"),
        }
    }

    fn image(name: &str) -> ImageModel {
        match parse_model(name) {
            ModelSpec::Image(m) => m,
            other => panic!("expected image model, got {other:?}"),
        }
    }

    #[test]
    fn bare_chat_model_is_concise() {
        let m = chat("Gemini-3.0-Flash");
        assert_eq!(m.base, "Gemini-3.0-Flash");
        assert_eq!(m.mode, OutputMode::Concise);
    }

    #[test]
    fn chat_suffixes_select_mode() {
        assert_eq!(chat("claude-sonnet-4 (专业报告)").mode, OutputMode::Report);
        assert_eq!(chat("claude-sonnet-4 (report)").mode, OutputMode::Report);
        assert_eq!(chat("GPT-5.2-Instant (HTML)").mode, OutputMode::Markup);
        assert_eq!(chat("GPT-5.2-Instant (简要答案)").mode, OutputMode::Concise);
        assert_eq!(chat("GPT-5.2-Instant (concise)").base, "GPT-5.2-Instant");
    }

    #[test]
    fn empty_base_falls_back_to_default() {
        assert_eq!(chat("(HTML)").base, DEFAULT_CHAT_MODEL);
        assert_eq!(chat("").base, DEFAULT_CHAT_MODEL);
    }

    #[test]
    fn image_model_defaults_to_square() {
        let m = image("FLUX-2-Pro");
        assert_eq!(m.upstream, "poe_model_FLUX-2-Pro");
        assert_eq!(m.ratio, "1:1");
        assert!(!m.explicit_ratio);
    }

    #[test]
    fn image_model_ratio_suffix() {
        let m = image("Nano-Banana (16:9)");
        assert_eq!(m.base, "Nano-Banana");
        assert_eq!(m.upstream, "poe_model_Nano-Banana");
        assert_eq!(m.ratio, "16:9");
        assert!(m.explicit_ratio);
    }

    #[test]
    fn unknown_ratio_falls_back_to_default() {
        let m = image("FLUX-2-Pro (5:7)");
        assert_eq!(m.base, "FLUX-2-Pro");
        assert_eq!(m.ratio, DEFAULT_RATIO);
        assert!(!m.explicit_ratio);
    }

    #[test]
    fn size_applies_only_without_explicit_ratio() {
        assert_eq!(image("FLUX-2-Pro").with_size(Some("1920x1080")).ratio, "16:9");
        assert_eq!(image("FLUX-2-Pro (1:1)").with_size(Some("1920x1080")).ratio, "1:1");
        assert_eq!(image("FLUX-2-Pro").with_size(Some("1024x512")).ratio, "1:1");
        assert_eq!(image("FLUX-2-Pro").with_size(None).ratio, "1:1");
    }

    #[test]
    fn partial_image_names_map_to_known_models() {
        assert_eq!(image("FLUX-2-Pro-Ultra").upstream, "poe_model_FLUX-2-Pro");
        assert_eq!(upstream_image_model("poe_model_Custom"), "poe_model_Custom");
        assert_eq!(upstream_image_model("something"), "poe_model_FLUX-2-Pro");
    }

    #[test]
    fn catalog_lists_every_variant() {
        let entries = catalog();
        assert_eq!(
            entries.len(),
            CHAT_MODELS.len() * 4 + IMAGE_MODELS.len() * (ASPECT_RATIOS.len() + 1)
        );
        assert!(entries.iter().any(|e| e.id == "claude-sonnet-4 (专业报告)" && e.kind == "chat"));
        assert!(entries.iter().any(|e| e.id == "Nano-Banana (9:16)" && e.kind == "image"));

        // Every advertised name parses back to its own kind
        for entry in &entries {
            let is_image = matches!(parse_model(&entry.id), ModelSpec::Image(_));
            assert_eq!(is_image, entry.kind == "image", "{}", entry.id);
        }
    }
}
