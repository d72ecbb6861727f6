//! Content canonicalization helpers
//!
//! Message bodies arrive as plain strings, strings carrying inline `<img>`
//! markup, or structured content arrays in a few legacy shapes. Everything is
//! reduced to an ordered list of [`ContentPart`]s here.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::types::ContentPart;

/// Prompt shown when the backend supplies none, or only a placeholder
pub const DEFAULT_PROMPT: &str = "Enter your message:";

/// Alt text used when an image marker carries no description
pub const DEFAULT_IMAGE_ALT: &str = "Image";

const PLACEHOLDER_PROMPTS: &[&str] = &["", ">", ">>", "->", "=>"];

static IMG_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<img\b([^>]*)>").unwrap());

static SRC_ATTR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bsrc\s*=").unwrap());

static ALT_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\balt\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>/]+))"#).unwrap()
});

/// Generate a fresh unique identifier
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current time as an RFC 3339 UTC timestamp
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// An `<img>` tag without a `src` attribute
struct Marker {
    start: usize,
    end: usize,
    alt: String,
}

fn unattributed_markers(text: &str) -> Vec<Marker> {
    IMG_TAG
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let inner = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            if SRC_ATTR.is_match(inner) {
                return None;
            }
            Some(Marker {
                start: whole.start(),
                end: whole.end(),
                alt: marker_alt(inner),
            })
        })
        .collect()
}

fn marker_alt(inner: &str) -> String {
    let alt = match ALT_ATTR.captures(inner) {
        Some(caps) => caps
            .iter()
            .skip(1)
            .flatten()
            .next()
            .map_or("", |m| m.as_str())
            .trim(),
        None => inner.trim().trim_end_matches('/').trim().trim_matches(['"', '\'']),
    };
    if alt.is_empty() {
        DEFAULT_IMAGE_ALT.to_string()
    } else {
        alt.to_string()
    }
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

/// Rewrite a single unattributed `<img>` marker to point at `url`.
///
/// Text with zero or several such markers is returned unchanged, since there
/// is no way to tell which marker the preview belongs to.
pub fn replace_image_urls(text: &str, url: &str) -> String {
    let markers = unattributed_markers(text);
    let [marker] = markers.as_slice() else {
        return text.to_string();
    };
    format!(
        "{}<img src=\"{}\" alt=\"{}\">{}",
        &text[..marker.start],
        escape_attr(url),
        escape_attr(&marker.alt),
        &text[marker.end..]
    )
}

/// Normalize a string body.
///
/// With a preview URL and exactly one unattributed marker, the marker becomes
/// an image part; any surrounding text is kept as a preceding text part.
fn normalize_text(text: &str, preview_url: Option<&str>) -> Vec<ContentPart> {
    let Some(url) = preview_url else {
        return vec![ContentPart::text(text)];
    };
    let markers = unattributed_markers(text);
    let [marker] = markers.as_slice() else {
        return vec![ContentPart::text(text)];
    };

    let surrounding = format!("{}{}", &text[..marker.start], &text[marker.end..]);
    let surrounding = surrounding.trim();
    let mut parts = Vec::with_capacity(2);
    if !surrounding.is_empty() {
        parts.push(ContentPart::text(surrounding));
    }
    parts.push(ContentPart::image(url, marker.alt.clone()));
    parts
}

fn image_part(obj: &Map<String, Value>, url: Option<&str>) -> Option<ContentPart> {
    let url = url?;
    let alt = obj
        .get("alt")
        .and_then(Value::as_str)
        .filter(|a| !a.is_empty())
        .unwrap_or(DEFAULT_IMAGE_ALT);
    Some(ContentPart::image(url, alt))
}

fn normalize_object(obj: &Map<String, Value>, preview_url: Option<&str>) -> Vec<ContentPart> {
    match obj.get("type").and_then(Value::as_str) {
        Some("text") => {
            let text = obj
                .get("text")
                .or_else(|| obj.get("content"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let text = match preview_url {
                Some(url) => replace_image_urls(text, url),
                None => text.to_string(),
            };
            vec![ContentPart::text(text)]
        }
        Some("image_url") => {
            let url = obj.get("image_url").and_then(|v| match v {
                Value::String(s) => Some(s.as_str()),
                Value::Object(inner) => inner.get("url").and_then(Value::as_str),
                _ => None,
            });
            image_part(obj, url).into_iter().collect()
        }
        Some("image") => {
            let url = obj
                .get("url")
                .or_else(|| obj.get("image"))
                .and_then(Value::as_str);
            image_part(obj, url).into_iter().collect()
        }
        _ => match obj.get("content") {
            Some(inner) => normalize_value(inner, preview_url),
            None => vec![ContentPart::text(Value::Object(obj.clone()).to_string())],
        },
    }
}

fn normalize_value(value: &Value, preview_url: Option<&str>) -> Vec<ContentPart> {
    match value {
        Value::Null => vec![],
        Value::String(s) => normalize_text(s, preview_url),
        Value::Array(items) => items
            .iter()
            .flat_map(|item| normalize_value(item, preview_url))
            .collect(),
        Value::Object(obj) => normalize_object(obj, preview_url),
        Value::Bool(_) | Value::Number(_) => vec![ContentPart::text(value.to_string())],
    }
}

/// Canonicalize a content payload into a non-empty list of parts
pub fn normalize_content(value: &Value, preview_url: Option<&str>) -> Vec<ContentPart> {
    let parts = normalize_value(value, preview_url);
    if parts.is_empty() {
        vec![ContentPart::text("")]
    } else {
        parts
    }
}

/// Interpret a flag sent as a bool or a case-insensitive `"true"`/`"false"` string.
/// Anything else is `false`.
pub fn parse_flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Whether an input request asks for a secret
pub fn is_password_prompt(value: &Value) -> bool {
    parse_flag(value)
}

/// Replace generic placeholder prompts with the default prompt
pub fn normalize_prompt(prompt: &str) -> String {
    if PLACEHOLDER_PROMPTS.contains(&prompt.trim()) {
        DEFAULT_PROMPT.to_string()
    } else {
        prompt.to_string()
    }
}
