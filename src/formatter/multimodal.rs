//! Multimodal content handling: content parts, image decoding, and the
//! prompt layout that ties binary payloads to placeholder positions.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use super::ChatFormatter;
use crate::ipc::wire::{CapabilityBlob, LayoutEntry};

/// Capability name carried by coordinate payloads.
const COORD_CAPABILITY: &str = "coord";

/// Multimodal content errors.
#[derive(Error, Debug)]
pub enum MultimodalError {
    #[error("image URL is not a base64 data URL")]
    InvalidDataUrl,

    #[error("invalid base64 payload in data URL")]
    InvalidBase64,

    #[error("message {message} content must be a string, a list of parts, or null")]
    InvalidContentType { message: usize },

    #[error("content part {part} in message {message} is missing 'type'")]
    MissingType { part: usize, message: usize },

    #[error("text part {part} in message {message} is missing 'text'")]
    MissingText { part: usize, message: usize },

    #[error("image part {part} in message {message} is missing 'image_url'")]
    MissingImageUrl { part: usize, message: usize },

    #[error("capability part {part} in message {message} is missing 'name'")]
    MissingCapabilityName { part: usize, message: usize },

    #[error("capability part {part} in message {message} is missing 'data'")]
    MissingCapabilityData { part: usize, message: usize },

    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),

    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("found {found} image placeholders for {expected} image buffers")]
    PlaceholderMismatch { expected: usize, found: usize },

    #[error("found {found} coord placeholders for {expected} coord capabilities")]
    CoordPlaceholderMismatch { expected: usize, found: usize },
}

type Result<T> = std::result::Result<T, MultimodalError>;

/// One typed part of an interaction's content.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    /// Rendered as the model's image placeholder token.
    Image,
    /// Renders as nothing; the layout carries the payload position.
    Capability,
}

/// One normalized turn of a conversation.
#[derive(Debug, Clone)]
pub struct Interaction {
    pub role: String,
    pub parts: Vec<ContentPart>,
}

impl Interaction {
    pub fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            parts: vec![ContentPart::Text(content.to_string())],
        }
    }
}

/// Kind tag for the content-order record accompanying a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Image,
    Capability,
}

/// Normalize a raw role name against the profile's role set.
///
/// `assistant`/`model` map to `agent`, `developer` to `system`; everything
/// else is lower-cased and passed through (the renderer skips roles the
/// profile does not define). A missing role defaults to `user`.
pub fn normalize_role(raw: Option<&str>, available: &HashSet<&str>) -> String {
    let Some(raw) = raw else {
        return "user".to_string();
    };

    let lowered = raw.to_lowercase();
    let normalized = match lowered.as_str() {
        "assistant" | "model" => "agent",
        "developer" => "system",
        other => other,
    };

    if !available.contains(normalized) {
        log::debug!("role '{}' not defined by the formatter profile", normalized);
    }

    normalized.to_string()
}

/// Decode a `data:<mime>;base64,<payload>` URL to raw bytes.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>> {
    static DATA_URL: OnceLock<Regex> = OnceLock::new();
    let pattern = DATA_URL.get_or_init(|| {
        Regex::new(r"^data:[\w\-/+.]+;base64,[A-Za-z0-9+/=]+$").expect("static regex is valid")
    });

    if !pattern.is_match(url) {
        return Err(MultimodalError::InvalidDataUrl);
    }

    let payload = url
        .split_once(";base64,")
        .map(|(_, payload)| payload)
        .ok_or(MultimodalError::InvalidDataUrl)?;

    BASE64
        .decode(payload)
        .map_err(|_| MultimodalError::InvalidBase64)
}

fn image_url_of(part: &Value, part_idx: usize, message_idx: usize) -> Result<String> {
    match part.get("image_url") {
        Some(Value::String(url)) => Ok(url.clone()),
        Some(Value::Object(obj)) => obj
            .get("url")
            .or_else(|| obj.get("data"))
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or(MultimodalError::MissingImageUrl {
                part: part_idx,
                message: message_idx,
            }),
        _ => Err(MultimodalError::MissingImageUrl {
            part: part_idx,
            message: message_idx,
        }),
    }
}

/// Result of normalizing a raw conversation.
pub struct Conversation {
    pub interactions: Vec<Interaction>,
    /// Decoded image payloads, in prompt order.
    pub images: Vec<Vec<u8>>,
    /// Capability payloads, in prompt order.
    pub capabilities: Vec<CapabilityBlob>,
    /// Order of non-text content across the whole conversation.
    pub content_order: Vec<(ContentKind, usize)>,
}

/// Normalize raw chat messages (`role` + `content`) into typed interactions,
/// decoding image and capability payloads along the way.
///
/// `instructions`, when present, is prepended as a system interaction (or a
/// user interaction when the profile has no system role).
pub fn build_conversation(
    formatter: &ChatFormatter,
    messages: &[HashMap<String, Value>],
    instructions: Option<&str>,
) -> Result<Conversation> {
    let available = formatter.control_tokens.roles.available();

    let mut interactions = Vec::with_capacity(messages.len() + 1);
    let mut images = Vec::new();
    let mut capabilities = Vec::new();
    let mut content_order = Vec::new();

    if let Some(instructions) = instructions {
        let role = if available.contains("system") {
            "system"
        } else {
            "user"
        };
        interactions.push(Interaction::text(role, instructions));
    }

    for (message_idx, message) in messages.iter().enumerate() {
        let role = normalize_role(
            message.get("role").and_then(Value::as_str),
            &available,
        );
        let content = message.get("content").cloned().unwrap_or(Value::Null);

        let parts = match content {
            Value::String(text) => vec![ContentPart::Text(text)],
            Value::Null => Vec::new(),
            Value::Array(raw_parts) => {
                let mut parts = Vec::with_capacity(raw_parts.len());
                for (part_idx, raw) in raw_parts.iter().enumerate() {
                    let part_type = raw
                        .get("type")
                        .and_then(Value::as_str)
                        .ok_or(MultimodalError::MissingType {
                            part: part_idx,
                            message: message_idx,
                        })?
                        .to_lowercase();

                    match part_type.as_str() {
                        "text" | "input_text" => {
                            let text = raw.get("text").and_then(Value::as_str).ok_or(
                                MultimodalError::MissingText {
                                    part: part_idx,
                                    message: message_idx,
                                },
                            )?;
                            parts.push(ContentPart::Text(text.to_string()));
                        }
                        "image" | "image_url" | "input_image" => {
                            let url = image_url_of(raw, part_idx, message_idx)?;
                            let decoded = decode_data_url(&url)?;
                            content_order.push((ContentKind::Image, images.len()));
                            images.push(decoded);
                            parts.push(ContentPart::Image);
                        }
                        "capability" => {
                            let name = raw.get("name").and_then(Value::as_str).ok_or(
                                MultimodalError::MissingCapabilityName {
                                    part: part_idx,
                                    message: message_idx,
                                },
                            )?;
                            let data = raw.get("data").and_then(Value::as_array).ok_or(
                                MultimodalError::MissingCapabilityData {
                                    part: part_idx,
                                    message: message_idx,
                                },
                            )?;

                            // Capability payloads are f32 little-endian.
                            let mut payload = Vec::with_capacity(data.len() * 4);
                            for value in data {
                                let v = value.as_f64().unwrap_or(0.0) as f32;
                                payload.extend_from_slice(&v.to_le_bytes());
                            }

                            content_order.push((ContentKind::Capability, capabilities.len()));
                            capabilities.push(CapabilityBlob {
                                name: name.to_string(),
                                position: 0,
                                payload,
                            });
                            parts.push(ContentPart::Capability);
                        }
                        other => {
                            return Err(MultimodalError::UnsupportedContentType(other.to_string()))
                        }
                    }
                }
                parts
            }
            _ => return Err(MultimodalError::InvalidContentType { message: message_idx }),
        };

        interactions.push(Interaction { role, parts });
    }

    Ok(Conversation {
        interactions,
        images,
        capabilities,
        content_order,
    })
}

fn placeholder_positions(haystack: &str, needle: &str) -> Vec<(usize, usize)> {
    let pattern = Regex::new(&regex::escape(needle)).expect("escaped regex is valid");
    pattern
        .find_iter(haystack)
        .map(|m| (m.start(), m.end()))
        .collect()
}

fn push_text(layout: &mut Vec<LayoutEntry>, text: &str) {
    if !text.is_empty() {
        layout.push(LayoutEntry::text(text.len() as u64));
    }
}

/// Build the layout segments describing a rendered prompt.
///
/// Placeholder occurrences (image tokens, and coord tokens when the profile
/// defines them) are collected with their byte positions and walked in
/// textual order; text between placeholders becomes text segments. Image
/// placeholder bytes are counted into the preceding text segment only when
/// `exclude_image_placeholder` is false.
pub fn build_layout(
    prompt_text: &str,
    images: &[Vec<u8>],
    capabilities: &[CapabilityBlob],
    content_order: &[(ContentKind, usize)],
    placeholder_token: &str,
    exclude_image_placeholder: bool,
    coord_placeholder: Option<&str>,
) -> Result<Vec<LayoutEntry>> {
    if images.is_empty() && capabilities.is_empty() {
        if prompt_text.is_empty() {
            return Err(MultimodalError::EmptyPrompt);
        }
        return Ok(vec![LayoutEntry::text(prompt_text.len() as u64)]);
    }

    let image_matches = placeholder_positions(prompt_text, placeholder_token);
    if image_matches.len() != images.len() {
        return Err(MultimodalError::PlaceholderMismatch {
            expected: images.len(),
            found: image_matches.len(),
        });
    }

    let coord_matches = coord_placeholder
        .filter(|token| !token.is_empty())
        .map(|token| placeholder_positions(prompt_text, token))
        .unwrap_or_default();

    if coord_placeholder.is_some() {
        let coord_count = capabilities
            .iter()
            .filter(|c| c.name == COORD_CAPABILITY)
            .count();
        if coord_matches.len() != coord_count {
            return Err(MultimodalError::CoordPlaceholderMismatch {
                expected: coord_count,
                found: coord_matches.len(),
            });
        }
    }

    let mut layout = Vec::new();

    if coord_matches.is_empty() {
        // No coord markers: segments follow the conversation's content order.
        let mut cursor = 0usize;
        let mut image_idx = 0usize;

        for (kind, index) in content_order {
            match kind {
                ContentKind::Image => {
                    let (start, end) = image_matches[image_idx];
                    let text_end = if exclude_image_placeholder { start } else { end };
                    push_text(&mut layout, &prompt_text[cursor..text_end]);
                    layout.push(LayoutEntry::image(images[image_idx].len() as u64));
                    cursor = end;
                    image_idx += 1;
                }
                ContentKind::Capability => {
                    layout.push(LayoutEntry::capability(
                        capabilities[*index].payload.len() as u64,
                    ));
                }
            }
        }

        push_text(&mut layout, &prompt_text[cursor..]);
    } else {
        // Merge image and coord placeholders in textual order.
        let coord_caps: Vec<&CapabilityBlob> = capabilities
            .iter()
            .filter(|c| c.name == COORD_CAPABILITY)
            .collect();

        let mut markers: Vec<(usize, usize, ContentKind, usize)> = Vec::new();
        for (idx, &(start, end)) in image_matches.iter().enumerate() {
            markers.push((start, end, ContentKind::Image, idx));
        }
        for (idx, &(start, end)) in coord_matches.iter().enumerate() {
            markers.push((start, end, ContentKind::Capability, idx));
        }
        markers.sort_by_key(|&(start, _, _, _)| start);

        let mut cursor = 0usize;
        for (start, end, kind, idx) in markers {
            let text_end = match kind {
                ContentKind::Image if !exclude_image_placeholder => end,
                _ => start,
            };
            push_text(&mut layout, &prompt_text[cursor..text_end]);

            match kind {
                ContentKind::Image => {
                    layout.push(LayoutEntry::image(images[idx].len() as u64));
                }
                ContentKind::Capability => {
                    layout.push(LayoutEntry::capability(coord_caps[idx].payload.len() as u64));
                }
            }
            cursor = end;
        }

        push_text(&mut layout, &prompt_text[cursor..]);
    }

    if layout.is_empty() {
        return Err(MultimodalError::EmptyPrompt);
    }

    Ok(layout)
}
