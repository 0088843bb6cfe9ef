//! Binary serialization for the PIE request protocol.
//!
//! Wire format, bit-exact:
//!
//! ```text
//! [0..4)    u32 little-endian: length L of the JSON header
//! [4..4+L)  JSON header, UTF-8, sorted keys
//! [4+L..)   binary region; blobs separated by 16-byte alignment padding
//! ```
//!
//! The header carries per-prompt metadata referencing blobs by
//! `(offset, size)` within the binary region. Layout records tie text,
//! image, and capability bytes to positions in the rendered prompt.

use std::collections::HashMap;

use serde_json::{json, Value};
use thiserror::Error;

/// Alignment boundary between blobs in the binary region.
pub const PAYLOAD_ALIGNMENT: usize = 16;

/// One layout record: 1 byte type, 7 bytes zero pad, u64 LE length.
const LAYOUT_RECORD_SIZE: usize = 16;

/// Serialization errors.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("request contains no prompts")]
    NoPrompts,

    #[error("request metadata exceeds the 4-byte length prefix capacity")]
    MetadataTooLarge,

    #[error("unsupported layout segment type {0}")]
    UnsupportedSegmentType(u8),

    #[error("layout {kind} bytes mismatch: expected {expected}, got {got}")]
    LayoutMismatch {
        kind: &'static str,
        expected: u64,
        got: u64,
    },

    #[error("truncated request frame")]
    Truncated,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, WireError>;

/// Layout segment type codes, matching the engine's serialized enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentType {
    Text = 0,
    Image = 1,
    Capability = 2,
}

impl SegmentType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(SegmentType::Text),
            1 => Ok(SegmentType::Image),
            2 => Ok(SegmentType::Capability),
            other => Err(WireError::UnsupportedSegmentType(other)),
        }
    }
}

/// Request type codes, matching the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RequestType {
    Generation = 0,
    Embedding = 1,
    Query = 2,
    Point = 3,
    Detect = 4,
    Agent = 5,
    Omni = 6,
}

/// One entry of the prompt layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutEntry {
    pub segment: SegmentType,
    pub length: u64,
}

impl LayoutEntry {
    pub fn text(length: u64) -> Self {
        Self {
            segment: SegmentType::Text,
            length,
        }
    }

    pub fn image(length: u64) -> Self {
        Self {
            segment: SegmentType::Image,
            length,
        }
    }

    pub fn capability(length: u64) -> Self {
        Self {
            segment: SegmentType::Capability,
            length,
        }
    }
}

/// A named capability payload injected at a position in the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityBlob {
    pub name: String,
    pub position: u32,
    pub payload: Vec<u8>,
}

/// Everything needed to serialize one prompt of a request.
#[derive(Debug, Clone)]
pub struct PromptPayload {
    pub text: String,
    pub images: Vec<Vec<u8>>,
    pub capabilities: Vec<CapabilityBlob>,
    /// Layout segments; when empty a default layout is derived (one text
    /// segment followed by one image segment per image).
    pub layout: Vec<LayoutEntry>,

    pub max_generated_tokens: i32,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: i32,
    pub min_p: f64,
    pub rng_seed: u64,
    pub stop_sequences: Vec<String>,
    pub num_candidates: i32,
    pub best_of: Option<i32>,
    pub final_candidates: Option<i32>,
    pub top_logprobs: i32,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub repetition_penalty: f64,
    pub repetition_context_size: i32,
    pub logit_bias: HashMap<i32, f64>,
    pub tool_schemas_json: String,
    pub response_format_json: String,
    pub task_name: Option<String>,
    pub reasoning_effort: Option<String>,
}

impl Default for PromptPayload {
    fn default() -> Self {
        Self {
            text: String::new(),
            images: Vec::new(),
            capabilities: Vec::new(),
            layout: Vec::new(),
            max_generated_tokens: crate::defaults::MAX_GENERATED_TOKENS,
            temperature: crate::defaults::TEMPERATURE,
            top_p: crate::defaults::TOP_P,
            top_k: crate::defaults::TOP_K,
            min_p: crate::defaults::MIN_P,
            rng_seed: 0,
            stop_sequences: Vec::new(),
            num_candidates: crate::defaults::NUM_CANDIDATES,
            best_of: None,
            final_candidates: None,
            top_logprobs: crate::defaults::TOP_LOGPROBS,
            frequency_penalty: crate::defaults::FREQUENCY_PENALTY,
            presence_penalty: crate::defaults::PRESENCE_PENALTY,
            repetition_penalty: crate::defaults::REPETITION_PENALTY,
            repetition_context_size: crate::defaults::REPETITION_CONTEXT_SIZE,
            logit_bias: HashMap::new(),
            tool_schemas_json: String::new(),
            response_format_json: String::new(),
            task_name: None,
            reasoning_effort: None,
        }
    }
}

impl PromptPayload {
    /// Number of final deltas the engine emits for this prompt.
    ///
    /// Defaults cascade: `final_candidates` falls back to `best_of`, which
    /// falls back to `num_candidates`.
    pub fn final_candidate_count(&self) -> usize {
        let num_candidates = self.num_candidates.max(1);
        let best_of = self.best_of.unwrap_or(num_candidates).max(1);
        self.final_candidates.unwrap_or(best_of).max(1) as usize
    }
}

/// Align an offset up to the next payload boundary.
fn align(offset: usize) -> usize {
    let remainder = offset % PAYLOAD_ALIGNMENT;
    if remainder == 0 {
        offset
    } else {
        offset + (PAYLOAD_ALIGNMENT - remainder)
    }
}

/// Accumulates blobs at aligned offsets, then writes them into one buffer.
struct BlobRegion {
    cursor: usize,
    chunks: Vec<(usize, Vec<u8>)>,
}

impl BlobRegion {
    fn new() -> Self {
        Self {
            cursor: 0,
            chunks: Vec::new(),
        }
    }

    /// Reserve space for `bytes`, aligned. Empty blobs occupy no space and
    /// report `(0, 0)`.
    fn push(&mut self, bytes: Vec<u8>) -> (usize, usize) {
        if bytes.is_empty() {
            return (0, 0);
        }
        let offset = align(self.cursor);
        let size = bytes.len();
        self.cursor = offset + size;
        self.chunks.push((offset, bytes));
        (offset, size)
    }

    /// Materialize the region; gap bytes stay zero.
    fn finish(self) -> Vec<u8> {
        let mut buffer = vec![0u8; self.cursor];
        for (offset, bytes) in self.chunks {
            buffer[offset..offset + bytes.len()].copy_from_slice(&bytes);
        }
        buffer
    }
}

/// Encode layout entries into their 16-byte record form.
pub fn encode_layout(entries: &[LayoutEntry]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(entries.len() * LAYOUT_RECORD_SIZE);
    for entry in entries {
        buffer.push(entry.segment.code());
        buffer.extend_from_slice(&[0u8; 7]);
        buffer.extend_from_slice(&entry.length.to_le_bytes());
    }
    buffer
}

/// Decode `count` layout records starting at `offset` in a binary region.
pub fn decode_layout(region: &[u8], offset: usize, count: usize) -> Result<Vec<LayoutEntry>> {
    let end = count
        .checked_mul(LAYOUT_RECORD_SIZE)
        .and_then(|span| offset.checked_add(span))
        .ok_or(WireError::Truncated)?;
    if end > region.len() {
        return Err(WireError::Truncated);
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let record = &region[offset + i * LAYOUT_RECORD_SIZE..offset + (i + 1) * LAYOUT_RECORD_SIZE];
        let segment = SegmentType::from_code(record[0])?;
        let length = u64::from_le_bytes(record[8..16].try_into().expect("record is 16 bytes"));
        entries.push(LayoutEntry { segment, length });
    }
    Ok(entries)
}

/// Check that per-type layout sums agree with the blob sizes they describe.
fn validate_layout(
    layout: &[LayoutEntry],
    text_size: u64,
    image_total: u64,
    capability_total: u64,
) -> Result<()> {
    let mut text_sum = 0u64;
    let mut image_sum = 0u64;
    let mut capability_sum = 0u64;
    let mut has_capability = false;

    for entry in layout {
        match entry.segment {
            SegmentType::Text => text_sum += entry.length,
            SegmentType::Image => image_sum += entry.length,
            SegmentType::Capability => {
                has_capability = true;
                capability_sum += entry.length;
            }
        }
    }

    if text_sum != text_size {
        return Err(WireError::LayoutMismatch {
            kind: "text",
            expected: text_size,
            got: text_sum,
        });
    }
    if image_sum != image_total {
        return Err(WireError::LayoutMismatch {
            kind: "image",
            expected: image_total,
            got: image_sum,
        });
    }
    if has_capability && capability_sum != capability_total {
        return Err(WireError::LayoutMismatch {
            kind: "capability",
            expected: capability_total,
            got: capability_sum,
        });
    }

    Ok(())
}

/// Default layout: the prompt text, then each image in order.
fn derive_layout(prompt: &PromptPayload) -> Vec<LayoutEntry> {
    let mut layout = Vec::new();
    if !prompt.text.is_empty() {
        layout.push(LayoutEntry::text(prompt.text.len() as u64));
    }
    for image in &prompt.images {
        layout.push(LayoutEntry::image(image.len() as u64));
    }
    layout
}

/// Build the framed request payload for one or more prompts.
pub fn build_request_frame(
    request_id: u64,
    model_id: &str,
    model_path: &str,
    request_type: RequestType,
    response_channel_id: u64,
    prompts: &[PromptPayload],
) -> Result<Vec<u8>> {
    if prompts.is_empty() {
        return Err(WireError::NoPrompts);
    }

    let mut region = BlobRegion::new();
    let mut prompt_headers = Vec::with_capacity(prompts.len());

    for (prompt_index, prompt) in prompts.iter().enumerate() {
        let text_bytes = prompt.text.as_bytes().to_vec();
        let image_total: u64 = prompt.images.iter().map(|i| i.len() as u64).sum();
        let capability_total: u64 = prompt
            .capabilities
            .iter()
            .map(|c| c.payload.len() as u64)
            .sum();

        let layout = if prompt.layout.is_empty() {
            derive_layout(prompt)
        } else {
            prompt.layout.clone()
        };
        validate_layout(&layout, text_bytes.len() as u64, image_total, capability_total)?;

        let (text_offset, text_size) = region.push(text_bytes);

        let image_data: Vec<u8> = prompt.images.iter().flatten().copied().collect();
        let (image_data_offset, image_data_size) = region.push(image_data);

        let image_sizes: Vec<u8> = prompt
            .images
            .iter()
            .flat_map(|i| (i.len() as u64).to_le_bytes())
            .collect();
        let (image_sizes_offset, _) = region.push(image_sizes);

        let capability_data: Vec<u8> = prompt
            .capabilities
            .iter()
            .flat_map(|c| c.payload.iter().copied())
            .collect();
        let (capability_data_offset, capability_data_size) = region.push(capability_data);

        let (layout_offset, _) = region.push(encode_layout(&layout));

        let capabilities: Vec<Value> = prompt
            .capabilities
            .iter()
            .map(|c| {
                json!({
                    "name": c.name,
                    "position": c.position,
                    "payload_size": c.payload.len(),
                })
            })
            .collect();

        let mut logit_bias: Vec<(i32, f64)> =
            prompt.logit_bias.iter().map(|(&t, &b)| (t, b)).collect();
        logit_bias.sort_by_key(|&(token, _)| token);
        let logit_bias: Vec<Value> = logit_bias
            .into_iter()
            .map(|(token, bias)| json!([token, bias]))
            .collect();

        let num_candidates = prompt.num_candidates.max(1);
        let best_of = prompt.best_of.unwrap_or(num_candidates).max(1);
        let final_candidates = prompt.final_candidates.unwrap_or(best_of).max(1);

        prompt_headers.push(json!({
            "prompt_index": prompt_index,
            "text_offset": text_offset,
            "text_size": text_size,
            "image_data_offset": image_data_offset,
            "image_data_size": image_data_size,
            "image_sizes_offset": image_sizes_offset,
            "image_count": prompt.images.len(),
            "capability_data_offset": capability_data_offset,
            "capability_data_size": capability_data_size,
            "capabilities": capabilities,
            "layout_offset": layout_offset,
            "layout_count": layout.len(),
            "max_generated_tokens": prompt.max_generated_tokens,
            "temperature": prompt.temperature,
            "top_p": prompt.top_p,
            "top_k": prompt.top_k,
            "min_p": prompt.min_p,
            "rng_seed": prompt.rng_seed,
            "num_candidates": num_candidates,
            "best_of": best_of,
            "final_candidates": final_candidates,
            "top_logprobs": prompt.top_logprobs,
            "frequency_penalty": prompt.frequency_penalty,
            "presence_penalty": prompt.presence_penalty,
            "repetition_penalty": prompt.repetition_penalty,
            "repetition_context_size": prompt.repetition_context_size,
            "stop_sequences": prompt.stop_sequences,
            "logit_bias": logit_bias,
            "tool_schemas_json": prompt.tool_schemas_json,
            "response_format_json": prompt.response_format_json,
            "task_name": prompt.task_name,
            "reasoning_effort": prompt.reasoning_effort,
        }));
    }

    let header = json!({
        "request_id": request_id,
        "model_id": model_id,
        "model_path": model_path,
        "request_type": request_type as i32,
        "request_channel_id": 0,
        "response_channel_id": response_channel_id,
        "prompts": prompt_headers,
    });

    let header_bytes = serde_json::to_vec(&header)?;
    if header_bytes.len() > u32::MAX as usize {
        return Err(WireError::MetadataTooLarge);
    }

    let region = region.finish();
    let mut frame = Vec::with_capacity(4 + header_bytes.len() + region.len());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(&region);

    Ok(frame)
}

/// A decoded request frame: header JSON plus the raw binary region.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub header: Value,
    pub region: Vec<u8>,
}

impl DecodedFrame {
    /// Fetch `(offset, size)` bytes out of the region, bounds-checked.
    pub fn blob(&self, offset: usize, size: usize) -> Result<&[u8]> {
        let end = offset.checked_add(size).ok_or(WireError::Truncated)?;
        if end > self.region.len() {
            return Err(WireError::Truncated);
        }
        Ok(&self.region[offset..end])
    }
}

/// Split a request frame back into its header and binary region.
pub fn decode_request_frame(frame: &[u8]) -> Result<DecodedFrame> {
    if frame.len() < 4 {
        return Err(WireError::Truncated);
    }
    let header_len = u32::from_le_bytes(frame[..4].try_into().expect("prefix is 4 bytes")) as usize;
    let header_end = 4usize.checked_add(header_len).ok_or(WireError::Truncated)?;
    if frame.len() < header_end {
        return Err(WireError::Truncated);
    }

    let header: Value = serde_json::from_slice(&frame[4..header_end])?;
    Ok(DecodedFrame {
        header,
        region: frame[header_end..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_prompt(text: &str) -> PromptPayload {
        PromptPayload {
            text: text.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn align_rounds_up_to_boundary() {
        assert_eq!(align(0), 0);
        assert_eq!(align(1), 16);
        assert_eq!(align(16), 16);
        assert_eq!(align(17), 32);
        assert_eq!(align(31), 32);
    }

    #[test]
    fn empty_prompt_list_is_rejected() {
        let result = build_request_frame(1, "m", "/m", RequestType::Generation, 7, &[]);
        assert!(matches!(result, Err(WireError::NoPrompts)));
    }

    #[test]
    fn text_frame_round_trips() {
        let frame = build_request_frame(
            42,
            "test-model",
            "/models/test",
            RequestType::Generation,
            0xabcd,
            &[text_prompt("Hello, world!")],
        )
        .unwrap();

        let decoded = decode_request_frame(&frame).unwrap();
        assert_eq!(decoded.header["request_id"], 42);
        assert_eq!(decoded.header["model_id"], "test-model");
        assert_eq!(decoded.header["request_type"], 0);
        assert_eq!(decoded.header["response_channel_id"], 0xabcd);

        let prompt = &decoded.header["prompts"][0];
        let text_offset = prompt["text_offset"].as_u64().unwrap() as usize;
        let text_size = prompt["text_size"].as_u64().unwrap() as usize;
        assert_eq!(decoded.blob(text_offset, text_size).unwrap(), b"Hello, world!");

        // One derived text segment covering the whole prompt.
        let layout_offset = prompt["layout_offset"].as_u64().unwrap() as usize;
        let layout_count = prompt["layout_count"].as_u64().unwrap() as usize;
        let layout = decode_layout(&decoded.region, layout_offset, layout_count).unwrap();
        assert_eq!(layout, vec![LayoutEntry::text(13)]);
        assert_eq!(layout_offset % PAYLOAD_ALIGNMENT, 0);
    }

    #[test]
    fn sorted_header_keys() {
        let frame = build_request_frame(
            1,
            "m",
            "/m",
            RequestType::Generation,
            1,
            &[text_prompt("hi")],
        )
        .unwrap();
        let header_len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        let header = std::str::from_utf8(&frame[4..4 + header_len]).unwrap();

        let model_id = header.find("\"model_id\"").unwrap();
        let model_path = header.find("\"model_path\"").unwrap();
        let request_id = header.find("\"request_id\"").unwrap();
        assert!(model_id < model_path && model_path < request_id);
    }

    #[test]
    fn multimodal_blobs_are_aligned_and_sized() {
        let images = vec![vec![1u8; 5], vec![2u8; 300]];
        let prompt = PromptPayload {
            text: "look: ".to_string(),
            layout: vec![
                LayoutEntry::text(6),
                LayoutEntry::image(5),
                LayoutEntry::image(300),
            ],
            images,
            ..Default::default()
        };

        let frame =
            build_request_frame(9, "vlm", "/vlm", RequestType::Generation, 3, &[prompt]).unwrap();
        let decoded = decode_request_frame(&frame).unwrap();
        let meta = &decoded.header["prompts"][0];

        for key in [
            "text_offset",
            "image_data_offset",
            "image_sizes_offset",
            "layout_offset",
        ] {
            let offset = meta[key].as_u64().unwrap() as usize;
            assert_eq!(offset % PAYLOAD_ALIGNMENT, 0, "{key} not aligned");
        }

        assert_eq!(meta["image_count"], 2);
        assert_eq!(meta["image_data_size"], 305);

        let sizes_offset = meta["image_sizes_offset"].as_u64().unwrap() as usize;
        let sizes = decoded.blob(sizes_offset, 16).unwrap();
        assert_eq!(u64::from_le_bytes(sizes[..8].try_into().unwrap()), 5);
        assert_eq!(u64::from_le_bytes(sizes[8..].try_into().unwrap()), 300);

        let image_offset = meta["image_data_offset"].as_u64().unwrap() as usize;
        let image_data = decoded.blob(image_offset, 305).unwrap();
        assert_eq!(&image_data[..5], &[1u8; 5]);
        assert_eq!(&image_data[5..], &[2u8; 300]);
    }

    #[test]
    fn layout_text_mismatch_is_rejected() {
        let prompt = PromptPayload {
            text: "abcdef".to_string(),
            layout: vec![LayoutEntry::text(5)],
            ..Default::default()
        };
        let result = build_request_frame(1, "m", "/m", RequestType::Generation, 1, &[prompt]);
        assert!(matches!(
            result,
            Err(WireError::LayoutMismatch {
                kind: "text",
                expected: 6,
                got: 5,
            })
        ));
    }

    #[test]
    fn layout_image_mismatch_is_rejected() {
        let prompt = PromptPayload {
            text: "x".to_string(),
            images: vec![vec![0u8; 10]],
            layout: vec![LayoutEntry::text(1), LayoutEntry::image(9)],
            ..Default::default()
        };
        let result = build_request_frame(1, "m", "/m", RequestType::Generation, 1, &[prompt]);
        assert!(matches!(
            result,
            Err(WireError::LayoutMismatch { kind: "image", .. })
        ));
    }

    #[test]
    fn unknown_segment_code_is_rejected() {
        let mut region = encode_layout(&[LayoutEntry::text(4)]);
        region[0] = 9;
        let result = decode_layout(&region, 0, 1);
        assert!(matches!(result, Err(WireError::UnsupportedSegmentType(9))));
    }

    #[test]
    fn layout_records_are_sixteen_bytes() {
        let encoded = encode_layout(&[LayoutEntry::image(77), LayoutEntry::capability(12)]);
        assert_eq!(encoded.len(), 32);
        assert_eq!(encoded[0], 1);
        assert_eq!(&encoded[1..8], &[0u8; 7]);
        assert_eq!(u64::from_le_bytes(encoded[8..16].try_into().unwrap()), 77);
        assert_eq!(encoded[16], 2);
    }

    #[test]
    fn batch_prompts_share_one_region() {
        let frame = build_request_frame(
            5,
            "m",
            "/m",
            RequestType::Generation,
            1,
            &[text_prompt("first"), text_prompt("second prompt")],
        )
        .unwrap();
        let decoded = decode_request_frame(&frame).unwrap();
        let prompts = decoded.header["prompts"].as_array().unwrap();
        assert_eq!(prompts.len(), 2);

        let second = &prompts[1];
        let offset = second["text_offset"].as_u64().unwrap() as usize;
        let size = second["text_size"].as_u64().unwrap() as usize;
        assert_eq!(decoded.blob(offset, size).unwrap(), b"second prompt");
        assert_eq!(offset % PAYLOAD_ALIGNMENT, 0);
        assert_eq!(second["prompt_index"], 1);
    }

    #[test]
    fn final_candidate_count_cascades() {
        let mut prompt = PromptPayload::default();
        assert_eq!(prompt.final_candidate_count(), 1);

        prompt.num_candidates = 4;
        assert_eq!(prompt.final_candidate_count(), 4);

        prompt.best_of = Some(8);
        assert_eq!(prompt.final_candidate_count(), 8);

        prompt.final_candidates = Some(2);
        assert_eq!(prompt.final_candidate_count(), 2);
    }
}
