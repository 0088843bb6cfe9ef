//! End-to-end wire protocol checks that run without an engine: formatter
//! output through layout construction into the framed binary payload.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use grove::formatter::multimodal::{build_conversation, build_layout};
use grove::{
    build_request_frame, decode_request_frame, ChatFormatter, LayoutEntry, PromptPayload,
    RequestType, SegmentType,
};

fn llama_model_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        serde_json::json!({"model_type": "llama"}).to_string(),
    )
    .unwrap();
    dir
}

fn message(role: &str, content: serde_json::Value) -> HashMap<String, serde_json::Value> {
    HashMap::from([
        ("role".to_string(), serde_json::json!(role)),
        ("content".to_string(), content),
    ])
}

/// Walk every (offset, size) pair declared by a prompt header and check it
/// fits the region with 16-byte alignment on non-empty blobs.
fn assert_blobs_well_formed(header: &serde_json::Value, region_len: usize) {
    for prompt in header["prompts"].as_array().unwrap() {
        for (offset_key, size_key) in [
            ("text_offset", "text_size"),
            ("image_data_offset", "image_data_size"),
            ("capability_data_offset", "capability_data_size"),
        ] {
            let offset = prompt[offset_key].as_u64().unwrap() as usize;
            let size = prompt[size_key].as_u64().unwrap() as usize;
            assert!(offset + size <= region_len, "{offset_key} out of bounds");
            if size > 0 {
                assert_eq!(offset % 16, 0, "{offset_key} misaligned");
            }
        }

        let layout_offset = prompt["layout_offset"].as_u64().unwrap() as usize;
        let layout_count = prompt["layout_count"].as_u64().unwrap() as usize;
        assert!(layout_offset + layout_count * 16 <= region_len);
        if layout_count > 0 {
            assert_eq!(layout_offset % 16, 0);
        }
    }
}

#[test]
fn rendered_conversation_round_trips_through_the_frame() {
    let model_dir = llama_model_dir();
    let formatter = ChatFormatter::new(model_dir.path()).unwrap();

    let messages = vec![
        message("system", serde_json::json!("You are terse.")),
        message("user", serde_json::json!("What is 2+2?")),
    ];

    let conversation = build_conversation(&formatter, &messages, None).unwrap();
    let prompt_text = formatter.render_conversation(&conversation.interactions, true, false);
    let layout = build_layout(
        &prompt_text,
        &conversation.images,
        &conversation.capabilities,
        &conversation.content_order,
        formatter.image_placeholder_token(),
        formatter.exclude_image_placeholder(),
        None,
    )
    .unwrap();

    let text = formatter.strip_placeholders(&prompt_text);
    let payload = PromptPayload {
        text: text.clone(),
        layout,
        ..Default::default()
    };

    let frame = build_request_frame(
        7,
        "llama",
        "/models/llama",
        RequestType::Generation,
        0xfeed,
        &[payload],
    )
    .unwrap();

    let decoded = decode_request_frame(&frame).unwrap();
    assert_blobs_well_formed(&decoded.header, decoded.region.len());

    let prompt = &decoded.header["prompts"][0];
    let offset = prompt["text_offset"].as_u64().unwrap() as usize;
    let size = prompt["text_size"].as_u64().unwrap() as usize;
    assert_eq!(decoded.blob(offset, size).unwrap(), text.as_bytes());
    assert!(text.contains("What is 2+2?"));
}

#[test]
fn multimodal_prompt_layout_sums_match_blob_sizes() {
    let model_dir = llama_model_dir();
    let formatter = ChatFormatter::new(model_dir.path()).unwrap();

    let image_bytes: Vec<u8> = (0..111u8).collect();
    let data_url = format!("data:image/png;base64,{}", BASE64.encode(&image_bytes));

    let messages = vec![message(
        "user",
        serde_json::json!([
            {"type": "text", "text": "Describe "},
            {"type": "image", "image_url": data_url},
            {"type": "text", "text": " briefly."},
        ]),
    )];

    let conversation = build_conversation(&formatter, &messages, None).unwrap();
    assert_eq!(conversation.images.len(), 1);

    let prompt_text = formatter.render_conversation(&conversation.interactions, true, false);
    let layout = build_layout(
        &prompt_text,
        &conversation.images,
        &conversation.capabilities,
        &conversation.content_order,
        formatter.image_placeholder_token(),
        formatter.exclude_image_placeholder(),
        None,
    )
    .unwrap();

    let text = formatter.strip_placeholders(&prompt_text);

    // The stripped prompt byte length equals the text-segment sum, and the
    // image segments cover exactly the image bytes.
    let text_sum: u64 = layout
        .iter()
        .filter(|e| e.segment == SegmentType::Text)
        .map(|e| e.length)
        .sum();
    let image_sum: u64 = layout
        .iter()
        .filter(|e| e.segment == SegmentType::Image)
        .map(|e| e.length)
        .sum();
    assert_eq!(text_sum, text.len() as u64);
    assert_eq!(image_sum, image_bytes.len() as u64);

    let payload = PromptPayload {
        text,
        images: conversation.images.clone(),
        layout,
        ..Default::default()
    };

    let frame = build_request_frame(
        8,
        "vlm",
        "/models/vlm",
        RequestType::Generation,
        0xbeef,
        &[payload],
    )
    .unwrap();
    let decoded = decode_request_frame(&frame).unwrap();
    assert_blobs_well_formed(&decoded.header, decoded.region.len());

    let prompt = &decoded.header["prompts"][0];
    assert_eq!(prompt["image_count"], 1);
    let image_offset = prompt["image_data_offset"].as_u64().unwrap() as usize;
    let image_size = prompt["image_data_size"].as_u64().unwrap() as usize;
    assert_eq!(decoded.blob(image_offset, image_size).unwrap(), &image_bytes);
}

#[test]
fn batched_frames_keep_prompts_separable() {
    let prompts: Vec<PromptPayload> = (0..4)
        .map(|i| PromptPayload {
            text: format!("prompt number {}", i),
            layout: vec![LayoutEntry::text(format!("prompt number {}", i).len() as u64)],
            rng_seed: i as u64 + 1,
            ..Default::default()
        })
        .collect();

    let frame = build_request_frame(
        99,
        "llama",
        "/models/llama",
        RequestType::Generation,
        0x1234,
        &prompts,
    )
    .unwrap();

    let decoded = decode_request_frame(&frame).unwrap();
    assert_blobs_well_formed(&decoded.header, decoded.region.len());

    let headers = decoded.header["prompts"].as_array().unwrap();
    assert_eq!(headers.len(), 4);
    for (i, prompt) in headers.iter().enumerate() {
        assert_eq!(prompt["prompt_index"], i);
        let offset = prompt["text_offset"].as_u64().unwrap() as usize;
        let size = prompt["text_size"].as_u64().unwrap() as usize;
        assert_eq!(
            decoded.blob(offset, size).unwrap(),
            format!("prompt number {}", i).as_bytes()
        );
        assert_eq!(prompt["rng_seed"].as_u64().unwrap(), i as u64 + 1);
    }
}
