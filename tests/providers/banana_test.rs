//! Image connector tests: title routing and generation parameters.

use std::collections::BTreeMap;

use serde_json::json;

use lectern::providers::banana::{
    extract_generation_config, extract_prompt, is_imagen_model, is_title_generation_request,
    GenerationConfig,
};
use lectern::providers::ChatMessage;

#[test]
fn openwebui_task_prompt_routes_to_title() {
    // The shape OpenWebUI sends for tag generation.
    let messages = vec![ChatMessage::text(
        "user",
        "### Task:\nGenerate 1-3 broad tags categorizing the main themes of the chat history.",
    )];
    assert!(is_title_generation_request(&messages));
}

#[test]
fn title_patterns_match() {
    for prompt in [
        "Please generate a short title for this conversation",
        "Create a concise title",
        "Summarize this conversation in one line. Guidelines: keep it short",
        "Generate 1-3 broad tags for the chat",
    ] {
        let messages = vec![ChatMessage::text("user", prompt)];
        assert!(is_title_generation_request(&messages), "should match: {prompt}");
    }
}

#[test]
fn image_prompts_are_not_titles() {
    let messages = vec![ChatMessage::text("user", "a watercolor fox in the snow")];
    assert!(!is_title_generation_request(&messages));
    assert!(!is_title_generation_request(&[]));
}

#[test]
fn only_last_message_is_inspected() {
    let messages = vec![
        ChatMessage::text("user", "generate a title for this"),
        ChatMessage::text("assistant", "ok"),
        ChatMessage::text("user", "now paint a sunset"),
    ];
    assert!(!is_title_generation_request(&messages));
}

#[test]
fn generation_defaults() {
    let config = extract_generation_config(&BTreeMap::new());
    assert_eq!(config, GenerationConfig::default());
    assert_eq!(config.number_of_images, 1);
    assert_eq!(config.aspect_ratio, "16:9");
    assert_eq!(config.extension(), "jpg");
}

#[test]
fn number_of_images_clamped_to_range() {
    let mut body = BTreeMap::new();
    body.insert("number_of_images".to_owned(), json!(9));
    assert_eq!(extract_generation_config(&body).number_of_images, 4);

    body.insert("number_of_images".to_owned(), json!(0));
    assert_eq!(extract_generation_config(&body).number_of_images, 1);
}

#[test]
fn invalid_aspect_ratio_and_mime_fall_back() {
    let mut body = BTreeMap::new();
    body.insert("aspect_ratio".to_owned(), json!("2:1"));
    body.insert("output_mime_type".to_owned(), json!("image/tiff"));
    let config = extract_generation_config(&body);
    assert_eq!(config.aspect_ratio, "16:9");
    assert_eq!(config.output_mime_type, "image/jpeg");
}

#[test]
fn valid_generation_params_accepted() {
    let mut body = BTreeMap::new();
    body.insert("number_of_images".to_owned(), json!(3));
    body.insert("aspect_ratio".to_owned(), json!("9:16"));
    body.insert("output_mime_type".to_owned(), json!("image/webp"));
    let config = extract_generation_config(&body);
    assert_eq!(config.number_of_images, 3);
    assert_eq!(config.aspect_ratio, "9:16");
    assert_eq!(config.extension(), "webp");
}

#[test]
fn prompt_comes_from_last_user_message() {
    let messages = vec![
        ChatMessage::text("user", "first"),
        ChatMessage::text("assistant", "![image](x)"),
        ChatMessage::text("user", "a red balloon"),
    ];
    assert_eq!(extract_prompt(&messages), "a red balloon");
}

#[test]
fn model_family_dispatch() {
    assert!(is_imagen_model("imagen-4.0-generate-001"));
    assert!(is_imagen_model("imagen-4.0-fast-generate-001"));
    assert!(!is_imagen_model("gemini-2.5-flash-image"));
}
