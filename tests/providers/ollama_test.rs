//! Ollama connector wire-format tests.

use std::collections::BTreeMap;

use serde_json::json;

use lectern::providers::ollama::{build_body, format_messages, to_openai_completion};
use lectern::providers::ChatMessage;

#[test]
fn format_messages_flattens_multimodal_content() {
    let messages = vec![
        ChatMessage::text("system", "s"),
        ChatMessage {
            role: "user".to_owned(),
            content: json!([
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA"}}
            ]),
            tool_calls: None,
            tool_call_id: None,
        },
    ];

    let formatted = format_messages(&messages);
    assert_eq!(formatted[0]["role"], "system");
    assert_eq!(formatted[1]["content"], "what is this");
}

#[test]
fn build_body_is_ollama_native() {
    let body = build_body("llama3.1", &[ChatMessage::text("user", "hi")], true, &BTreeMap::new());
    assert_eq!(body["model"], "llama3.1");
    assert_eq!(body["stream"], true);
    assert!(body["messages"].is_array());
    // No OpenAI-isms in the native body.
    assert!(body.get("tool_choice").is_none());
}

#[test]
fn build_body_forwards_sampling_options_only() {
    let mut client_body = BTreeMap::new();
    client_body.insert("temperature".to_owned(), json!(0.5));
    client_body.insert("top_p".to_owned(), json!(0.9));
    client_body.insert("top_k".to_owned(), json!(40));
    client_body.insert("max_tokens".to_owned(), json!(100));

    let body = build_body("m", &[ChatMessage::text("user", "x")], false, &client_body);
    assert_eq!(body["temperature"], 0.5);
    assert_eq!(body["top_p"], 0.9);
    assert_eq!(body["top_k"], 40);
    assert!(body.get("max_tokens").is_none());
}

#[test]
fn completion_wrapper_reports_unknown_usage() {
    let completion = to_openai_completion("hello", "llama3.1");
    assert_eq!(completion["object"], "chat.completion");
    assert_eq!(completion["model"], "llama3.1");
    assert_eq!(completion["choices"][0]["message"]["content"], "hello");
    assert_eq!(completion["choices"][0]["finish_reason"], "stop");
    assert_eq!(completion["usage"]["prompt_tokens"], -1);
    assert_eq!(completion["usage"]["completion_tokens"], -1);
    assert_eq!(completion["usage"]["total_tokens"], -1);
}
