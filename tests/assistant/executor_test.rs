//! Prompt assembly tests.

use serde_json::{json, Value};

use lectern::assistant::executor::{assemble_messages, render_template};
use lectern::assistant::{Assistant, AssistantMetadata};
use lectern::providers::ChatMessage;

fn assistant(system_prompt: &str, template: &str) -> Assistant {
    Assistant {
        id: 7,
        name: "helper".to_owned(),
        owner: "amy@acme.test".to_owned(),
        description: String::new(),
        system_prompt: system_prompt.to_owned(),
        prompt_template: template.to_owned(),
        metadata: AssistantMetadata::default(),
        publication: None,
    }
}

#[test]
fn template_substitutes_both_placeholders() {
    let rendered = render_template(
        "Context:\n{context}\n\nQuestion: {user_input}",
        "retrieved facts",
        "what is rust",
    );
    assert_eq!(rendered, "Context:\nretrieved facts\n\nQuestion: what is rust");
}

#[test]
fn system_prompt_is_prepended_once() {
    let messages = vec![ChatMessage::text("user", "hi")];
    let assembled = assemble_messages(&assistant("be kind", ""), messages, None);
    assert_eq!(assembled.len(), 2);
    assert_eq!(assembled[0].role, "system");
    assert_eq!(assembled[0].content, json!("be kind"));

    // A client-supplied system message wins.
    let messages = vec![
        ChatMessage::text("system", "client system"),
        ChatMessage::text("user", "hi"),
    ];
    let assembled = assemble_messages(&assistant("be kind", ""), messages, None);
    assert_eq!(assembled.len(), 2);
    assert_eq!(assembled[0].content, json!("client system"));
}

#[test]
fn context_renders_into_last_user_message() {
    let messages = vec![
        ChatMessage::text("user", "earlier question"),
        ChatMessage::text("assistant", "earlier answer"),
        ChatMessage::text("user", "current question"),
    ];
    let assembled = assemble_messages(
        &assistant("", "{context}\n---\n{user_input}"),
        messages,
        Some("facts"),
    );

    // History untouched.
    assert_eq!(assembled[0].content, json!("earlier question"));
    assert_eq!(assembled[1].content, json!("earlier answer"));
    // Last user message rendered.
    assert_eq!(assembled[2].content, json!("facts\n---\ncurrent question"));
}

#[test]
fn default_template_applies_when_context_present() {
    let messages = vec![ChatMessage::text("user", "q")];
    let assembled = assemble_messages(&assistant("", ""), messages, Some("ctx"));
    let text = assembled
        .last()
        .and_then(|m| m.content.as_str())
        .expect("text content");
    assert!(text.contains("ctx"));
    assert!(text.contains('q'));
}

#[test]
fn no_template_no_context_leaves_messages_alone() {
    let messages = vec![ChatMessage::text("user", "q")];
    let assembled = assemble_messages(&assistant("", ""), messages.clone(), None);
    assert_eq!(assembled[0].content, messages[0].content);
}

#[test]
fn multimodal_user_message_keeps_image_parts() {
    let messages = vec![ChatMessage {
        role: "user".to_owned(),
        content: json!([
            {"type": "text", "text": "describe"},
            {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA"}}
        ]),
        tool_calls: None,
        tool_call_id: None,
    }];
    let assembled = assemble_messages(
        &assistant("", "{context} | {user_input}"),
        messages,
        Some("ctx"),
    );

    let parts = assembled[0].content.as_array().expect("still a part list");
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0]["text"], "ctx | describe");
    assert_eq!(parts[1]["type"], "image_url");
}

#[test]
fn template_without_context_renders_empty_placeholder() {
    let messages = vec![ChatMessage::text("user", "q")];
    let assembled = assemble_messages(&assistant("", "[{context}] {user_input}"), messages, None);
    assert_eq!(assembled[0].content, Value::String("[] q".to_owned()));
}
