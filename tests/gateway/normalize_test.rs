//! Multipart normalization tests: MIME sniffing and image attachment.

use base64::Engine;
use serde_json::{json, Value};

use lectern::gateway::completions::{attach_image, sniff_mime};
use lectern::providers::ChatMessage;

#[test]
fn mime_sniffed_by_extension() {
    assert_eq!(sniff_mime("cat.jpg"), "image/jpeg");
    assert_eq!(sniff_mime("CAT.JPEG"), "image/jpeg");
    assert_eq!(sniff_mime("diagram.png"), "image/png");
    assert_eq!(sniff_mime("anim.gif"), "image/gif");
    assert_eq!(sniff_mime("photo.webp"), "image/webp");
    assert_eq!(sniff_mime("report.pdf"), "application/octet-stream");
    assert_eq!(sniff_mime("no_extension"), "application/octet-stream");
}

#[test]
fn string_content_becomes_part_list_with_data_url() {
    let mut messages = vec![ChatMessage::text("user", "describe")];
    attach_image(&mut messages, "cat.png", b"pngbytes");

    let parts = messages[0].content.as_array().expect("part list");
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0], json!({"type": "text", "text": "describe"}));
    assert_eq!(parts[1]["type"], "image_url");

    let url = parts[1]["image_url"]["url"].as_str().expect("url");
    let expected = base64::engine::general_purpose::STANDARD.encode(b"pngbytes");
    assert_eq!(url, &format!("data:image/png;base64,{expected}"));
}

#[test]
fn images_append_to_existing_part_list() {
    let mut messages = vec![ChatMessage {
        role: "user".to_owned(),
        content: json!([{"type": "text", "text": "look"}]),
        tool_calls: None,
        tool_call_id: None,
    }];
    attach_image(&mut messages, "a.jpg", b"one");
    attach_image(&mut messages, "b.webp", b"two");

    let parts = messages[0].content.as_array().expect("part list");
    assert_eq!(parts.len(), 3);
    assert!(parts[1]["image_url"]["url"]
        .as_str()
        .expect("url")
        .starts_with("data:image/jpeg;base64,"));
    assert!(parts[2]["image_url"]["url"]
        .as_str()
        .expect("url")
        .starts_with("data:image/webp;base64,"));
}

#[test]
fn image_targets_last_user_message() {
    let mut messages = vec![
        ChatMessage::text("user", "first"),
        ChatMessage::text("assistant", "answer"),
        ChatMessage::text("user", "second"),
    ];
    attach_image(&mut messages, "x.png", b"img");

    assert_eq!(messages[0].content, Value::String("first".to_owned()));
    assert!(messages[2].content.is_array(), "last user message got the image");
}

#[test]
fn upload_without_user_message_is_dropped() {
    let mut messages = vec![ChatMessage::text("system", "sys")];
    attach_image(&mut messages, "x.png", b"img");
    assert_eq!(messages[0].content, Value::String("sys".to_owned()));
}
