//! Frame model and SSE serialization tests.

use futures::StreamExt;
use serde_json::json;

use lectern::providers::sse::{data_payload, frame_to_sse, serialize_frames, DONE_SENTINEL};
use lectern::providers::{ChunkEnvelope, CompletionError, ErrorKind, Frame};

fn collect(frames: Vec<Frame>) -> Vec<String> {
    let stream = serialize_frames(futures::stream::iter(frames), "m".to_owned());
    futures::executor::block_on(stream.collect::<Vec<_>>())
}

#[test]
fn data_payload_strips_prefix() {
    assert_eq!(data_payload("data: {\"a\":1}"), Some("{\"a\":1}"));
    assert_eq!(data_payload("data:[DONE]"), Some("[DONE]"));
    assert_eq!(data_payload(": comment"), None);
    assert_eq!(data_payload("event: foo"), None);
}

#[test]
fn every_stream_ends_with_exactly_one_done() {
    let events = collect(vec![
        Frame::Chunk(json!({"id": "1"})),
        Frame::Chunk(json!({"id": "2"})),
        Frame::Done,
    ]);
    assert_eq!(events.len(), 3);
    assert_eq!(events[2], format!("data: {DONE_SENTINEL}\n\n"));
    let done_count = events
        .iter()
        .filter(|e| e.contains(DONE_SENTINEL))
        .count();
    assert_eq!(done_count, 1);
}

#[test]
fn no_frames_follow_the_terminator() {
    // A misbehaving upstream keeps producing after Done.
    let events = collect(vec![
        Frame::Chunk(json!({"id": "1"})),
        Frame::Done,
        Frame::Chunk(json!({"id": "ghost"})),
        Frame::Done,
    ]);
    assert_eq!(events.len(), 2);
    assert!(events[1].contains(DONE_SENTINEL));
}

#[test]
fn error_stream_emits_delta_then_done() {
    let err = CompletionError::new(ErrorKind::Auth, "bad key");
    let events = collect(vec![Frame::Err(err)]);
    assert_eq!(events.len(), 2);
    assert!(events[0].contains("❌"));
    assert!(events[0].contains("chat.completion.chunk"));
    assert_eq!(events[1], format!("data: {DONE_SENTINEL}\n\n"));
}

#[test]
fn frame_to_sse_chunk_is_one_event() {
    let events = frame_to_sse(&Frame::Chunk(json!({"x": 1})), "m");
    assert_eq!(events.len(), 1);
    assert!(events[0].starts_with("data: "));
    assert!(events[0].ends_with("\n\n"));
}

#[test]
fn envelope_chunks_have_openai_shape() {
    let envelope = ChunkEnvelope::new("test", "model-x");

    let role = envelope.role_chunk();
    assert_eq!(role["object"], "chat.completion.chunk");
    assert_eq!(role["model"], "model-x");
    assert_eq!(role["choices"][0]["delta"]["role"], "assistant");
    assert!(role["choices"][0]["finish_reason"].is_null());

    let content = envelope.content_chunk("hi");
    assert_eq!(content["choices"][0]["delta"]["content"], "hi");
    assert_eq!(content["id"], role["id"]);

    let finish = envelope.finish_chunk("stop");
    assert_eq!(finish["choices"][0]["finish_reason"], "stop");
    assert_eq!(
        finish["choices"][0]["delta"],
        json!({}),
        "final delta must be empty"
    );
}

#[test]
fn error_completion_has_openai_shape_and_marker() {
    let err = CompletionError::new(ErrorKind::Config, "provider disabled");
    let completion = err.to_completion("model-y");

    assert_eq!(completion["object"], "chat.completion");
    assert_eq!(completion["model"], "model-y");
    assert_eq!(completion["choices"][0]["message"]["role"], "assistant");
    assert_eq!(completion["choices"][0]["finish_reason"], "stop");
    let content = completion["choices"][0]["message"]["content"]
        .as_str()
        .expect("content is a string");
    assert!(content.starts_with("❌ Configuration Error:"));
}

#[test]
fn composite_error_mentions_both_failures() {
    let first = CompletionError::new(ErrorKind::Upstream, "model gone").with_model("gpt-9");
    let second = CompletionError::new(ErrorKind::Auth, "key revoked");
    let composite = CompletionError::composite("Acme", &first, "gpt-4o-mini", &second);

    assert!(composite.message.contains("Acme"));
    assert!(composite.message.contains("model gone"));
    assert!(composite.message.contains("key revoked"));
    assert!(composite.message.contains("gpt-4o-mini"));
}
