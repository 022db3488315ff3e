//! Server-Sent-Events plumbing shared by the connectors.
//!
//! Upstream side: a line-splitting adapter over a `reqwest` byte stream that
//! yields the JSON payload of each `data:` frame. Downstream side: the
//! serializer that turns a [`Frame`] sequence into SSE text frames, always
//! terminated by exactly one `data: [DONE]\n\n`.

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;

use super::Frame;

/// The SSE stream terminator payload.
pub const DONE_SENTINEL: &str = "[DONE]";

// ---------------------------------------------------------------------------
// Upstream parsing
// ---------------------------------------------------------------------------

/// Extract the payload of one SSE line, if it is a data frame.
///
/// Returns `None` for blank lines, comments, and non-data fields.
pub fn data_payload(line: &str) -> Option<&str> {
    let line = line.trim_end_matches('\r');
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Split an upstream byte stream into text lines.
///
/// Buffers partial lines across network chunks; transport errors end the
/// stream (the caller decides whether a missing `[DONE]` matters).
pub fn lines_of(
    bytes: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> BoxStream<'static, String> {
    let stream = futures::stream::unfold(
        (Box::pin(bytes), Vec::<u8>::new(), false),
        |(mut bytes, mut buffer, mut ended)| async move {
            loop {
                if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let text = String::from_utf8_lossy(&line[..line.len().saturating_sub(1)])
                        .into_owned();
                    return Some((text, (bytes, buffer, ended)));
                }

                if ended {
                    if buffer.is_empty() {
                        return None;
                    }
                    let text = String::from_utf8_lossy(&buffer).into_owned();
                    buffer.clear();
                    return Some((text, (bytes, buffer, ended)));
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(_)) | None => ended = true,
                }
            }
        },
    );
    stream.boxed()
}

/// Turn an upstream OpenAI-compatible SSE byte stream into chunk values.
///
/// Yields one `Value` per upstream data frame; stops at the upstream
/// `[DONE]` sentinel. Invalid JSON payloads are skipped.
pub fn upstream_chunks(
    bytes: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> BoxStream<'static, Value> {
    lines_of(bytes)
        .filter_map(|line| async move {
            let payload = data_payload(&line)?.to_owned();
            if payload == DONE_SENTINEL {
                return None;
            }
            serde_json::from_str::<Value>(&payload).ok()
        })
        .boxed()
}

// ---------------------------------------------------------------------------
// Downstream serialization
// ---------------------------------------------------------------------------

/// Serialize one frame into zero or more SSE text frames.
///
/// [`Frame::Err`] expands into a synthetic delta chunk followed by the
/// sentinel so failed streams still satisfy the termination property.
pub fn frame_to_sse(frame: &Frame, model: &str) -> Vec<String> {
    match frame {
        Frame::Chunk(value) => vec![format!("data: {value}\n\n")],
        Frame::Done => vec![format!("data: {DONE_SENTINEL}\n\n")],
        Frame::Err(err) => vec![
            format!("data: {}\n\n", err.to_error_chunk(model)),
            format!("data: {DONE_SENTINEL}\n\n"),
        ],
    }
}

/// Serialize a whole frame stream into SSE text frames.
///
/// Stops after the first terminator-producing frame so no data frames can
/// follow `[DONE]` even if the upstream sequence misbehaves.
pub fn serialize_frames(
    frames: impl Stream<Item = Frame> + Send + 'static,
    model: String,
) -> BoxStream<'static, String> {
    let stream = frames
        .flat_map(move |frame| {
            let terminal = matches!(frame, Frame::Done | Frame::Err(_));
            let events = frame_to_sse(&frame, &model);
            let last = events.len().saturating_sub(1);
            // Only the final event of a terminal frame closes the stream, so
            // an error frame still emits its sentinel after the error chunk.
            futures::stream::iter(
                events
                    .into_iter()
                    .enumerate()
                    .map(move |(i, e)| (e, terminal && i == last)),
            )
        })
        .scan(false, |done, (event, terminal)| {
            if *done {
                return futures::future::ready(None);
            }
            if terminal {
                *done = true;
            }
            futures::future::ready(Some(event))
        });
    stream.boxed()
}
