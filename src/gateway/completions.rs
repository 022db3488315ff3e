//! Chat-completions gateway handlers.
//!
//! Accepts OpenAI-shaped requests as JSON or multipart form data (with
//! image uploads), normalizes them into an [`ExecutionRequest`], dispatches
//! by the `lectern_assistant.<id>` model id, and returns either a JSON
//! completion or an SSE stream terminated by `data: [DONE]\n\n`.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assistant::executor::ExecutionRequest;
use crate::assistant::parse_model_id;
use crate::providers::sse::serialize_frames;
use crate::providers::{ChatMessage, CompletionOutput};

use super::{check_bearer, ApiError, AppState};

/// Body size cap for JSON requests (images arrive via multipart).
const MAX_JSON_BODY_BYTES: usize = 20 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Simple endpoints
// ---------------------------------------------------------------------------

/// `GET /status`.
pub async fn status() -> Json<Value> {
    Json(json!({"status": true}))
}

/// `GET /v1/models` — published, non-deleted assistants with capability
/// flags, in OpenAI list shape.
pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;

    let assistants = state
        .assistants()
        .list_published()
        .await
        .map_err(ApiError::from)?;

    let data: Vec<Value> = assistants
        .iter()
        .map(|assistant| {
            json!({
                "id": assistant.model_id(),
                "object": "model",
                "created": 0,
                "owned_by": assistant.owner,
                "name": assistant.name,
                "capabilities": {
                    "vision": assistant.metadata.capabilities.vision,
                    "image_generation": assistant.metadata.capabilities.image_generation,
                },
            })
        })
        .collect();

    Ok(Json(json!({"object": "list", "data": data})))
}

/// Query string of the provider-status probe.
#[derive(Debug, serde::Deserialize)]
pub struct ProviderStatusQuery {
    /// Assistant owner whose organization configuration is probed; absent
    /// probes the environment configuration.
    #[serde(default)]
    pub owner: Option<String>,
}

/// `GET /v1/admin/provider-status` — check whether the tenant's provider
/// configurations can reach their backends right now.
pub async fn provider_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::Query(query): axum::extract::Query<ProviderStatusQuery>,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;

    let owner = query.owner.as_deref();
    let openai_config = state.resolver().resolve(owner, "openai").await;
    let ollama_config = state.resolver().resolve(owner, "ollama").await;

    let mut reports = Vec::new();
    if openai_config.enabled {
        reports.push(serde_json::to_value(state.probe().check_openai(&openai_config).await));
    }
    if ollama_config.enabled {
        reports.push(serde_json::to_value(state.probe().check_ollama(&ollama_config).await));
    }

    let reports: Vec<Value> = reports.into_iter().filter_map(Result::ok).collect();
    Ok(Json(json!({"providers": reports})))
}

/// `GET /tools` — the tool catalog.
pub async fn list_tools(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;
    Ok(Json(json!({"tools": state.tools().catalog()})))
}

// ---------------------------------------------------------------------------
// Chat completions
// ---------------------------------------------------------------------------

/// `POST /v1/chat/completions` (and `/chat/completions`).
pub async fn chat_completions(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ApiError> {
    let headers = request.headers().clone();
    check_bearer(&headers, &state.settings().api_key)?;

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_owned();

    let normalized = if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| ApiError::Validation(format!("invalid multipart body: {e}")))?;
        normalize_multipart(multipart).await?
    } else {
        let bytes = axum::body::to_bytes(request.into_body(), MAX_JSON_BODY_BYTES)
            .await
            .map_err(|e| ApiError::Validation(format!("unreadable body: {e}")))?;
        let payload: Value = serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::Validation(format!("invalid JSON body: {e}")))?;
        normalize_json(payload)?
    };

    let assistant_id = parse_model_id(&normalized.model).ok_or_else(|| {
        ApiError::Validation(format!(
            "model must look like 'lectern_assistant.<id>', got '{}'",
            normalized.model
        ))
    })?;

    info!(assistant = assistant_id, stream = normalized.stream, "chat completion request");

    let execution = ExecutionRequest {
        messages: normalized.messages,
        stream: normalized.stream,
        body: normalized.body,
    };
    let output = state
        .executor()
        .run(assistant_id, execution, None)
        .await
        .map_err(ApiError::from)?;

    Ok(respond(output, &normalized.model))
}

/// A request normalized from either wire shape.
#[derive(Debug)]
struct NormalizedRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    body: BTreeMap<String, Value>,
}

/// Normalize a JSON request body.
fn normalize_json(payload: Value) -> Result<NormalizedRequest, ApiError> {
    let Value::Object(map) = payload else {
        return Err(ApiError::Validation("body must be a JSON object".to_owned()));
    };

    let model = map
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Validation("missing 'model'".to_owned()))?
        .to_owned();
    let stream = map.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let messages: Vec<ChatMessage> = map
        .get("messages")
        .cloned()
        .map(|value| serde_json::from_value(value))
        .transpose()
        .map_err(|e| ApiError::Validation(format!("invalid 'messages': {e}")))?
        .unwrap_or_default();

    let body = map
        .into_iter()
        .filter(|(key, _)| !matches!(key.as_str(), "model" | "messages" | "stream"))
        .collect();

    Ok(NormalizedRequest {
        model,
        messages,
        stream,
        body,
    })
}

/// Normalize a multipart request: the `data`/`messages` field carries raw
/// JSON, and every file part is base64-encoded into an `image_url` part
/// appended to the last user message.
async fn normalize_multipart(mut multipart: Multipart) -> Result<NormalizedRequest, ApiError> {
    let mut json_payload: Option<Value> = None;
    let mut model: Option<String> = None;
    let mut stream = false;
    let mut messages_field: Option<Value> = None;
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("multipart read error: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        let filename = field.file_name().map(ToOwned::to_owned);

        if let Some(filename) = filename {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::Validation(format!("file read error: {e}")))?;
            debug!(field = %name, file = %filename, size = bytes.len(), "multipart file received");
            files.push((filename, bytes.to_vec()));
            continue;
        }

        let text = field
            .text()
            .await
            .map_err(|e| ApiError::Validation(format!("field read error: {e}")))?;
        match name.as_str() {
            "data" => {
                json_payload = Some(
                    serde_json::from_str(&text)
                        .map_err(|e| ApiError::Validation(format!("invalid 'data' JSON: {e}")))?,
                );
            }
            "messages" => {
                messages_field = Some(
                    serde_json::from_str(&text)
                        .map_err(|e| ApiError::Validation(format!("invalid 'messages' JSON: {e}")))?,
                );
            }
            "model" => model = Some(text),
            "stream" => stream = matches!(text.as_str(), "true" | "1"),
            other => debug!(field = other, "ignoring multipart field"),
        }
    }

    // Either one `data` blob or individual fields.
    let mut normalized = if let Some(payload) = json_payload {
        normalize_json(payload)?
    } else {
        let messages: Vec<ChatMessage> = messages_field
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ApiError::Validation(format!("invalid 'messages': {e}")))?
            .unwrap_or_default();
        NormalizedRequest {
            model: model.ok_or_else(|| ApiError::Validation("missing 'model'".to_owned()))?,
            messages,
            stream,
            body: BTreeMap::new(),
        }
    };

    for (filename, bytes) in files {
        attach_image(&mut normalized.messages, &filename, &bytes);
    }

    Ok(normalized)
}

/// MIME type sniffed from a filename extension.
#[doc(hidden)]
pub fn sniff_mime(filename: &str) -> &'static str {
    let lower = filename.to_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

/// Append an uploaded file to the last user message as a data-URL image
/// part, converting string content to a part list if needed.
#[doc(hidden)]
pub fn attach_image(messages: &mut [ChatMessage], filename: &str, bytes: &[u8]) {
    use base64::Engine;

    let Some(last_user) = messages.iter_mut().rev().find(|m| m.role == "user") else {
        warn!("multipart upload without a user message, dropping file");
        return;
    };

    let mime = sniff_mime(filename);
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    let image_part = json!({
        "type": "image_url",
        "image_url": {"url": format!("data:{mime};base64,{encoded}")},
    });

    match &mut last_user.content {
        Value::Array(parts) => parts.push(image_part),
        Value::String(text) => {
            let text_part = json!({"type": "text", "text": text});
            last_user.content = Value::Array(vec![text_part, image_part]);
        }
        other => {
            *other = Value::Array(vec![image_part]);
        }
    }
    debug!(file = filename, mime, "image attached to last user message");
}

// ---------------------------------------------------------------------------
// Response shaping
// ---------------------------------------------------------------------------

/// Synthetic OpenAI-compat headers attached to every completion response.
fn common_headers() -> Vec<(HeaderName, HeaderValue)> {
    let request_id = format!("req_{}", Uuid::new_v4());
    let processing_ms = rand::thread_rng().gen_range(150..450).to_string();

    let mut headers = Vec::new();
    let pairs: [(&str, &str); 6] = [
        ("x-request-id", request_id.as_str()),
        ("x-ratelimit-limit-requests", "1000"),
        ("x-ratelimit-remaining-requests", "999"),
        ("x-ratelimit-reset-requests", "60s"),
        ("openai-processing-ms", processing_ms.as_str()),
        ("openai-version", "2024-02-01"),
    ];
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.push((name, value));
        }
    }
    headers
}

/// Convert connector output into an HTTP response.
fn respond(output: CompletionOutput, model: &str) -> Response {
    let mut response = match output {
        CompletionOutput::Full(payload) => Json(payload).into_response(),
        CompletionOutput::Stream(frames) => {
            let sse = serialize_frames(frames, model.to_owned())
                .map(Ok::<_, std::convert::Infallible>);
            let mut response = Response::new(Body::from_stream(sse));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            response
                .headers_mut()
                .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            response
        }
    };

    for (name, value) in common_headers() {
        response.headers_mut().insert(name, value);
    }
    response
}
