//! Ollama-native connector.
//!
//! Speaks `POST {base_url}/api/chat` and `GET {base_url}/api/tags`. Request
//! bodies are Ollama-native; streaming chunks are Ollama NDJSON and are
//! re-framed into OpenAI SSE chunks: the first frame carries
//! `delta.role = "assistant"`, subsequent frames carry `delta.content`, and
//! the final frame carries an empty delta with `finish_reason: "stop"`.
//! Token counts are reported as `-1` (unknown).

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::org::resolver::{resolve_model, ConfigResolver, ResolvedProvider};

use super::pool::ClientPool;
use super::sse::lines_of;
use super::{
    ChatMessage, ChunkEnvelope, CompletionError, CompletionOutput, Connector, ConnectorRequest,
    ErrorKind, Frame,
};

/// Body keys forwarded to Ollama from the client request.
const FORWARDED_OPTIONS: [&str; 3] = ["temperature", "top_p", "top_k"];

/// Ollama-native connector.
pub struct OllamaConnector {
    pool: Arc<ClientPool>,
    resolver: ConfigResolver,
    request_timeout: Duration,
}

impl OllamaConnector {
    /// Build the connector.
    pub fn new(pool: Arc<ClientPool>, resolver: ConfigResolver, request_timeout: Duration) -> Self {
        Self {
            pool,
            resolver,
            request_timeout,
        }
    }

    async fn prepare(
        &self,
        request: &ConnectorRequest,
    ) -> Result<(ResolvedProvider, String, String), CompletionError> {
        let config = self.resolver.resolve(request.owner.as_deref(), "ollama").await;
        if !config.enabled {
            return Err(CompletionError::new(
                ErrorKind::Config,
                format!(
                    "Ollama provider is not configured for organization '{}'",
                    config.org_name
                ),
            ));
        }

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_owned());

        let requested = if request.use_small_fast_model {
            match &config.small_fast_model {
                Some(model) => {
                    info!(model, "using small-fast model");
                    model.clone()
                }
                None => requested_model(request, &config),
            }
        } else {
            requested_model(request, &config)
        };

        // Ollama may serve models that are absent from the tenant config, so
        // resolution is lenient about an empty model list.
        let resolved = resolve_model(&requested, &config, false)
            .map_err(|e| CompletionError::new(ErrorKind::Config, e.to_string()))?;
        if resolved.fallback_used {
            debug!(requested, resolved = %resolved.model, "model substituted at resolution time");
        }

        Ok((config, base_url, resolved.model))
    }
}

fn requested_model(request: &ConnectorRequest, config: &ResolvedProvider) -> String {
    request
        .model
        .clone()
        .or_else(|| config.default_model.clone())
        .or_else(|| config.models.first().cloned())
        .unwrap_or_else(|| "llama3.1".to_owned())
}

// ---------------------------------------------------------------------------
// Request building / response shaping (pub for integration testing)
// ---------------------------------------------------------------------------

/// Collapse messages into Ollama's `{role, content}` shape.
///
/// Multimodal content lists are flattened to their text parts; Ollama's
/// chat endpoint takes plain strings here.
#[doc(hidden)]
pub fn format_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({"role": m.role, "content": m.content_text()}))
        .collect()
}

/// Build the Ollama-native request body.
#[doc(hidden)]
pub fn build_body(
    model: &str,
    messages: &[ChatMessage],
    stream: bool,
    client_body: &std::collections::BTreeMap<String, Value>,
) -> Value {
    let mut map = Map::new();
    map.insert("model".to_owned(), json!(model));
    map.insert("messages".to_owned(), Value::Array(format_messages(messages)));
    map.insert("stream".to_owned(), json!(stream));
    for key in FORWARDED_OPTIONS {
        if let Some(value) = client_body.get(key) {
            map.insert(key.to_owned(), value.clone());
        }
    }
    Value::Object(map)
}

/// Wrap an Ollama chat reply into an OpenAI-shaped completion.
///
/// Ollama reports no token usage through this path, so counts are `-1`.
#[doc(hidden)]
pub fn to_openai_completion(content: &str, model: &str) -> Value {
    let created = chrono::Utc::now().timestamp();
    json!({
        "id": format!("ollama-{created}"),
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "logprobs": null,
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": -1, "completion_tokens": -1, "total_tokens": -1},
    })
}

// ---------------------------------------------------------------------------
// Connector impl
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Connector for OllamaConnector {
    async fn complete(&self, request: ConnectorRequest) -> CompletionOutput {
        let report_model = request.model.clone().unwrap_or_else(|| "ollama".to_owned());

        let (config, base_url, model) = match self.prepare(&request).await {
            Ok(parts) => parts,
            Err(err) => return error_output(err, &report_model, request.stream),
        };

        let client = self.pool.get_with_timeout(&base_url, self.request_timeout);
        let body = build_body(&model, &request.messages, request.stream, &request.forwardable_body());

        let (response, served_model) = match call_with_fallback(
            &client,
            &base_url,
            body,
            &model,
            config.default_model.as_deref(),
            &config.org_name,
        )
        .await
        {
            Ok(parts) => parts,
            Err(err) => return error_output(err, &model, request.stream),
        };

        if request.stream {
            CompletionOutput::Stream(reframe_stream(response, &served_model))
        } else {
            match response.json::<Value>().await {
                Ok(payload) => {
                    let content = payload
                        .pointer("/message/content")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if content.is_empty() {
                        let err = CompletionError::new(
                            ErrorKind::Upstream,
                            format!("empty response from Ollama for model {served_model}"),
                        );
                        return CompletionOutput::Full(err.to_completion(&served_model));
                    }
                    CompletionOutput::Full(to_openai_completion(content, &served_model))
                }
                Err(e) => {
                    let err = CompletionError::new(ErrorKind::Parse, e.to_string());
                    CompletionOutput::Full(err.to_completion(&served_model))
                }
            }
        }
    }

    async fn list_models(&self, owner: Option<&str>) -> Result<Vec<String>, CompletionError> {
        let config = self.resolver.resolve(owner, "ollama").await;
        if !config.enabled {
            return Err(CompletionError::new(
                ErrorKind::Config,
                "Ollama provider is not configured",
            ));
        }
        if !config.models.is_empty() {
            return Ok(config.models);
        }

        let base_url = config
            .base_url
            .unwrap_or_else(|| "http://localhost:11434".to_owned());
        let client = self.pool.get(&base_url);
        let url = format!("{}/api/tags", base_url.trim_end_matches('/'));

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| CompletionError::from_transport(&e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CompletionError::from_status(status.as_u16(), &text));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| CompletionError::new(ErrorKind::Parse, e.to_string()))?;
        Ok(payload
            .get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(Value::as_str))
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

// ---------------------------------------------------------------------------
// Fallback ladder
// ---------------------------------------------------------------------------

/// Execute one `/api/chat` call, retrying once with the organization default
/// when the model is missing server-side (404).
async fn call_with_fallback(
    client: &reqwest::Client,
    base_url: &str,
    mut body: Value,
    model: &str,
    org_default: Option<&str>,
    org_name: &str,
) -> Result<(reqwest::Response, String), CompletionError> {
    match call_once(client, base_url, &body).await {
        Ok(response) => Ok((response, model.to_owned())),
        Err(first) => {
            let retryable = first.kind == ErrorKind::Upstream;
            let Some(default) = org_default
                .filter(|d| retryable && *d != model)
                .map(ToOwned::to_owned)
            else {
                return Err(first.with_model(model));
            };

            warn!(model, fallback = %default, "model unavailable, retrying with organization default");
            if let Some(map) = body.as_object_mut() {
                map.insert("model".to_owned(), json!(default));
            }

            match call_once(client, base_url, &body).await {
                Ok(response) => {
                    info!(model = %default, "fallback call succeeded");
                    Ok((response, default))
                }
                Err(second) => Err(CompletionError::composite(
                    org_name,
                    &first.with_model(model),
                    &default,
                    &second,
                )),
            }
        }
    }
}

async fn call_once(
    client: &reqwest::Client,
    base_url: &str,
    body: &Value,
) -> Result<reqwest::Response, CompletionError> {
    let url = format!("{}/api/chat", base_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .json(body)
        .send()
        .await
        .map_err(|e| CompletionError::from_transport(&e))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(CompletionError::from_status(status.as_u16(), &text));
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// Stream re-framing
// ---------------------------------------------------------------------------

/// Re-frame an Ollama NDJSON stream into OpenAI SSE chunks.
///
/// The terminator frame is appended unconditionally so a truncated upstream
/// stream still ends with `[DONE]`.
fn reframe_stream(response: reqwest::Response, model: &str) -> super::FrameStream {
    let envelope = ChunkEnvelope::new("ollama", model);

    let frames = lines_of(response.bytes_stream())
        .filter_map(|line| async move {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return None;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(chunk) => Some(chunk),
                Err(_) => {
                    debug!("skipping invalid ndjson chunk from ollama");
                    None
                }
            }
        })
        .scan(
            (envelope, false, false),
            |(envelope, sent_role, finished), chunk| {
                if *finished {
                    return futures::future::ready(None);
                }

                let mut out = Vec::new();
                let content = chunk
                    .pointer("/message/content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();

                if !*sent_role {
                    out.push(Frame::Chunk(envelope.role_chunk()));
                    *sent_role = true;
                }
                if !content.is_empty() {
                    out.push(Frame::Chunk(envelope.content_chunk(content)));
                }
                if chunk.get("done").and_then(Value::as_bool).unwrap_or(false) {
                    out.push(Frame::Chunk(envelope.finish_chunk("stop")));
                    *finished = true;
                }
                futures::future::ready(Some(futures::stream::iter(out)))
            },
        )
        .flatten()
        .chain(futures::stream::once(async { Frame::Done }));

    frames.boxed()
}

/// Render an error as the appropriate output shape.
fn error_output(err: CompletionError, model: &str, stream: bool) -> CompletionOutput {
    if stream {
        CompletionOutput::Stream(futures::stream::iter([Frame::Err(err)]).boxed())
    } else {
        CompletionOutput::Full(err.to_completion(model))
    }
}
