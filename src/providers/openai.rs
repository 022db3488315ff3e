//! OpenAI-compatible connector.
//!
//! Speaks `POST {base_url}/chat/completions` and `GET {base_url}/models`.
//! Handles the vision path with text-only fallback, the bounded tool-call
//! loop, pass-through streaming, and the at-most-once runtime fallback to
//! the organization's default model.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::org::resolver::{resolve_model, ConfigResolver, ResolvedProvider};
use crate::tools::ToolRegistry;

use super::pool::ClientPool;
use super::sse::upstream_chunks;
use super::{
    ChatMessage, CompletionError, CompletionOutput, Connector, ConnectorRequest, ErrorKind, Frame,
    ToolDefinition,
};

/// Upper bound on model calls inside the tool loop.
pub const MAX_TOOL_ITERATIONS: usize = 5;

/// Disclosure prefixed to the first user message when images are dropped.
const VISION_FALLBACK_NOTICE: &str =
    "[Note: this conversation included images that could not be processed; \
     they were removed before sending.] ";

/// OpenAI-compatible connector.
pub struct OpenAiConnector {
    pool: Arc<ClientPool>,
    resolver: ConfigResolver,
    tools: Arc<ToolRegistry>,
}

impl OpenAiConnector {
    /// Build the connector.
    pub fn new(pool: Arc<ClientPool>, resolver: ConfigResolver, tools: Arc<ToolRegistry>) -> Self {
        Self {
            pool,
            resolver,
            tools,
        }
    }

    /// Resolve tenant config, the upstream endpoint, and the model to use.
    async fn prepare(
        &self,
        request: &ConnectorRequest,
    ) -> Result<(ResolvedProvider, Endpoint, String), CompletionError> {
        let config = self.resolver.resolve(request.owner.as_deref(), "openai").await;
        if !config.enabled {
            return Err(CompletionError::new(
                ErrorKind::Config,
                format!(
                    "OpenAI provider is not configured for organization '{}'",
                    config.org_name
                ),
            ));
        }

        let api_key = config.api_key.clone().ok_or_else(|| {
            CompletionError::new(
                ErrorKind::Config,
                format!("no OpenAI API key configured for organization '{}'", config.org_name),
            )
        })?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_owned());

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

        let resolved = resolve_model(&requested, &config, true)
            .map_err(|e| CompletionError::new(ErrorKind::Config, e.to_string()))?;
        if resolved.fallback_used {
            debug!(requested, resolved = %resolved.model, "model substituted at resolution time");
        }

        let endpoint = Endpoint { base_url, api_key };
        Ok((config, endpoint, resolved.model))
    }
}

/// Pick the requested model: explicit request, else tenant default.
fn requested_model(request: &ConnectorRequest, config: &ResolvedProvider) -> String {
    request
        .model
        .clone()
        .or_else(|| config.default_model.clone())
        .unwrap_or_else(|| "gpt-4o-mini".to_owned())
}

/// One upstream endpoint (base URL + key).
#[derive(Debug, Clone)]
struct Endpoint {
    base_url: String,
    api_key: String,
}

// ---------------------------------------------------------------------------
// Request building (pub for integration testing)
// ---------------------------------------------------------------------------

/// Build the JSON body for a `/chat/completions` call.
///
/// Host-side `__`-prefixed keys must already be removed from `body`.
#[doc(hidden)]
pub fn build_body(
    model: &str,
    messages: &[ChatMessage],
    stream: bool,
    body: &BTreeMap<String, Value>,
    tools: &[ToolDefinition],
) -> Value {
    let mut map = Map::new();
    for (key, value) in body {
        map.insert(key.clone(), value.clone());
    }
    map.insert("model".to_owned(), json!(model));
    map.insert(
        "messages".to_owned(),
        serde_json::to_value(messages).unwrap_or_else(|_| json!([])),
    );
    map.insert("stream".to_owned(), json!(stream));
    if !tools.is_empty() {
        map.insert(
            "tools".to_owned(),
            Value::Array(tools.iter().map(ToolDefinition::to_spec).collect()),
        );
        map.insert("tool_choice".to_owned(), json!("auto"));
    }
    Value::Object(map)
}

/// Whether any message carries an image part.
#[doc(hidden)]
pub fn has_images(messages: &[ChatMessage]) -> bool {
    messages.iter().any(ChatMessage::has_image)
}

/// Strip image parts, collapsing multimodal content to plain text, and
/// prefix the first user message with a disclosure that images were dropped.
#[doc(hidden)]
pub fn strip_images(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut disclosed = false;
    messages
        .iter()
        .map(|message| {
            let mut text = message.content_text();
            if !disclosed && message.role == "user" {
                text = format!("{VISION_FALLBACK_NOTICE}{text}");
                disclosed = true;
            }
            ChatMessage {
                role: message.role.clone(),
                content: Value::String(text),
                tool_calls: message.tool_calls.clone(),
                tool_call_id: message.tool_call_id.clone(),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Fallback ladder
// ---------------------------------------------------------------------------

/// Decide whether a failed call should be retried with the org default.
///
/// Fallback happens at most once per request: only when a default exists,
/// differs from the failed model, and the error class is retryable.
#[doc(hidden)]
pub fn fallback_model(error: &CompletionError, current: &str, org_default: Option<&str>) -> Option<String> {
    if matches!(error.kind, ErrorKind::Config | ErrorKind::Parse) {
        return None;
    }
    org_default
        .filter(|default| *default != current)
        .map(ToOwned::to_owned)
}

/// Execute one upstream call, retrying once with the organization default
/// model on failure. Returns the response together with the model that
/// actually served it.
async fn call_with_fallback(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    mut body: Value,
    model: &str,
    org_default: Option<&str>,
    org_name: &str,
) -> Result<(reqwest::Response, String), CompletionError> {
    match call_once(client, endpoint, &body).await {
        Ok(response) => Ok((response, model.to_owned())),
        Err(first) => {
            let Some(default) = fallback_model(&first, model, org_default) else {
                return Err(first.with_model(model));
            };

            warn!(model, fallback = %default, "upstream call failed, retrying with organization default");
            if let Some(map) = body.as_object_mut() {
                map.insert("model".to_owned(), json!(default));
            }

            match call_once(client, endpoint, &body).await {
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

/// Execute a single `/chat/completions` call, classifying failures.
async fn call_once(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    body: &Value,
) -> Result<reqwest::Response, CompletionError> {
    let url = format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .bearer_auth(&endpoint.api_key)
        .json(body)
        .send()
        .await
        .map_err(|e| CompletionError::from_transport(&e))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(CompletionError::from_status(status.as_u16(), &truncate(&text, 300)));
    }
    Ok(response)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_owned();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("…");
    out
}

// ---------------------------------------------------------------------------
// Tool-call delta assembly
// ---------------------------------------------------------------------------

/// A tool call assembled from streaming deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledToolCall {
    /// Call id (arrives once).
    pub id: String,
    /// Function name (arrives once).
    pub name: String,
    /// Concatenated argument fragments.
    pub arguments: String,
}

/// Incrementally assembles tool calls across stream deltas.
///
/// `tool_calls[].index` is the stable key; `function.arguments` fragments
/// are concatenated in arrival order.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: BTreeMap<u64, AssembledToolCall>,
    finish_reason: Option<String>,
}

impl ToolCallAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one upstream chunk.
    pub fn feed(&mut self, chunk: &Value) {
        let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return;
        };

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_owned());
        }

        let Some(deltas) = choice
            .pointer("/delta/tool_calls")
            .and_then(Value::as_array)
        else {
            return;
        };

        for delta in deltas {
            let index = delta.get("index").and_then(Value::as_u64).unwrap_or(0);
            let entry = self.calls.entry(index).or_default();
            if let Some(id) = delta.get("id").and_then(Value::as_str) {
                entry.id = id.to_owned();
            }
            if let Some(name) = delta.pointer("/function/name").and_then(Value::as_str) {
                entry.name = name.to_owned();
            }
            if let Some(args) = delta.pointer("/function/arguments").and_then(Value::as_str) {
                entry.arguments.push_str(args);
            }
        }
    }

    /// Assembled calls when the turn finished with `tool_calls`.
    pub fn into_tool_calls(self) -> Option<Vec<AssembledToolCall>> {
        if self.calls.is_empty() || self.finish_reason.as_deref() != Some("tool_calls") {
            return None;
        }
        Some(self.calls.into_values().collect())
    }
}

/// Build the assistant message recording a set of tool calls.
fn assistant_tool_call_message(content: String, calls: &[AssembledToolCall]) -> ChatMessage {
    let tool_calls: Vec<Value> = calls
        .iter()
        .map(|call| {
            json!({
                "id": call.id,
                "type": "function",
                "function": {"name": call.name, "arguments": call.arguments},
            })
        })
        .collect();
    ChatMessage {
        role: "assistant".to_owned(),
        content: Value::String(content),
        tool_calls: Some(Value::Array(tool_calls)),
        tool_call_id: None,
    }
}

// ---------------------------------------------------------------------------
// Connector impl
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Connector for OpenAiConnector {
    async fn complete(&self, request: ConnectorRequest) -> CompletionOutput {
        let report_model = request.model.clone().unwrap_or_else(|| "openai".to_owned());

        let (config, endpoint, model) = match self.prepare(&request).await {
            Ok(parts) => parts,
            Err(err) => return error_output(err, &report_model, request.stream),
        };

        let client = self.pool.get(&endpoint.base_url);
        let org_default = config.default_model.clone();
        let org_name = config.org_name.clone();

        // Vision attempt: images present → try the multimodal form first and
        // fall back to text-only with a disclosure when it fails.
        let mut messages = request.messages.clone();
        if has_images(&messages) {
            let body = build_body(&model, &messages, request.stream, &request.forwardable_body(), &[]);
            match call_with_fallback(&client, &endpoint, body, &model, None, &org_name).await {
                Ok((response, served_model)) => {
                    return forward_response(response, served_model, request.stream).await;
                }
                Err(err) => {
                    warn!(error = %err, "vision call failed, retrying text-only");
                    messages = strip_images(&messages);
                }
            }
        }

        if !request.tools.is_empty() {
            return self
                .complete_with_tools(request, messages, client, endpoint, model, org_default, org_name)
                .await;
        }

        let body = build_body(&model, &messages, request.stream, &request.forwardable_body(), &[]);
        match call_with_fallback(&client, &endpoint, body, &model, org_default.as_deref(), &org_name)
            .await
        {
            Ok((response, served_model)) => forward_response(response, served_model, request.stream).await,
            Err(err) => error_output(err, &model, request.stream),
        }
    }

    async fn list_models(&self, owner: Option<&str>) -> Result<Vec<String>, CompletionError> {
        let config = self.resolver.resolve(owner, "openai").await;
        if !config.enabled {
            return Err(CompletionError::new(
                ErrorKind::Config,
                "OpenAI provider is not configured",
            ));
        }
        if !config.models.is_empty() {
            return Ok(config.models);
        }

        let base_url = config
            .base_url
            .unwrap_or_else(|| "https://api.openai.com/v1".to_owned());
        let api_key = config.api_key.unwrap_or_default();
        let client = self.pool.get(&base_url);
        let url = format!("{}/models", base_url.trim_end_matches('/'));

        let response = client
            .get(&url)
            .bearer_auth(&api_key)
            .send()
            .await
            .map_err(|e| CompletionError::from_transport(&e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CompletionError::from_status(status.as_u16(), &truncate(&text, 300)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| CompletionError::new(ErrorKind::Parse, e.to_string()))?;
        Ok(payload
            .get("data")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

impl OpenAiConnector {
    /// Run the bounded tool loop.
    ///
    /// Tool turns are never forwarded downstream; the stream (or response)
    /// the client sees is the final turn with no tool calls. Tool results
    /// from iteration N are visible to iteration N+1's model call.
    #[allow(clippy::too_many_arguments)]
    async fn complete_with_tools(
        &self,
        request: ConnectorRequest,
        mut messages: Vec<ChatMessage>,
        client: reqwest::Client,
        endpoint: Endpoint,
        model: String,
        org_default: Option<String>,
        org_name: String,
    ) -> CompletionOutput {
        let body_params = request.forwardable_body();
        info!(tools = request.tools.len(), model, "tool-enabled completion");

        for iteration in 1..=MAX_TOOL_ITERATIONS {
            debug!(iteration, "tool loop iteration");

            let body = build_body(&model, &messages, request.stream, &body_params, &request.tools);
            let (response, _served_model) = match call_with_fallback(
                &client,
                &endpoint,
                body,
                &model,
                org_default.as_deref(),
                &org_name,
            )
            .await
            {
                Ok(parts) => parts,
                Err(err) => return error_output(err, &model, request.stream),
            };

            // Collect the turn. Streaming turns are buffered while the
            // assembler reconstructs tool calls from deltas; the buffered
            // chunks are only replayed downstream when the turn turns out to
            // carry no tool calls.
            let turn = match collect_turn(response, request.stream).await {
                Ok(turn) => turn,
                Err(err) => return error_output(err, &model, request.stream),
            };

            match turn.tool_calls {
                None => {
                    debug!(iteration, "final turn, no tool calls");
                    return turn.into_output(request.stream);
                }
                Some(ref calls) if iteration == MAX_TOOL_ITERATIONS => {
                    warn!(pending = calls.len(), "tool loop reached maximum iterations");
                    if request.stream {
                        // Unexecuted tool-call deltas are not replayed; the
                        // stream just terminates.
                        return CompletionOutput::Stream(
                            futures::stream::iter([Frame::Done]).boxed(),
                        );
                    }
                    return turn.into_output(false);
                }
                Some(calls) => {
                    info!(count = calls.len(), "model requested tool calls");
                    messages.push(assistant_tool_call_message(turn.content, &calls));
                    for call in &calls {
                        let result = self.tools.execute(&call.name, &call.arguments).await;
                        messages.push(ChatMessage {
                            role: "tool".to_owned(),
                            content: Value::String(result),
                            tool_calls: None,
                            tool_call_id: Some(call.id.clone()),
                        });
                    }
                }
            }
        }

        // Unreachable: every iteration returns or appends and the bound
        // branch returns. Kept as a defensive terminal shape.
        error_output(
            CompletionError::new(ErrorKind::Upstream, "tool loop exhausted"),
            &model,
            request.stream,
        )
    }
}

/// One collected model turn.
struct Turn {
    /// Buffered upstream chunks (streaming) — replayed on the final turn.
    chunks: Vec<Value>,
    /// Full completion payload (non-streaming).
    payload: Option<Value>,
    /// Text content accumulated across the turn.
    content: String,
    /// Tool calls, when the turn finished with `tool_calls`.
    tool_calls: Option<Vec<AssembledToolCall>>,
}

impl Turn {
    /// Produce the downstream output for a final turn.
    fn into_output(self, stream: bool) -> CompletionOutput {
        if stream {
            let frames = self
                .chunks
                .into_iter()
                .map(Frame::Chunk)
                .chain(std::iter::once(Frame::Done));
            CompletionOutput::Stream(futures::stream::iter(frames).boxed())
        } else {
            CompletionOutput::Full(self.payload.unwrap_or_else(|| json!({})))
        }
    }
}

/// Consume one upstream turn, streaming or not.
async fn collect_turn(response: reqwest::Response, stream: bool) -> Result<Turn, CompletionError> {
    if stream {
        let mut assembler = ToolCallAssembler::new();
        let mut chunks = Vec::new();
        let mut content = String::new();

        let mut upstream = upstream_chunks(response.bytes_stream());
        while let Some(chunk) = upstream.next().await {
            assembler.feed(&chunk);
            if let Some(delta) = chunk.pointer("/choices/0/delta/content").and_then(Value::as_str) {
                content.push_str(delta);
            }
            chunks.push(chunk);
        }

        Ok(Turn {
            chunks,
            payload: None,
            content,
            tool_calls: assembler.into_tool_calls(),
        })
    } else {
        let payload: Value = response
            .json()
            .await
            .map_err(|e| CompletionError::new(ErrorKind::Parse, e.to_string()))?;

        let message = payload.pointer("/choices/0/message").cloned().unwrap_or(json!({}));
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .filter(|calls| !calls.is_empty())
            .map(|calls| {
                calls
                    .iter()
                    .map(|call| AssembledToolCall {
                        id: call.get("id").and_then(Value::as_str).unwrap_or_default().to_owned(),
                        name: call
                            .pointer("/function/name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                        arguments: call
                            .pointer("/function/arguments")
                            .and_then(Value::as_str)
                            .unwrap_or("{}")
                            .to_owned(),
                    })
                    .collect()
            });

        Ok(Turn {
            chunks: Vec::new(),
            payload: Some(payload),
            content,
            tool_calls,
        })
    }
}

/// Forward a successful upstream response downstream.
async fn forward_response(
    response: reqwest::Response,
    model: String,
    stream: bool,
) -> CompletionOutput {
    if stream {
        let frames = upstream_chunks(response.bytes_stream())
            .map(Frame::Chunk)
            .chain(futures::stream::once(async { Frame::Done }));
        CompletionOutput::Stream(frames.boxed())
    } else {
        match response.json::<Value>().await {
            Ok(payload) => CompletionOutput::Full(payload),
            Err(e) => {
                let err = CompletionError::new(ErrorKind::Parse, e.to_string());
                CompletionOutput::Full(err.to_completion(&model))
            }
        }
    }
}

/// Render an error as the appropriate output shape.
fn error_output(err: CompletionError, model: &str, stream: bool) -> CompletionOutput {
    if stream {
        CompletionOutput::Stream(futures::stream::iter([Frame::Err(err)]).boxed())
    } else {
        CompletionOutput::Full(err.to_completion(model))
    }
}
