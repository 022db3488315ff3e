//! Provider connector abstraction layer.
//!
//! Defines the shared OpenAI-shaped wire types, the [`Frame`] streaming
//! model, the [`CompletionError`] taxonomy, and the [`Connector`] trait
//! implemented by the closed set of backends:
//! - [`openai::OpenAiConnector`] — OpenAI-compatible `/chat/completions`
//! - [`ollama::OllamaConnector`] — Ollama-native `/api/chat`, re-framed
//! - [`banana::BananaConnector`] — Google GenAI image generation
//!
//! Streaming responses are finite, single-pass sequences of [`Frame`] values;
//! the HTTP layer serializes each frame to SSE. Every stream, success or
//! failure, ends with exactly one [`Frame::Done`].

pub mod banana;
pub mod ollama;
pub mod openai;
pub mod pool;
pub mod probe;
pub mod sse;

use std::collections::BTreeMap;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A chat message in OpenAI wire shape.
///
/// `content` is either a string or a list of multimodal parts
/// (`{type: "text"}` / `{type: "image_url"}`), so it is kept as raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: `system`, `user`, `assistant`, or `tool`.
    pub role: String,
    /// Text content or multimodal part list.
    #[serde(default)]
    pub content: Value,
    /// Assistant tool calls, present on tool-call turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    /// Matching call id when `role == "tool"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Build a plain-text message.
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_owned(),
            content: Value::String(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Extract the textual content, joining multimodal text parts.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" "),
            _ => String::new(),
        }
    }

    /// Whether the content carries an `image_url` part.
    pub fn has_image(&self) -> bool {
        match &self.content {
            Value::Array(parts) => parts
                .iter()
                .any(|p| p.get("type").and_then(Value::as_str) == Some("image_url")),
            _ => false,
        }
    }
}

/// A tool definition in the registry's internal shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (must match registry registration).
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON Schema object for the tool's parameters.
    pub parameters: Value,
}

impl ToolDefinition {
    /// OpenAI function-calling spec for this tool.
    pub fn to_spec(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// A completion request as seen by a connector.
#[derive(Debug, Clone)]
pub struct ConnectorRequest {
    /// Conversation, already rendered through the assistant pipeline.
    pub messages: Vec<ChatMessage>,
    /// Whether the client requested SSE streaming.
    pub stream: bool,
    /// Remaining client body parameters (temperature, top_p, …). Keys with a
    /// `__` prefix are host-side internals and are dropped before forwarding.
    pub body: BTreeMap<String, Value>,
    /// Requested model, before resolution.
    pub model: Option<String>,
    /// Assistant owner email for organization config resolution.
    pub owner: Option<String>,
    /// Tools granted to the assistant for this request.
    pub tools: Vec<ToolDefinition>,
    /// Substitute the organization's small-fast model.
    pub use_small_fast_model: bool,
    /// Creator-user id, used by the image connector for storage paths.
    pub creator_user_id: Option<i64>,
}

impl ConnectorRequest {
    /// Body parameters with host-side `__`-prefixed keys removed.
    pub fn forwardable_body(&self) -> BTreeMap<String, Value> {
        self.body
            .iter()
            .filter(|(k, _)| !k.starts_with("__"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A lazily produced stream of frames.
pub type FrameStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

/// Connector output: one JSON completion or a frame stream.
pub enum CompletionOutput {
    /// Full OpenAI-shaped `chat.completion` object.
    Full(Value),
    /// SSE frame sequence, terminated by exactly one [`Frame::Done`].
    Stream(FrameStream),
}

impl std::fmt::Debug for CompletionOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(v) => f.debug_tuple("Full").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One element of a streaming response.
///
/// The pass-through variant keeps upstream chunks verbatim in
/// [`Frame::Chunk`]; synthesized streams (Ollama re-framing, image
/// connector) build chunks with the constructors below.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// An OpenAI-shaped `chat.completion.chunk` object, forwarded verbatim.
    Chunk(Value),
    /// The `data: [DONE]` sentinel. Exactly one per stream, always last.
    Done,
    /// Terminal failure; the serializer renders one synthetic delta chunk
    /// followed by the sentinel.
    Err(CompletionError),
}

/// Envelope metadata reused across the synthetic chunks of one stream.
#[derive(Debug, Clone)]
pub struct ChunkEnvelope {
    /// Response id shared by all chunks of the stream.
    pub id: String,
    /// Unix creation timestamp.
    pub created: i64,
    /// Model name reported downstream.
    pub model: String,
}

impl ChunkEnvelope {
    /// Build an envelope for a synthesized stream.
    pub fn new(prefix: &str, model: &str) -> Self {
        let created = chrono::Utc::now().timestamp();
        Self {
            id: format!("{prefix}-{created}"),
            created,
            model: model.to_owned(),
        }
    }

    /// Chunk carrying the initial `delta.role`.
    pub fn role_chunk(&self) -> Value {
        self.chunk(json!({"role": "assistant"}), None)
    }

    /// Chunk carrying a content delta.
    pub fn content_chunk(&self, content: &str) -> Value {
        self.chunk(json!({"content": content}), None)
    }

    /// Final chunk with an empty delta and a finish reason.
    pub fn finish_chunk(&self, finish_reason: &str) -> Value {
        self.chunk(json!({}), Some(finish_reason))
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "logprobs": null,
                "finish_reason": finish_reason,
            }]
        })
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure taxonomy for completion calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or disabled provider configuration for the tenant.
    Config,
    /// Upstream rejected the credentials.
    Auth,
    /// Upstream rate limit.
    RateLimit,
    /// Upstream quota or billing failure.
    Quota,
    /// Model-related or other upstream API error.
    Upstream,
    /// Network-level failure.
    Connection,
    /// Request timed out.
    Timeout,
    /// Upstream response failed to parse.
    Parse,
}

impl ErrorKind {
    /// Human-readable label used in error content.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "Configuration Error",
            Self::Auth => "Authentication Error",
            Self::RateLimit => "Rate Limit",
            Self::Quota => "Quota Exceeded",
            Self::Upstream => "API Error",
            Self::Connection => "Connection Error",
            Self::Timeout => "Timeout",
            Self::Parse => "Response Parse Error",
        }
    }
}

/// A completion failure carried as data.
///
/// The completion path prefers returning a well-formed OpenAI completion
/// whose content starts with a visible `❌` marker over raising, so chat
/// clients render the problem inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionError {
    /// Failure class.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Model involved, when known.
    pub model: Option<String>,
    /// Base URL involved, when known.
    pub base_url: Option<String>,
}

impl std::fmt::Display for CompletionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for CompletionError {}

impl CompletionError {
    /// Build an error with no model/base-url context.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            model: None,
            base_url: None,
        }
    }

    /// Attach the model involved.
    #[must_use]
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_owned());
        self
    }

    /// Classify a `reqwest` transport error.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else {
            ErrorKind::Connection
        };
        Self::new(kind, err.to_string())
    }

    /// Classify an upstream HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ErrorKind::Auth,
            402 => ErrorKind::Quota,
            429 => ErrorKind::RateLimit,
            _ => ErrorKind::Upstream,
        };
        Self::new(kind, format!("upstream returned {status}: {body}"))
    }

    /// The visible marker content for chat clients.
    pub fn visible_content(&self) -> String {
        format!("❌ {}: {}", self.kind.as_str(), self.message)
    }

    /// Render this error as a full OpenAI-shaped completion object.
    pub fn to_completion(&self, model: &str) -> Value {
        let created = chrono::Utc::now().timestamp();
        json!({
            "id": format!("chatcmpl-error-{created}"),
            "object": "chat.completion",
            "created": created,
            "model": self.model.as_deref().unwrap_or(model),
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": self.visible_content(),
                },
                "logprobs": null,
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
        })
    }

    /// Render this error as the synthetic delta chunk of a failed stream.
    pub fn to_error_chunk(&self, model: &str) -> Value {
        let envelope = ChunkEnvelope::new("chatcmpl-error", self.model.as_deref().unwrap_or(model));
        json!({
            "id": envelope.id,
            "object": "chat.completion.chunk",
            "created": envelope.created,
            "model": envelope.model,
            "choices": [{
                "index": 0,
                "delta": {"content": self.visible_content()},
                "finish_reason": "stop",
            }]
        })
    }

    /// Compose the error reported when both the requested model and the
    /// organization default failed.
    pub fn composite(org_name: &str, first: &Self, fallback_model: &str, second: &Self) -> Self {
        let message = format!(
            "upstream failure for organization '{org_name}': requested model failed ({first}); \
             fallback to default model '{fallback_model}' also failed ({second})"
        );
        Self {
            kind: second.kind,
            message,
            model: Some(fallback_model.to_owned()),
            base_url: second.base_url.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Connector trait & dispatch
// ---------------------------------------------------------------------------

/// Shared behavior of the closed connector set.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Execute a completion request.
    ///
    /// Failures are carried as data: the non-streaming arm returns an
    /// error-shaped completion, the streaming arm a [`Frame::Err`] followed
    /// by [`Frame::Done`]. This method itself does not fail.
    async fn complete(&self, request: ConnectorRequest) -> CompletionOutput;

    /// List models available for an owner's tenant.
    ///
    /// # Errors
    ///
    /// Returns a [`CompletionError`] when the provider is disabled or the
    /// upstream listing call fails.
    async fn list_models(&self, owner: Option<&str>) -> Result<Vec<String>, CompletionError>;

    /// Name of this connector (`openai`, `ollama`, `banana`).
    fn name(&self) -> &'static str;
}

/// The closed set of connector variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    /// OpenAI-compatible backend.
    OpenAi,
    /// Ollama-native backend.
    Ollama,
    /// Google GenAI image backend.
    Banana,
}

impl ConnectorKind {
    /// Parse a connector name from assistant metadata; unknown names fall
    /// back to the OpenAI-compatible connector.
    pub fn parse(name: &str) -> Self {
        match name {
            "ollama" => Self::Ollama,
            "banana" | "banana_img" | "google" => Self::Banana,
            _ => Self::OpenAi,
        }
    }

    /// Provider name used for organization config resolution.
    pub fn provider(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
            Self::Banana => "google",
        }
    }
}
