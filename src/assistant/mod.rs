//! Assistant domain model.
//!
//! An assistant is a named, owned configuration that turns a chat request
//! into an LLM call: system prompt, prompt template, connector and model
//! selection, retrieval wiring, tools, and capability flags. Everything
//! beyond the prompt columns lives in the `metadata` JSON document.

pub mod executor;
pub mod groups;
pub mod sharing;
pub mod store;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Sentinel owner assigned to soft-deleted assistants.
pub const DELETED_OWNER: &str = "deleted_assistant@owi.com";

/// Model-id prefix exposed through the OpenAI-compatible API.
pub const MODEL_ID_PREFIX: &str = "lectern_assistant.";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from assistant operations.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// Database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Assistant does not exist (or is soft-deleted).
    #[error("assistant not found")]
    NotFound,
    /// Caller is not allowed to act on this assistant.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Name violates the naming rule or is already taken.
    #[error("invalid assistant name: {0}")]
    InvalidName(String),
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// An assistant row with its parsed metadata and optional publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assistant {
    /// Database row id.
    pub id: i64,
    /// Name, unique per owner. Matches `^[A-Za-z0-9_-]+$`.
    pub name: String,
    /// Owner email.
    pub owner: String,
    /// Human description.
    pub description: String,
    /// System prompt injected before the conversation.
    pub system_prompt: String,
    /// Prompt template with `{context}` / `{user_input}` placeholders.
    pub prompt_template: String,
    /// Parsed configuration document.
    pub metadata: AssistantMetadata,
    /// Publication record when the assistant is published.
    pub publication: Option<Publication>,
}

impl Assistant {
    /// Whether this row was soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.owner == DELETED_OWNER
    }

    /// The model id exposed through `GET /v1/models`.
    pub fn model_id(&self) -> String {
        format!("{MODEL_ID_PREFIX}{}", self.id)
    }
}

/// Publication record linking an assistant to an external consumer group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    /// External group id.
    pub group_id: String,
    /// External group display name.
    pub group_name: String,
    /// OAuth consumer the assistant was published for.
    pub oauth_consumer_name: String,
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Capability flags advertised on the models listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Accepts image input.
    pub vision: bool,
    /// Generates images.
    pub image_generation: bool,
}

/// Parsed assistant metadata.
///
/// Stored as a JSON document; unknown keys are ignored and an unparseable
/// document degrades to the defaults with a warning, so a broken assistant
/// still answers (without plugins) instead of failing the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantMetadata {
    /// Connector selection (`openai`, `ollama`, `banana`).
    pub connector: String,
    /// Requested model; resolution may substitute it.
    pub llm: Option<String>,
    /// Retrieval plugin name (`simple_rag`, `no_rag`).
    pub rag_processor: Option<String>,
    /// Collections queried by the retrieval plugin (ids).
    pub rag_collections: Vec<String>,
    /// Results per collection query.
    pub rag_top_k: u32,
    /// Message processor run before retrieval.
    pub pre_retrieval: Option<String>,
    /// Output processor run after the connector.
    pub post_retrieval: Option<String>,
    /// Tools granted to this assistant (registry names).
    pub tools: Vec<String>,
    /// Capability flags.
    pub capabilities: Capabilities,
}

impl Default for AssistantMetadata {
    fn default() -> Self {
        Self {
            connector: "openai".to_owned(),
            llm: None,
            rag_processor: None,
            rag_collections: Vec::new(),
            rag_top_k: 5,
            pre_retrieval: None,
            post_retrieval: None,
            tools: Vec::new(),
            capabilities: Capabilities::default(),
        }
    }
}

impl AssistantMetadata {
    /// Parse from the stored JSON document.
    ///
    /// Unparseable documents yield the defaults so completion requests are
    /// not blocked by a corrupt row; the incident is logged.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<Self>(raw) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(error = %e, "unparseable assistant metadata, using defaults");
                Self::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate an assistant name against the naming rule.
///
/// # Errors
///
/// Returns [`AssistantError::InvalidName`] for empty names or names with
/// characters outside `[A-Za-z0-9_-]`.
pub fn validate_name(name: &str) -> Result<(), AssistantError> {
    // The pattern is a compile-time constant; failure to build it would be a
    // programming error surfaced on the first call.
    let valid = Regex::new("^[A-Za-z0-9_-]+$")
        .map(|re| re.is_match(name))
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(AssistantError::InvalidName(
            "assistant names may only contain letters, numbers, underscores and hyphens"
                .to_owned(),
        ))
    }
}

/// Strip the external model-id prefix, yielding the assistant id.
pub fn parse_model_id(model: &str) -> Option<i64> {
    model.strip_prefix(MODEL_ID_PREFIX)?.parse().ok()
}
