//! Assistant execution pipeline.
//!
//! Turns a normalized gateway request into a connector call:
//! load + authorize → parse metadata → pre-retrieval processing → retrieval →
//! prompt assembly → connector → post-retrieval wrapping. The executor holds
//! no request state; everything flows through arguments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::org::store::OrgStore;
use crate::org::CreatorUser;
use crate::providers::banana::{is_title_generation_request, BananaConnector};
use crate::providers::ollama::OllamaConnector;
use crate::providers::openai::OpenAiConnector;
use crate::providers::{
    ChatMessage, CompletionOutput, Connector, ConnectorKind, ConnectorRequest, Frame,
};
use crate::tools::ToolRegistry;

use super::sharing::SharingService;
use super::store::AssistantStore;
use super::{Assistant, AssistantError};

/// Default prompt template applied when retrieval produced context but the
/// assistant has none configured.
const DEFAULT_RAG_TEMPLATE: &str = "{context}\n\n{user_input}";

// ---------------------------------------------------------------------------
// Retrieval contract
// ---------------------------------------------------------------------------

/// One retrieved chunk.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    /// Similarity score in `[0, 1]`.
    pub similarity: f64,
    /// Chunk text.
    pub data: String,
    /// Chunk metadata.
    pub metadata: Value,
}

/// Retrieval backend used by the RAG step.
#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    /// Query one collection.
    ///
    /// # Errors
    ///
    /// Returns a human-readable error string; retrieval failures degrade
    /// the request to no-context rather than failing it.
    async fn query(
        &self,
        collection_id: &str,
        query_text: &str,
        top_k: u32,
    ) -> Result<Vec<RetrievedChunk>, String>;
}

// ---------------------------------------------------------------------------
// Message / output processors
// ---------------------------------------------------------------------------

/// A pre-retrieval message processor.
pub type MessageProcessor = Arc<dyn Fn(Vec<ChatMessage>) -> Vec<ChatMessage> + Send + Sync>;

/// A post-retrieval output processor applied to content text.
pub type OutputProcessor = Arc<dyn Fn(String) -> String + Send + Sync>;

/// Named processors available to assistant metadata.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    pre: HashMap<String, MessageProcessor>,
    post: HashMap<String, OutputProcessor>,
}

impl ProcessorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pre-retrieval processor.
    pub fn register_pre(&mut self, name: &str, processor: MessageProcessor) {
        self.pre.insert(name.to_owned(), processor);
    }

    /// Register a post-retrieval processor.
    pub fn register_post(&mut self, name: &str, processor: OutputProcessor) {
        self.post.insert(name.to_owned(), processor);
    }

    fn pre_by_name(&self, name: &str) -> Option<&MessageProcessor> {
        self.pre.get(name)
    }

    fn post_by_name(&self, name: &str) -> Option<&OutputProcessor> {
        self.post.get(name)
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("pre", &self.pre.keys().collect::<Vec<_>>())
            .field("post", &self.post.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Connector set
// ---------------------------------------------------------------------------

/// The closed connector set, dispatched by [`ConnectorKind`].
pub struct Connectors {
    /// OpenAI-compatible backend.
    pub openai: OpenAiConnector,
    /// Ollama-native backend.
    pub ollama: OllamaConnector,
    /// Google image backend.
    pub banana: BananaConnector,
}

impl Connectors {
    /// Dispatch a kind to its connector.
    pub fn get(&self, kind: ConnectorKind) -> &dyn Connector {
        match kind {
            ConnectorKind::OpenAi => &self.openai,
            ConnectorKind::Ollama => &self.ollama,
            ConnectorKind::Banana => &self.banana,
        }
    }
}

// ---------------------------------------------------------------------------
// Request / executor
// ---------------------------------------------------------------------------

/// A gateway-normalized completion request.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Conversation messages (OpenAI-shaped).
    pub messages: Vec<ChatMessage>,
    /// Whether the client asked for SSE.
    pub stream: bool,
    /// Remaining body parameters.
    pub body: BTreeMap<String, Value>,
}

/// Assistant executor.
pub struct AssistantExecutor {
    assistants: AssistantStore,
    users: OrgStore,
    sharing: SharingService,
    tools: Arc<ToolRegistry>,
    retriever: Arc<dyn Retriever>,
    connectors: Connectors,
    processors: ProcessorRegistry,
}

impl AssistantExecutor {
    /// Build the executor.
    pub fn new(
        assistants: AssistantStore,
        users: OrgStore,
        sharing: SharingService,
        tools: Arc<ToolRegistry>,
        retriever: Arc<dyn Retriever>,
        connectors: Connectors,
        processors: ProcessorRegistry,
    ) -> Self {
        Self {
            assistants,
            users,
            sharing,
            tools,
            retriever,
            connectors,
            processors,
        }
    }

    /// Run a completion request against an assistant.
    ///
    /// `caller` is the authenticated creator user when the request came
    /// through an identity-bearing surface; completions arriving through
    /// the published-model façade carry no caller and rely on the
    /// process-level key plus publication state.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::NotFound`] for missing or soft-deleted
    /// assistants and [`AssistantError::Forbidden`] for unauthorized
    /// callers. Connector-level failures are carried as data in the output.
    pub async fn run(
        &self,
        assistant_id: i64,
        request: ExecutionRequest,
        caller: Option<&CreatorUser>,
    ) -> Result<CompletionOutput, AssistantError> {
        let assistant = self.assistants.by_id(assistant_id).await?;

        if let Some(user) = caller {
            if !self.sharing.can_access(&assistant, user).await? {
                return Err(AssistantError::Forbidden(
                    "not authorized for this assistant".to_owned(),
                ));
            }
        }

        let metadata = assistant.metadata.clone();
        debug!(assistant = assistant.id, connector = %metadata.connector, "executing assistant");

        // Pre-retrieval processing.
        let mut messages = request.messages.clone();
        if let Some(name) = &metadata.pre_retrieval {
            match self.processors.pre_by_name(name) {
                Some(processor) => messages = processor(messages),
                None => warn!(processor = %name, "unknown pre-retrieval processor, skipping"),
            }
        }

        // Retrieval.
        let context = self.retrieve_context(&assistant, &messages).await;

        // Prompt assembly.
        let messages = assemble_messages(&assistant, messages, context.as_deref());

        // Connector selection: the image capability overrides the metadata
        // connector so capability routing stays in one place.
        let kind = if metadata.capabilities.image_generation {
            ConnectorKind::Banana
        } else {
            ConnectorKind::parse(&metadata.connector)
        };

        // Auxiliary title/tag prompts run on the tenant's small-fast model.
        let use_small_fast_model =
            kind != ConnectorKind::Banana && is_title_generation_request(&messages);
        if use_small_fast_model {
            info!(assistant = assistant.id, "title-generation request, preferring small-fast model");
        }

        let creator_user_id = self
            .users
            .user_by_email(&assistant.owner)
            .await
            .map(|u| u.id)
            .ok();

        let connector_request = ConnectorRequest {
            messages,
            stream: request.stream,
            body: request.body.clone(),
            model: metadata.llm.clone(),
            owner: Some(assistant.owner.clone()),
            tools: self.tools.definitions_for(&metadata.tools),
            use_small_fast_model,
            creator_user_id,
        };

        let output = self.connectors.get(kind).complete(connector_request).await;

        // Post-retrieval wrapping.
        let output = match &metadata.post_retrieval {
            Some(name) => match self.processors.post_by_name(name) {
                Some(processor) => apply_output_processor(output, Arc::clone(processor)),
                None => {
                    warn!(processor = %name, "unknown post-retrieval processor, skipping");
                    output
                }
            },
            None => output,
        };

        Ok(output)
    }

    /// Run the retrieval plugin, if configured. Failures degrade to
    /// no-context with a warning.
    async fn retrieve_context(
        &self,
        assistant: &Assistant,
        messages: &[ChatMessage],
    ) -> Option<String> {
        let metadata = &assistant.metadata;
        let enabled = match metadata.rag_processor.as_deref() {
            Some("no_rag") => false,
            Some(_) => true,
            None => !metadata.rag_collections.is_empty(),
        };
        if !enabled || metadata.rag_collections.is_empty() {
            return None;
        }

        let query_text = last_user_text(messages);
        if query_text.is_empty() {
            return None;
        }

        let mut sections = Vec::new();
        for collection_id in &metadata.rag_collections {
            match self
                .retriever
                .query(collection_id, &query_text, metadata.rag_top_k)
                .await
            {
                Ok(chunks) => {
                    debug!(collection = %collection_id, hits = chunks.len(), "retrieval query");
                    sections.extend(chunks.into_iter().map(|c| c.data));
                }
                Err(e) => {
                    warn!(collection = %collection_id, error = %e, "retrieval query failed");
                }
            }
        }

        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }
}

// ---------------------------------------------------------------------------
// Prompt assembly (pub for integration testing)
// ---------------------------------------------------------------------------

/// Render a prompt template, substituting `{context}` and `{user_input}`.
#[doc(hidden)]
pub fn render_template(template: &str, context: &str, user_input: &str) -> String {
    template
        .replace("{context}", context)
        .replace("{user_input}", user_input)
}

/// Assemble the final message list: system prompt first, history untouched,
/// and the last user message rendered through the prompt template when
/// retrieval produced context (or a template is configured).
#[doc(hidden)]
pub fn assemble_messages(
    assistant: &Assistant,
    mut messages: Vec<ChatMessage>,
    context: Option<&str>,
) -> Vec<ChatMessage> {
    // Render the last user message through the template.
    let template = if !assistant.prompt_template.is_empty() {
        Some(assistant.prompt_template.clone())
    } else if context.is_some() {
        Some(DEFAULT_RAG_TEMPLATE.to_owned())
    } else {
        None
    };

    if let Some(template) = template {
        if let Some(last_user) = messages.iter_mut().rev().find(|m| m.role == "user") {
            // Multimodal content keeps its image parts: only the text part
            // is rendered through the template.
            let rendered = render_template(
                &template,
                context.unwrap_or_default(),
                &last_user.content_text(),
            );
            match &mut last_user.content {
                Value::Array(parts) => {
                    for part in parts.iter_mut() {
                        if part.get("type").and_then(Value::as_str) == Some("text") {
                            part["text"] = Value::String(rendered.clone());
                        }
                    }
                }
                content => *content = Value::String(rendered),
            }
        }
    }

    // System prompt goes first unless the client already sent one.
    if !assistant.system_prompt.is_empty() && messages.first().map(|m| m.role.as_str()) != Some("system")
    {
        messages.insert(0, ChatMessage::text("system", assistant.system_prompt.clone()));
    }

    messages
}

/// The last user message's text, used as the retrieval query.
fn last_user_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(ChatMessage::content_text)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Output wrapping
// ---------------------------------------------------------------------------

/// Pass connector output through a post-retrieval processor.
///
/// Streaming output is wrapped chunk by chunk; full output has its message
/// content rewritten in place.
fn apply_output_processor(output: CompletionOutput, processor: OutputProcessor) -> CompletionOutput {
    match output {
        CompletionOutput::Full(mut payload) => {
            if let Some(slot) = payload.pointer_mut("/choices/0/message/content") {
                if let Some(text) = slot.as_str().map(ToOwned::to_owned) {
                    *slot = Value::String(processor(text));
                }
            }
            CompletionOutput::Full(payload)
        }
        CompletionOutput::Stream(frames) => {
            let mapped = frames.map(move |frame| match frame {
                Frame::Chunk(mut chunk) => {
                    if let Some(slot) = chunk.pointer_mut("/choices/0/delta/content") {
                        if let Some(text) = slot.as_str().map(ToOwned::to_owned) {
                            *slot = Value::String(processor(text));
                        }
                    }
                    Frame::Chunk(chunk)
                }
                other => other,
            });
            CompletionOutput::Stream(mapped.boxed())
        }
    }
}
