//! Google GenAI image-generation connector.
//!
//! Dual-API aware: Gemini `*-image*` models use `generateContent`, Imagen
//! `*imagen*` models use the `generateImages` prediction endpoint. Generated
//! images are decoded from base64, persisted under the public static tree,
//! and returned as an OpenAI chat completion whose content is a Markdown
//! image link.
//!
//! Chat front-ends route *every* request for an assistant through its
//! connector, including automatic title/tag generation prompts. Those are
//! detected by pattern matching on the last user message and redirected to
//! the tenant's text LLM instead of the image API.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::org::resolver::ConfigResolver;

use super::pool::ClientPool;
use super::{
    ChatMessage, ChunkEnvelope, CompletionError, CompletionOutput, Connector, ConnectorRequest,
    ErrorKind, Frame,
};

/// Google GenAI REST endpoint.
const GENAI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Models offered when the tenant lists none.
const KNOWN_IMAGE_MODELS: [&str; 4] = [
    "gemini-2.5-flash-image-preview",
    "gemini-2.5-flash-image",
    "imagen-4.0-fast-generate-001",
    "imagen-4.0-generate-001",
];

/// Title/tag-generation detection patterns (checked lowercase).
const TITLE_PATTERNS: [&str; 13] = [
    r"generate.*title",
    r"create.*title",
    r"suggest.*title",
    r"generate.*tags",
    r"categorizing.*themes",
    r"chat history",
    r"conversation title",
    r"summarize.*conversation",
    r"task:\s*generate",
    r"output:\s*json\s*format",
    r"broad tags",
    r"subtopic tags",
    r"guidelines:",
];

/// Aspect ratios accepted by the image APIs.
const VALID_ASPECT_RATIOS: [&str; 5] = ["1:1", "3:4", "4:3", "16:9", "9:16"];

/// Google GenAI image connector.
pub struct BananaConnector {
    pool: Arc<ClientPool>,
    resolver: ConfigResolver,
    static_root: PathBuf,
    public_base_url: String,
}

impl BananaConnector {
    /// Build the connector.
    pub fn new(
        pool: Arc<ClientPool>,
        resolver: ConfigResolver,
        static_root: PathBuf,
        public_base_url: String,
    ) -> Self {
        Self {
            pool,
            resolver,
            static_root,
            public_base_url,
        }
    }
}

// ---------------------------------------------------------------------------
// Title routing (pub for integration testing)
// ---------------------------------------------------------------------------

/// Whether the last user message asks for a chat title or tags rather than
/// an image.
#[doc(hidden)]
pub fn is_title_generation_request(messages: &[ChatMessage]) -> bool {
    let Some(last) = messages.last() else {
        return false;
    };
    let content = last.content_text().to_lowercase();
    if content.is_empty() {
        return false;
    }

    if content.trim_start().starts_with("### task:") || content.contains("### task:") {
        return true;
    }

    TITLE_PATTERNS.iter().any(|pattern| {
        Regex::new(pattern)
            .map(|re| re.is_match(&content))
            .unwrap_or(false)
    })
}

// ---------------------------------------------------------------------------
// Generation parameters (pub for integration testing)
// ---------------------------------------------------------------------------

/// Validated image-generation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationConfig {
    /// Images per request, clamped to `[1, 4]`.
    pub number_of_images: u32,
    /// One of the supported aspect ratios.
    pub aspect_ratio: String,
    /// Output MIME type.
    pub output_mime_type: String,
}

impl GenerationConfig {
    /// File extension for the configured MIME type.
    pub fn extension(&self) -> &'static str {
        match self.output_mime_type.as_str() {
            "image/png" => "png",
            "image/webp" => "webp",
            _ => "jpg",
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            number_of_images: 1,
            aspect_ratio: "16:9".to_owned(),
            output_mime_type: "image/jpeg".to_owned(),
        }
    }
}

/// Extract and validate generation parameters from the request body.
#[doc(hidden)]
pub fn extract_generation_config(body: &std::collections::BTreeMap<String, Value>) -> GenerationConfig {
    let mut config = GenerationConfig::default();

    if let Some(n) = body.get("number_of_images").and_then(Value::as_u64) {
        config.number_of_images = n.clamp(1, 4) as u32;
    }
    if let Some(ratio) = body.get("aspect_ratio").and_then(Value::as_str) {
        if VALID_ASPECT_RATIOS.contains(&ratio) {
            config.aspect_ratio = ratio.to_owned();
        }
    }
    if let Some(mime) = body.get("output_mime_type").and_then(Value::as_str) {
        if ["image/jpeg", "image/png", "image/webp"].contains(&mime) {
            config.output_mime_type = mime.to_owned();
        }
    }

    config
}

/// Extract the image prompt from the last user message.
#[doc(hidden)]
pub fn extract_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(ChatMessage::content_text)
        .unwrap_or_default()
}

/// Whether a model uses the Imagen prediction API (vs Gemini content API).
#[doc(hidden)]
pub fn is_imagen_model(model: &str) -> bool {
    model.contains("imagen")
}

// ---------------------------------------------------------------------------
// Connector impl
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Connector for BananaConnector {
    async fn complete(&self, request: ConnectorRequest) -> CompletionOutput {
        // Title/tag requests are not image work: hand them to the text LLM.
        if is_title_generation_request(&request.messages) {
            info!("title-generation request detected, routing to text model");
            return self.generate_title(&request).await;
        }

        let config = self.resolver.resolve(request.owner.as_deref(), "google").await;
        if !config.enabled {
            return error_output(
                CompletionError::new(
                    ErrorKind::Config,
                    format!(
                        "Google image provider is not configured for organization '{}'",
                        config.org_name
                    ),
                ),
                "banana",
                request.stream,
            );
        }
        let Some(api_key) = config.api_key.clone() else {
            return error_output(
                CompletionError::new(
                    ErrorKind::Config,
                    format!("no Google API key configured for organization '{}'", config.org_name),
                ),
                "banana",
                request.stream,
            );
        };

        let model = request
            .model
            .clone()
            .or_else(|| config.default_model.clone())
            .or_else(|| config.models.first().cloned())
            .unwrap_or_else(|| KNOWN_IMAGE_MODELS[0].to_owned());

        let prompt = extract_prompt(&request.messages);
        if prompt.is_empty() {
            return error_output(
                CompletionError::new(ErrorKind::Config, "no prompt found for image generation"),
                &model,
                request.stream,
            );
        }

        let generation = extract_generation_config(&request.body);
        debug!(model, ?generation, "image generation request");

        let images = if is_imagen_model(&model) {
            self.call_imagen(&api_key, &model, &prompt, &generation).await
        } else {
            self.call_gemini(&api_key, &model, &prompt).await
        };

        let images = match images {
            Ok(images) if !images.is_empty() => images,
            Ok(_) => {
                return error_output(
                    CompletionError::new(ErrorKind::Upstream, "the model returned no images")
                        .with_model(&model),
                    &model,
                    request.stream,
                )
            }
            Err(err) => return error_output(err.with_model(&model), &model, request.stream),
        };

        match self.persist_images(&images, request.creator_user_id, &generation) {
            Ok(urls) => {
                let content = urls
                    .iter()
                    .map(|url| format!("![generated image]({url})"))
                    .collect::<Vec<_>>()
                    .join("\n\n");
                completion_output(&content, &model, request.stream)
            }
            Err(err) => error_output(err, &model, request.stream),
        }
    }

    async fn list_models(&self, owner: Option<&str>) -> Result<Vec<String>, CompletionError> {
        let config = self.resolver.resolve(owner, "google").await;
        if !config.enabled {
            return Err(CompletionError::new(
                ErrorKind::Config,
                "Google image provider is not configured",
            ));
        }
        if config.models.is_empty() {
            Ok(KNOWN_IMAGE_MODELS.iter().map(|m| (*m).to_owned()).collect())
        } else {
            Ok(config.models)
        }
    }

    fn name(&self) -> &'static str {
        "banana"
    }
}

impl BananaConnector {
    /// Route a title/tag request to the tenant's text LLM.
    async fn generate_title(&self, request: &ConnectorRequest) -> CompletionOutput {
        let config = self.resolver.resolve(request.owner.as_deref(), "openai").await;
        if !config.enabled || config.api_key.is_none() {
            return error_output(
                CompletionError::new(
                    ErrorKind::Config,
                    "no text model available for title generation",
                ),
                "banana",
                request.stream,
            );
        }

        let model = if config.models.iter().any(|m| m == "gpt-4o-mini") {
            "gpt-4o-mini".to_owned()
        } else {
            config
                .models
                .first()
                .cloned()
                .unwrap_or_else(|| "gpt-4o-mini".to_owned())
        };
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_owned());
        let api_key = config.api_key.clone().unwrap_or_default();

        let client = self.pool.get(&base_url);
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let body = json!({
            "model": model,
            "messages": request.messages,
            "stream": false,
            "max_tokens": 100,
            "temperature": 0.7,
        });

        let result = async {
            let response = client
                .post(&url)
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| CompletionError::from_transport(&e))?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(CompletionError::from_status(status.as_u16(), &text));
            }
            response
                .json::<Value>()
                .await
                .map_err(|e| CompletionError::new(ErrorKind::Parse, e.to_string()))
        }
        .await;

        match result {
            Ok(payload) => {
                let content = payload
                    .pointer("/choices/0/message/content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                completion_output(content, &model, request.stream)
            }
            Err(err) => error_output(err, &model, request.stream),
        }
    }

    /// Gemini image models: `generateContent`, images arrive as inline data.
    async fn call_gemini(
        &self,
        api_key: &str,
        model: &str,
        prompt: &str,
    ) -> Result<Vec<Vec<u8>>, CompletionError> {
        let client = self.pool.get(GENAI_BASE_URL);
        let url = format!("{GENAI_BASE_URL}/models/{model}:generateContent");
        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}],
        });

        let response = client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&body)
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

        let parts = payload
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut images = Vec::new();
        for part in parts {
            let data = part
                .pointer("/inlineData/data")
                .or_else(|| part.pointer("/inline_data/data"))
                .and_then(Value::as_str);
            if let Some(encoded) = data {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| CompletionError::new(ErrorKind::Parse, e.to_string()))?;
                images.push(decoded);
            }
        }
        Ok(images)
    }

    /// Imagen models: `generateImages` prediction endpoint.
    async fn call_imagen(
        &self,
        api_key: &str,
        model: &str,
        prompt: &str,
        generation: &GenerationConfig,
    ) -> Result<Vec<Vec<u8>>, CompletionError> {
        let client = self.pool.get(GENAI_BASE_URL);
        let url = format!("{GENAI_BASE_URL}/models/{model}:predict");
        let body = json!({
            "instances": [{"prompt": prompt}],
            "parameters": {
                "sampleCount": generation.number_of_images,
                "aspectRatio": generation.aspect_ratio,
                "outputMimeType": generation.output_mime_type,
            },
        });

        let response = client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&body)
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

        let mut images = Vec::new();
        for prediction in payload
            .get("predictions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
        {
            if let Some(encoded) = prediction.get("bytesBase64Encoded").and_then(Value::as_str) {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| CompletionError::new(ErrorKind::Parse, e.to_string()))?;
                images.push(decoded);
            }
        }
        Ok(images)
    }

    /// Persist decoded images under the public static tree and return their
    /// public URLs.
    fn persist_images(
        &self,
        images: &[Vec<u8>],
        creator_user_id: Option<i64>,
        generation: &GenerationConfig,
    ) -> Result<Vec<String>, CompletionError> {
        let user_segment = creator_user_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "anonymous".to_owned());
        let dir = self
            .static_root
            .join("public")
            .join(&user_segment)
            .join("img");
        std::fs::create_dir_all(&dir).map_err(|e| {
            CompletionError::new(ErrorKind::Upstream, format!("failed to create image directory: {e}"))
        })?;

        let mut urls = Vec::new();
        for image in images {
            let epoch_ms = chrono::Utc::now().timestamp_millis();
            let short_id: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
            let filename = format!("img_{epoch_ms}_{short_id}.{}", generation.extension());
            let path = dir.join(&filename);

            std::fs::write(&path, image).map_err(|e| {
                CompletionError::new(ErrorKind::Upstream, format!("failed to write image: {e}"))
            })?;
            debug!(path = %path.display(), "image persisted");

            urls.push(format!(
                "{}/static/public/{user_segment}/img/{filename}",
                self.public_base_url.trim_end_matches('/'),
            ));
        }

        info!(count = urls.len(), "generated images persisted");
        Ok(urls)
    }
}

// ---------------------------------------------------------------------------
// Output shaping
// ---------------------------------------------------------------------------

/// Build the output for generated content, synthesizing a stream when asked:
/// one content chunk, one finish chunk, then the terminator.
fn completion_output(content: &str, model: &str, stream: bool) -> CompletionOutput {
    if stream {
        let envelope = ChunkEnvelope::new("banana", model);
        let frames = vec![
            Frame::Chunk(envelope.role_chunk()),
            Frame::Chunk(envelope.content_chunk(content)),
            Frame::Chunk(envelope.finish_chunk("stop")),
            Frame::Done,
        ];
        CompletionOutput::Stream(Box::pin(futures::stream::iter(frames)))
    } else {
        let created = chrono::Utc::now().timestamp();
        CompletionOutput::Full(json!({
            "id": format!("banana-{created}"),
            "object": "chat.completion",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "logprobs": null,
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
        }))
    }
}

fn error_output(err: CompletionError, model: &str, stream: bool) -> CompletionOutput {
    if stream {
        CompletionOutput::Stream(Box::pin(futures::stream::iter([Frame::Err(err)])))
    } else {
        CompletionOutput::Full(err.to_completion(model))
    }
}
