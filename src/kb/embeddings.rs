//! Embedding generation for collections.
//!
//! Resolves a collection's effective embeddings configuration into a
//! vendor-specific embedder. Per-tenant API keys travel only inside the
//! resolved configuration; they never cross collection boundaries.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::providers::pool::ClientPool;

use super::models::EmbeddingsConfig;
use super::KbError;

/// Default OpenAI embeddings endpoint.
const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1";

/// Default Ollama endpoint.
const OLLAMA_EMBEDDINGS_URL: &str = "http://localhost:11434";

/// Vendor-dispatched embedder for one collection.
#[derive(Clone)]
pub struct Embedder {
    pool: Arc<ClientPool>,
    config: EmbeddingsConfig,
}

impl Embedder {
    /// Build an embedder from a resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::Validation`] for unsupported vendors or a missing
    /// OpenAI key.
    pub fn from_config(pool: Arc<ClientPool>, config: EmbeddingsConfig) -> Result<Self, KbError> {
        match config.vendor.to_lowercase().as_str() {
            "openai" => {
                if config.api_key.as_deref().unwrap_or("").is_empty() {
                    return Err(KbError::Validation(
                        "OpenAI embeddings require an API key".to_owned(),
                    ));
                }
            }
            "ollama" => {}
            other => {
                return Err(KbError::Validation(format!(
                    "unsupported embeddings vendor '{other}'"
                )))
            }
        }
        Ok(Self { pool, config })
    }

    /// Embed a batch of texts, preserving order.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::Embedding`] on transport or parse failure.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, KbError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(vendor = %self.config.vendor, count = texts.len(), "embedding batch");

        if self.config.is_openai() {
            self.embed_openai(texts).await
        } else {
            self.embed_ollama(texts).await
        }
    }

    /// Embed one text (query path).
    ///
    /// # Errors
    ///
    /// Returns [`KbError::Embedding`] on failure.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, KbError> {
        let mut batch = self.embed_batch(&[text.to_owned()]).await?;
        batch
            .pop()
            .ok_or_else(|| KbError::Embedding("empty embeddings response".to_owned()))
    }

    async fn embed_openai(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, KbError> {
        let base_url = self
            .config
            .api_endpoint
            .clone()
            .unwrap_or_else(|| OPENAI_EMBEDDINGS_URL.to_owned());
        let client = self.pool.get(&base_url);
        let url = format!("{}/embeddings", base_url.trim_end_matches('/'));
        let body = json!({"model": self.config.model, "input": texts});

        let response = client
            .post(&url)
            .bearer_auth(self.config.api_key.as_deref().unwrap_or_default())
            .json(&body)
            .send()
            .await
            .map_err(|e| KbError::Embedding(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(KbError::Embedding(format!("openai returned {status}: {text}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| KbError::Embedding(e.to_string()))?;

        let mut rows: Vec<(usize, Vec<f32>)> = payload
            .get("data")
            .and_then(Value::as_array)
            .map(|data| {
                data.iter()
                    .filter_map(|row| {
                        let index = row.get("index").and_then(Value::as_u64)? as usize;
                        let embedding = parse_vector(row.get("embedding")?)?;
                        Some((index, embedding))
                    })
                    .collect()
            })
            .unwrap_or_default();

        if rows.len() != texts.len() {
            return Err(KbError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                rows.len()
            )));
        }

        rows.sort_by_key(|(index, _)| *index);
        Ok(rows.into_iter().map(|(_, embedding)| embedding).collect())
    }

    async fn embed_ollama(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, KbError> {
        let base_url = self
            .config
            .api_endpoint
            .clone()
            .unwrap_or_else(|| OLLAMA_EMBEDDINGS_URL.to_owned());
        let client = self.pool.get(&base_url);
        let url = format!("{}/api/embed", base_url.trim_end_matches('/'));
        let body = json!({"model": self.config.model, "input": texts});

        let response = client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| KbError::Embedding(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(KbError::Embedding(format!("ollama returned {status}: {text}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| KbError::Embedding(e.to_string()))?;

        let embeddings: Vec<Vec<f32>> = payload
            .get("embeddings")
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(parse_vector).collect())
            .unwrap_or_default();

        if embeddings.len() != texts.len() {
            return Err(KbError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("vendor", &self.config.vendor)
            .field("model", &self.config.model)
            .finish_non_exhaustive()
    }
}

fn parse_vector(value: &Value) -> Option<Vec<f32>> {
    value.as_array().map(|xs| {
        xs.iter()
            .filter_map(Value::as_f64)
            .map(|x| x as f32)
            .collect()
    })
}
