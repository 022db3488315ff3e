//! Vector-store client.
//!
//! The store is an external Chroma-compatible engine reached over HTTP and
//! treated as an opaque collection: create, upsert, delete, query. Writes
//! for a single file are issued as one batch to avoid partial-file
//! visibility.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::providers::pool::ClientPool;

use super::KbError;

/// One query hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    /// Chunk text.
    pub document: String,
    /// Chunk metadata.
    pub metadata: Value,
    /// Cosine distance reported by the store.
    pub distance: f64,
}

impl VectorHit {
    /// Similarity in `[0, 1]` derived from the cosine distance.
    pub fn similarity(&self) -> f64 {
        (1.0 - self.distance).clamp(0.0, 1.0)
    }
}

/// Chroma-compatible vector store client.
#[derive(Clone)]
pub struct VectorStore {
    pool: Arc<ClientPool>,
    base_url: String,
}

impl VectorStore {
    /// Build a client for the configured engine.
    pub fn new(pool: Arc<ClientPool>, base_url: String) -> Self {
        Self { pool, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base_url.trim_end_matches('/'))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, KbError> {
        let client = self.pool.get(&self.base_url);
        let response = client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| KbError::VectorStore(e.to_string()))?;

        let status = response.status();
        let payload: Value = if status.is_success() {
            response.json().await.unwrap_or(Value::Null)
        } else {
            let text = response.text().await.unwrap_or_default();
            return Err(KbError::VectorStore(format!(
                "vector store returned {status}: {text}"
            )));
        };
        Ok(payload)
    }

    /// Create (or fetch) a named collection, returning its UUID.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::VectorStore`] on failure.
    pub async fn ensure_collection(&self, name: &str) -> Result<String, KbError> {
        let payload = self
            .post(
                "/collections",
                &json!({"name": name, "get_or_create": true, "metadata": {"hnsw:space": "cosine"}}),
            )
            .await?;

        payload
            .get("id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| KbError::VectorStore("collection creation returned no id".to_owned()))
    }

    /// Upsert one batch of chunks with their embeddings and metadata.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::VectorStore`] on failure.
    pub async fn upsert(
        &self,
        collection_uuid: &str,
        ids: &[String],
        embeddings: &[Vec<f32>],
        documents: &[String],
        metadatas: &[Value],
    ) -> Result<(), KbError> {
        let body = json!({
            "ids": ids,
            "embeddings": embeddings,
            "documents": documents,
            "metadatas": metadatas,
        });
        self.post(&format!("/collections/{collection_uuid}/upsert"), &body)
            .await?;
        info!(collection = collection_uuid, count = ids.len(), "vector batch upserted");
        Ok(())
    }

    /// Query by embedding, returning the `top_k` nearest chunks.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::VectorStore`] on failure.
    pub async fn query(
        &self,
        collection_uuid: &str,
        embedding: &[f32],
        top_k: u32,
    ) -> Result<Vec<VectorHit>, KbError> {
        let body = json!({
            "query_embeddings": [embedding],
            "n_results": top_k,
            "include": ["documents", "metadatas", "distances"],
        });
        let payload = self
            .post(&format!("/collections/{collection_uuid}/query"), &body)
            .await?;

        let documents = payload.pointer("/documents/0").and_then(Value::as_array);
        let metadatas = payload.pointer("/metadatas/0").and_then(Value::as_array);
        let distances = payload.pointer("/distances/0").and_then(Value::as_array);

        let (Some(documents), Some(distances)) = (documents, distances) else {
            return Ok(Vec::new());
        };

        let hits = documents
            .iter()
            .enumerate()
            .map(|(i, doc)| VectorHit {
                document: doc.as_str().unwrap_or_default().to_owned(),
                metadata: metadatas
                    .and_then(|m| m.get(i))
                    .cloned()
                    .unwrap_or(Value::Null),
                distance: distances
                    .get(i)
                    .and_then(Value::as_f64)
                    .unwrap_or(1.0),
            })
            .collect();
        Ok(hits)
    }

    /// Delete every chunk belonging to one file registry entry.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::VectorStore`] on failure.
    pub async fn delete_file_chunks(
        &self,
        collection_uuid: &str,
        file_registry_id: i64,
    ) -> Result<(), KbError> {
        let body = json!({"where": {"file_registry_id": file_registry_id}});
        self.post(&format!("/collections/{collection_uuid}/delete"), &body)
            .await?;
        debug!(collection = collection_uuid, file = file_registry_id, "file chunks deleted");
        Ok(())
    }

    /// Drop an entire collection.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::VectorStore`] on failure.
    pub async fn delete_collection(&self, collection_uuid: &str) -> Result<(), KbError> {
        let client = self.pool.get(&self.base_url);
        let response = client
            .delete(self.url(&format!("/collections/{collection_uuid}")))
            .send()
            .await
            .map_err(|e| KbError::VectorStore(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(KbError::VectorStore(format!(
                "vector store returned {status}: {text}"
            )));
        }
        Ok(())
    }

    /// Number of chunks stored in a collection.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::VectorStore`] on failure.
    pub async fn count(&self, collection_uuid: &str) -> Result<u64, KbError> {
        let client = self.pool.get(&self.base_url);
        let response = client
            .get(self.url(&format!("/collections/{collection_uuid}/count")))
            .send()
            .await
            .map_err(|e| KbError::VectorStore(e.to_string()))?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| KbError::VectorStore(e.to_string()))?;
        Ok(payload.as_u64().unwrap_or(0))
    }
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
