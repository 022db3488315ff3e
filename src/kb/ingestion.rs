//! Ingestion job engine.
//!
//! Job creation is synchronous: validate the collection, persist the upload,
//! insert the registry row, spawn the worker, and return
//! `{file_registry_id, status: "processing"}` immediately. Everything after
//! that happens in a detached task that owns no request state and treats the
//! registry row as the single source of truth.
//!
//! Cancellation is cooperative: flipping the row to `cancelled` makes the
//! worker return at its next checkpoint; in-flight plugin work may finish
//! but its output is discarded and never reaches the vector store.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::providers::pool::ClientPool;

use super::embeddings::Embedder;
use super::models::{Collection, EmbeddingsConfig, FileStatus, StageTiming, Visibility};
use super::plugins::{IngestContext, IngestError, IngestSource, PluginRegistry};
use super::store::{EmbeddingsChoice, KbStore};
use super::vector::VectorStore;
use super::KbError;

/// Embedding request batch size (upserts stay one batch per file).
const EMBED_BATCH: usize = 64;

/// Everything the ingestion engine needs, cheap to clone into workers.
#[derive(Clone)]
pub struct IngestionService {
    store: KbStore,
    registry: Arc<PluginRegistry>,
    vector: VectorStore,
    pool: Arc<ClientPool>,
    static_root: PathBuf,
    public_base_url: String,
}

impl IngestionService {
    /// Build the service.
    pub fn new(
        store: KbStore,
        registry: Arc<PluginRegistry>,
        vector: VectorStore,
        pool: Arc<ClientPool>,
        static_root: PathBuf,
        public_base_url: String,
    ) -> Self {
        Self {
            store,
            registry,
            vector,
            pool,
            static_root,
            public_base_url,
        }
    }

    /// The registry store (shared with the HTTP layer).
    pub fn store(&self) -> &KbStore {
        &self.store
    }

    /// The plugin registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// The vector store client.
    pub fn vector(&self) -> &VectorStore {
        &self.vector
    }

    // -- collections --------------------------------------------------------

    /// Create a collection: validate the embeddings choice, lock the
    /// dimensionality, and provision the vector-store namespace.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::Validation`] for unusable embeddings configs or a
    /// taken name.
    pub async fn create_collection(
        &self,
        name: &str,
        description: Option<&str>,
        owner: &str,
        visibility: Visibility,
        embeddings: EmbeddingsChoice,
        dimensions: Option<i64>,
    ) -> Result<Collection, KbError> {
        // Validate the embedding function up front; it is immutable after
        // creation.
        let (config, locked_dimensions) = match &embeddings {
            EmbeddingsChoice::Setup(id) => {
                let setup = self.store.setup_by_id(*id).await?;
                (EmbeddingsConfig::from(&setup), setup.dimensions)
            }
            EmbeddingsChoice::Inline(config) => {
                let dims = dimensions.ok_or_else(|| {
                    KbError::Validation(
                        "embedding_dimensions is required with an inline embeddings config"
                            .to_owned(),
                    )
                })?;
                (config.clone(), dims)
            }
        };
        Embedder::from_config(Arc::clone(&self.pool), config)?;

        let vector_name = format!("{owner}_{name}");
        let uuid = self.vector.ensure_collection(&vector_name).await?;

        let id = self
            .store
            .create_collection(
                name,
                description,
                owner,
                visibility,
                &embeddings,
                locked_dimensions,
                &uuid,
            )
            .await?;

        info!(collection = id, owner, "collection created");
        self.store.collection_by_id(id).await
    }

    /// Delete a collection and its vector-store namespace.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::NotFound`] when missing; a vector-store failure is
    /// logged and does not block the registry delete.
    pub async fn delete_collection(&self, id: i64) -> Result<(), KbError> {
        let collection = self.store.collection_by_id(id).await?;
        if let Some(uuid) = &collection.vector_store_uuid {
            if let Err(e) = self.vector.delete_collection(uuid).await {
                warn!(collection = id, error = %e, "vector store delete failed");
            }
        }
        self.store.delete_collection(id).await
    }

    // -- job creation -------------------------------------------------------

    /// Create a file ingestion job: persist the upload under
    /// `<static_root>/<owner>/<collection>/<uuid>.<ext>`, insert the
    /// registry row, and spawn the worker.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::NotFound`] for a missing collection,
    /// [`KbError::UnknownPlugin`] for an unregistered plugin, and
    /// [`KbError::Storage`] when the upload cannot be persisted.
    pub async fn create_file_job(
        &self,
        collection_id: i64,
        original_filename: &str,
        bytes: &[u8],
        content_type: Option<&str>,
        plugin_name: &str,
        plugin_params: Value,
    ) -> Result<i64, KbError> {
        let collection = self.store.collection_by_id(collection_id).await?;
        if self.registry.ingest_plugin(plugin_name).is_none() {
            return Err(KbError::UnknownPlugin(plugin_name.to_owned()));
        }

        // Mode gating applies before the plugin ever sees the request.
        let params = self
            .registry
            .sanitize_ingest_params(plugin_name, plugin_params);

        let extension = PathBuf::from(original_filename)
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bin".to_owned());
        let stored_name = format!("{}.{extension}", Uuid::new_v4());
        let dir = self
            .static_root
            .join(&collection.owner)
            .join(&collection.name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| KbError::Storage(e.to_string()))?;
        let path = dir.join(&stored_name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| KbError::Storage(e.to_string()))?;

        let file_url = format!(
            "{}/static/{}/{}/{stored_name}",
            self.public_base_url.trim_end_matches('/'),
            collection.owner,
            collection.name,
        );

        let file_id = self
            .store
            .insert_file(
                collection_id,
                &collection.owner,
                original_filename,
                &path.to_string_lossy(),
                &file_url,
                bytes.len() as i64,
                content_type,
                plugin_name,
                &params,
            )
            .await?;

        info!(job = file_id, collection = collection_id, plugin = plugin_name, "ingestion job created");
        self.spawn_worker(file_id, IngestSource::File { path }, plugin_name.to_owned(), params, collection);
        Ok(file_id)
    }

    /// Create a URL (or transcript) ingestion job. Mirrors the file path
    /// without an upload.
    ///
    /// # Errors
    ///
    /// Same classes as [`IngestionService::create_file_job`].
    pub async fn create_url_job(
        &self,
        collection_id: i64,
        urls: Vec<String>,
        plugin_name: &str,
        plugin_params: Value,
    ) -> Result<i64, KbError> {
        let collection = self.store.collection_by_id(collection_id).await?;
        if self.registry.ingest_plugin(plugin_name).is_none() {
            return Err(KbError::UnknownPlugin(plugin_name.to_owned()));
        }
        if urls.is_empty() {
            return Err(KbError::Validation("no URLs supplied".to_owned()));
        }

        let params = self
            .registry
            .sanitize_ingest_params(plugin_name, plugin_params);

        let label = urls[0].clone();
        let file_id = self
            .store
            .insert_file(
                collection_id,
                &collection.owner,
                &label,
                &label,
                &label,
                0,
                Some("text/x-url-list"),
                plugin_name,
                &params,
            )
            .await?;

        info!(job = file_id, collection = collection_id, plugin = plugin_name, urls = urls.len(), "url ingestion job created");
        self.spawn_worker(file_id, IngestSource::Urls(urls), plugin_name.to_owned(), params, collection);
        Ok(file_id)
    }

    /// Cancel a job cooperatively.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::Validation`] when the job is already terminal.
    pub async fn cancel_job(&self, file_id: i64) -> Result<(), KbError> {
        self.store.set_status(file_id, FileStatus::Cancelled).await?;
        info!(job = file_id, "cancellation requested");
        Ok(())
    }

    /// Delete a file: vector chunks, then the registry row (soft by
    /// default, hard on request), then the stored file for hard deletes.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::NotFound`] when the file is missing.
    pub async fn delete_file(&self, file_id: i64, hard: bool) -> Result<(), KbError> {
        let entry = self.store.file_by_id(file_id).await?;
        let collection = self.store.collection_by_id(entry.collection_id).await?;

        if let Some(uuid) = &collection.vector_store_uuid {
            if let Err(e) = self.vector.delete_file_chunks(uuid, file_id).await {
                warn!(file = file_id, error = %e, "vector chunk delete failed");
            }
        }

        if hard {
            self.store.delete_file_row(file_id).await?;
            if tokio::fs::remove_file(&entry.file_path).await.is_err() {
                debug!(path = %entry.file_path, "stored file already absent");
            }
        } else {
            self.store.set_status(file_id, FileStatus::Deleted).await?;
        }
        Ok(())
    }

    // -- background worker --------------------------------------------------

    fn spawn_worker(
        &self,
        file_id: i64,
        source: IngestSource,
        plugin_name: String,
        params: Value,
        collection: Collection,
    ) {
        let service = self.clone();
        tokio::spawn(async move {
            service
                .run_worker(file_id, source, plugin_name, params, collection)
                .await;
        });
    }

    /// The background worker contract. Never raises; every failure is
    /// captured into the job row. Public for integration testing.
    #[doc(hidden)]
    pub async fn run_worker(
        &self,
        file_id: i64,
        source: IngestSource,
        plugin_name: String,
        params: Value,
        collection: Collection,
    ) {
        // Step 1: re-read the row; a cancellation that raced job creation
        // wins before any work happens.
        match self.store.file_status(file_id).await {
            Ok(FileStatus::Cancelled) => {
                info!(job = file_id, "job cancelled before start");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!(job = file_id, error = %e, "job row vanished before start");
                return;
            }
        }

        // Step 2: transition to processing with a start timestamp.
        if let Err(e) = self.store.mark_processing_started(file_id).await {
            error!(job = file_id, error = %e, "failed to mark job processing");
            return;
        }

        let file_path = match &source {
            IngestSource::File { path } => path.to_string_lossy().into_owned(),
            IngestSource::Urls(urls) => urls.first().cloned().unwrap_or_default(),
        };

        if let Err(e) = self
            .run_worker_inner(file_id, &source, &plugin_name, &params, &collection)
            .await
        {
            let capture = self
                .store
                .mark_failed(
                    file_id,
                    &e.message,
                    &e.kind,
                    &format!("{e}"),
                    &file_path,
                    &plugin_name,
                    &e.stage,
                )
                .await;
            if let Err(db_err) = capture {
                error!(job = file_id, error = %db_err, "failed to record job failure");
            }
        }
    }

    async fn run_worker_inner(
        &self,
        file_id: i64,
        source: &IngestSource,
        plugin_name: &str,
        params: &Value,
        collection: &Collection,
    ) -> Result<(), IngestError> {
        let plugin = self
            .registry
            .ingest_plugin(plugin_name)
            .ok_or_else(|| IngestError::at("setup", "LookupError", format!("unknown plugin {plugin_name}")))?;

        // Step 3: resolve the embedding function and decorate the context.
        // The collection API key reaches the plugin only when the embedding
        // vendor is OpenAI; other tenants' keys never leak into plugins.
        let embeddings = self
            .store
            .effective_embeddings(collection)
            .await
            .map_err(|e| IngestError::at("setup", "ConfigError", e.to_string()))?;
        let openai_api_key = embeddings
            .is_openai()
            .then(|| embeddings.api_key.clone())
            .flatten();

        // Step 4: progress and statistics callbacks write straight to the
        // job row; the worker task is the row's only writer while it runs.
        let progress_store = self.store.clone();
        let stats_store = self.store.clone();
        let ctx = IngestContext {
            collection_owner: collection.owner.clone(),
            collection_name: collection.name.clone(),
            openai_api_key,
            static_root: self.static_root.clone(),
            public_base_url: self.public_base_url.clone(),
            progress: Arc::new(move |current, total, message| {
                let store = progress_store.clone();
                Box::pin(async move {
                    if let Err(e) = store
                        .update_progress(file_id, current as i64, total as i64, &message)
                        .await
                    {
                        warn!(job = file_id, error = %e, "progress write failed");
                    }
                })
            }),
            stats: Arc::new(move |stats| {
                let store = stats_store.clone();
                Box::pin(async move {
                    if let Err(e) = store.update_stats(file_id, &stats).await {
                        warn!(job = file_id, error = %e, "stats write failed");
                    }
                })
            }),
        };

        // Step 5: run the plugin.
        let chunks = plugin.ingest(source, params, &ctx).await?;

        // Step 6: cancellation checkpoint before any vector-store write.
        match self.store.file_status(file_id).await {
            Ok(FileStatus::Cancelled) => {
                info!(job = file_id, "job cancelled during processing, discarding output");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                return Err(IngestError::at("upsert", "LookupError", e.to_string()));
            }
        }

        // Step 7: embed and upsert as one batch.
        let embed_started = Utc::now();
        let uuid = collection.vector_store_uuid.clone().ok_or_else(|| {
            IngestError::at("upsert", "ConfigError", "collection has no vector store")
        })?;

        let embedder = Embedder::from_config(Arc::clone(&self.pool), embeddings)
            .map_err(|e| IngestError::at("embedding", "ConfigError", e.to_string()))?;

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let mut embeddings_out: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH) {
            let batch_embeddings = embedder
                .embed_batch(batch)
                .await
                .map_err(|e| IngestError::at("embedding", "EmbeddingError", e.to_string()))?;
            embeddings_out.extend(batch_embeddings);
        }

        // Dimension lock: a mismatch means the embedding function changed
        // out from under the collection, which the contract forbids.
        if let Some(first) = embeddings_out.first() {
            if first.len() as i64 != collection.embedding_dimensions {
                return Err(IngestError::at(
                    "embedding",
                    "DimensionMismatch",
                    format!(
                        "embedding dimension {} does not match collection dimension {}",
                        first.len(),
                        collection.embedding_dimensions
                    ),
                ));
            }
        }

        let ids: Vec<String> = (0..chunks.len())
            .map(|index| format!("file_{file_id}_chunk_{index}"))
            .collect();
        let metadatas: Vec<Value> = chunks
            .iter()
            .map(|chunk| {
                let mut metadata = sanitize_metadata(chunk.metadata.clone());
                if let Some(map) = metadata.as_object_mut() {
                    map.insert("file_registry_id".to_owned(), json!(file_id));
                    map.insert("collection_id".to_owned(), json!(collection.id));
                }
                metadata
            })
            .collect();

        if !chunks.is_empty() {
            self.vector
                .upsert(&uuid, &ids, &embeddings_out, &texts, &metadatas)
                .await
                .map_err(|e| IngestError::at("upsert", "VectorStoreError", e.to_string()))?;
        }

        // Step 8: completion with final timing, progress, and stats.
        let document_count = chunks.len() as i64;
        self.store
            .mark_completed(
                file_id,
                document_count,
                &format!("Completed: {document_count} chunks"),
            )
            .await
            .map_err(|e| IngestError::at("finalize", "DatabaseError", e.to_string()))?;

        // The embedding stage is timed by the worker, not the plugin, so it
        // is appended to whatever stats the plugin reported.
        let embed_ms = (Utc::now() - embed_started).num_milliseconds();
        if let Ok(entry) = self.store.file_by_id(file_id).await {
            let mut stats: super::models::ProcessingStats = entry
                .processing_stats
                .and_then(|raw| serde_json::from_value(raw).ok())
                .unwrap_or_default();
            stats.stage_timings.push(StageTiming {
                stage: "embedding".to_owned(),
                duration_ms: embed_ms,
                message: format!("Embedded and upserted {document_count} chunks"),
                timestamp: Utc::now().to_rfc3339(),
            });
            if let Err(e) = self.store.update_stats(file_id, &stats).await {
                warn!(job = file_id, error = %e, "final stats write failed");
            }
        }

        info!(job = file_id, chunks = document_count, "ingestion job completed");
        Ok(())
    }
}

impl std::fmt::Debug for IngestionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionService")
            .field("static_root", &self.static_root)
            .finish_non_exhaustive()
    }
}

/// Vector-store metadata accepts scalars only; nested values are stored as
/// JSON strings.
fn sanitize_metadata(metadata: Value) -> Value {
    let Value::Object(map) = metadata else {
        return json!({});
    };
    Value::Object(
        map.into_iter()
            .map(|(key, value)| {
                let scalar = match value {
                    Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
                    other => other,
                };
                (key, scalar)
            })
            .collect(),
    )
}
