//! SQLite persistence for collections, embeddings setups, and the file
//! registry.
//!
//! The file registry row is the single source of truth for an ingestion
//! job. Only the background worker writes to a job row while it runs;
//! status readers may observe eventual but never stale-beyond-one-write
//! values. Cancellation flips the status field and is honoured
//! cooperatively by the worker.

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use super::models::{
    Collection, EmbeddingsConfig, EmbeddingsSetup, FileEntry, FileStatus, ProcessingStats,
    Visibility,
};
use super::KbError;

/// Cap on the short error message column.
const ERROR_MESSAGE_MAX: usize = 500;

/// Cap on the captured traceback inside `error_details`.
const ERROR_TRACE_MAX: usize = 2000;

/// Cap on the failure fragment echoed into `progress_message`.
const PROGRESS_ERROR_MAX: usize = 100;

/// Reference to a collection's embeddings configuration at creation time.
#[derive(Debug, Clone)]
pub enum EmbeddingsChoice {
    /// Reference a shared setup (current mode).
    Setup(i64),
    /// Inline configuration (legacy mode).
    Inline(EmbeddingsConfig),
}

/// Store for knowledge-base rows.
#[derive(Debug, Clone)]
pub struct KbStore {
    pool: SqlitePool,
}

impl KbStore {
    /// Wrap a pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // -- embeddings setups --------------------------------------------------

    /// Create a shared embeddings setup.
    ///
    /// # Errors
    ///
    /// Returns a database error on conflict or failure.
    pub async fn create_setup(&self, setup: &EmbeddingsSetup) -> Result<i64, KbError> {
        let result = sqlx::query(
            "INSERT INTO embeddings_setups (name, vendor, model, api_key, api_endpoint, dimensions) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&setup.name)
        .bind(&setup.vendor)
        .bind(&setup.model)
        .bind(&setup.api_key)
        .bind(&setup.api_endpoint)
        .bind(setup.dimensions)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Fetch a setup by id.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::NotFound`] when missing.
    pub async fn setup_by_id(&self, id: i64) -> Result<EmbeddingsSetup, KbError> {
        let row = sqlx::query(
            "SELECT id, name, vendor, model, api_key, api_endpoint, dimensions \
             FROM embeddings_setups WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| EmbeddingsSetup {
            id: row.get("id"),
            name: row.get("name"),
            vendor: row.get("vendor"),
            model: row.get("model"),
            api_key: row.get("api_key"),
            api_endpoint: row.get("api_endpoint"),
            dimensions: row.get("dimensions"),
        })
        .ok_or(KbError::NotFound {
            entity: "embeddings setup",
        })
    }

    // -- collections --------------------------------------------------------

    /// Create a collection. The embedding function and dimensions are
    /// locked at creation.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::Validation`] when `(name, owner)` is taken.
    pub async fn create_collection(
        &self,
        name: &str,
        description: Option<&str>,
        owner: &str,
        visibility: Visibility,
        embeddings: &EmbeddingsChoice,
        dimensions: i64,
        vector_store_uuid: &str,
    ) -> Result<i64, KbError> {
        let (setup_id, inline_json) = match embeddings {
            EmbeddingsChoice::Setup(id) => (Some(*id), None),
            EmbeddingsChoice::Inline(config) => (
                None,
                Some(serde_json::to_string(config).map_err(|e| KbError::Validation(e.to_string()))?),
            ),
        };

        let result = sqlx::query(
            "INSERT INTO collections \
             (name, description, owner, visibility, embeddings_setup_id, embeddings_model, \
              embedding_dimensions, vector_store_uuid) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(name)
        .bind(description)
        .bind(owner)
        .bind(visibility.as_str())
        .bind(setup_id)
        .bind(inline_json)
        .bind(dimensions)
        .bind(vector_store_uuid)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(KbError::Validation(
                format!("collection '{name}' already exists for this owner"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a collection by id.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::NotFound`] when missing.
    pub async fn collection_by_id(&self, id: i64) -> Result<Collection, KbError> {
        let row = sqlx::query(
            "SELECT id, name, description, owner, visibility, embeddings_setup_id, \
                    embeddings_model, embedding_dimensions, vector_store_uuid, created_at \
             FROM collections WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_collection).ok_or(KbError::NotFound {
            entity: "collection",
        })
    }

    /// List collections, optionally filtered by owner.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn list_collections(&self, owner: Option<&str>) -> Result<Vec<Collection>, KbError> {
        let rows = match owner {
            Some(owner) => {
                sqlx::query(
                    "SELECT id, name, description, owner, visibility, embeddings_setup_id, \
                            embeddings_model, embedding_dimensions, vector_store_uuid, created_at \
                     FROM collections WHERE owner = ?1 ORDER BY id",
                )
                .bind(owner)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, name, description, owner, visibility, embeddings_setup_id, \
                            embeddings_model, embedding_dimensions, vector_store_uuid, created_at \
                     FROM collections ORDER BY id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(row_to_collection).collect())
    }

    /// Update a collection's mutable fields (description, visibility). The
    /// embedding function and dimensions are immutable by contract.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::NotFound`] when missing.
    pub async fn update_collection(
        &self,
        id: i64,
        description: Option<&str>,
        visibility: Option<Visibility>,
    ) -> Result<Collection, KbError> {
        let current = self.collection_by_id(id).await?;
        let description = description.or(current.description.as_deref());
        let visibility = visibility.unwrap_or(current.visibility);

        sqlx::query("UPDATE collections SET description = ?1, visibility = ?2 WHERE id = ?3")
            .bind(description)
            .bind(visibility.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.collection_by_id(id).await
    }

    /// Delete a collection row (files cascade).
    ///
    /// # Errors
    ///
    /// Returns [`KbError::NotFound`] when missing.
    pub async fn delete_collection(&self, id: i64) -> Result<(), KbError> {
        let result = sqlx::query("DELETE FROM collections WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(KbError::NotFound {
                entity: "collection",
            });
        }
        Ok(())
    }

    /// Resolve a collection's effective embeddings configuration.
    ///
    /// DUAL MODE: the setup reference wins; legacy inline JSON remains
    /// readable for collections created before shared setups existed.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::Validation`] when the collection has neither.
    pub async fn effective_embeddings(
        &self,
        collection: &Collection,
    ) -> Result<EmbeddingsConfig, KbError> {
        if let Some(setup_id) = collection.embeddings_setup_id {
            let setup = self.setup_by_id(setup_id).await?;
            return Ok(EmbeddingsConfig::from(&setup));
        }
        collection.inline_embeddings.clone().ok_or_else(|| {
            KbError::Validation(format!(
                "collection {} has no embeddings configuration",
                collection.id
            ))
        })
    }

    /// Update the stored API key for every legacy collection of an owner
    /// and vendor. Returns the number of rows touched.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn bulk_update_embeddings_api_key(
        &self,
        owner: &str,
        vendor: &str,
        new_key: &str,
    ) -> Result<u64, KbError> {
        let collections = self.list_collections(Some(owner)).await?;
        let mut touched = 0u64;

        for collection in collections {
            let Some(mut inline) = collection.inline_embeddings else {
                continue;
            };
            if !inline.vendor.eq_ignore_ascii_case(vendor) {
                continue;
            }
            inline.api_key = Some(new_key.to_owned());
            let json =
                serde_json::to_string(&inline).map_err(|e| KbError::Validation(e.to_string()))?;
            sqlx::query("UPDATE collections SET embeddings_model = ?1 WHERE id = ?2")
                .bind(json)
                .bind(collection.id)
                .execute(&self.pool)
                .await?;
            touched += 1;
        }

        Ok(touched)
    }

    // -- file registry: creation & reads ------------------------------------

    /// Insert a file registry row. Jobs are created directly in
    /// `processing` so the synchronous creation path can return
    /// `{file_registry_id, status: "processing"}` immediately.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_file(
        &self,
        collection_id: i64,
        owner: &str,
        original_filename: &str,
        file_path: &str,
        file_url: &str,
        file_size: i64,
        content_type: Option<&str>,
        plugin_name: &str,
        plugin_params: &Value,
    ) -> Result<i64, KbError> {
        let params_json = plugin_params.to_string();
        let result = sqlx::query(
            "INSERT INTO file_registry \
             (collection_id, owner, original_filename, file_path, file_url, file_size, \
              content_type, plugin_name, plugin_params, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'processing')",
        )
        .bind(collection_id)
        .bind(owner)
        .bind(original_filename)
        .bind(file_path)
        .bind(file_url)
        .bind(file_size)
        .bind(content_type)
        .bind(plugin_name)
        .bind(params_json)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Fetch a file entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::NotFound`] when missing.
    pub async fn file_by_id(&self, id: i64) -> Result<FileEntry, KbError> {
        let row = sqlx::query("SELECT * FROM file_registry WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_file).ok_or(KbError::NotFound { entity: "file" })
    }

    /// Current status of a job (cheap cancellation check for the worker).
    ///
    /// # Errors
    ///
    /// Returns [`KbError::NotFound`] when missing.
    pub async fn file_status(&self, id: i64) -> Result<FileStatus, KbError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM file_registry WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        status
            .and_then(|s| FileStatus::parse(&s))
            .ok_or(KbError::NotFound { entity: "file" })
    }

    /// List a collection's files, excluding soft-deleted entries.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn list_files(&self, collection_id: i64) -> Result<Vec<FileEntry>, KbError> {
        let rows = sqlx::query(
            "SELECT * FROM file_registry WHERE collection_id = ?1 AND status != 'deleted' \
             ORDER BY id",
        )
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_file).collect())
    }

    // -- file registry: worker writes ---------------------------------------

    /// Stamp `processing_started_at` when the worker picks the job up.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn mark_processing_started(&self, id: i64) -> Result<(), KbError> {
        sqlx::query(
            "UPDATE file_registry SET status = 'processing', processing_started_at = ?1, \
             updated_at = ?1 WHERE id = ?2 AND status != 'cancelled'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write a progress snapshot.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn update_progress(
        &self,
        id: i64,
        current: i64,
        total: i64,
        message: &str,
    ) -> Result<(), KbError> {
        sqlx::query(
            "UPDATE file_registry SET progress_current = ?1, progress_total = ?2, \
             progress_message = ?3, updated_at = ?4 WHERE id = ?5 AND status != 'cancelled'",
        )
        .bind(current)
        .bind(total)
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        debug!(job = id, current, total, "progress updated");
        Ok(())
    }

    /// Persist interim processing stats so the UI sees stages as they
    /// complete. Skipped when the job has been cancelled meanwhile.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn update_stats(&self, id: i64, stats: &ProcessingStats) -> Result<(), KbError> {
        let json = serde_json::to_string(stats).map_err(|e| KbError::Validation(e.to_string()))?;
        sqlx::query(
            "UPDATE file_registry SET processing_stats = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status != 'cancelled'",
        )
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a job completed with its final counts and progress snapshot.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn mark_completed(
        &self,
        id: i64,
        document_count: i64,
        message: &str,
    ) -> Result<(), KbError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE file_registry SET status = 'completed', document_count = ?1, \
             processing_completed_at = ?2, updated_at = ?2, \
             progress_current = progress_total, progress_message = ?3 WHERE id = ?4",
        )
        .bind(document_count)
        .bind(&now)
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Capture a failure into the job row. Never raises out of the worker:
    /// truncates the message to 500 chars, the trace to its last 2000, and
    /// echoes the first 100 into `progress_message`.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn mark_failed(
        &self,
        id: i64,
        error_message: &str,
        error_kind: &str,
        trace: &str,
        file_path: &str,
        plugin_name: &str,
        stage: &str,
    ) -> Result<(), KbError> {
        let short: String = error_message.chars().take(ERROR_MESSAGE_MAX).collect();
        let trace_tail: String = {
            let chars: Vec<char> = trace.chars().collect();
            let start = chars.len().saturating_sub(ERROR_TRACE_MAX);
            chars[start..].iter().collect()
        };
        let details = serde_json::json!({
            "exception_type": error_kind,
            "traceback": trace_tail,
            "file_path": file_path,
            "plugin_name": plugin_name,
            "stage": stage,
        });
        let progress: String = error_message.chars().take(PROGRESS_ERROR_MAX).collect();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "UPDATE file_registry SET status = 'failed', error_message = ?1, error_details = ?2, \
             processing_completed_at = ?3, updated_at = ?3, progress_message = ?4 \
             WHERE id = ?5 AND status != 'cancelled'",
        )
        .bind(short)
        .bind(details.to_string())
        .bind(&now)
        .bind(format!("Failed: {progress}"))
        .bind(id)
        .execute(&self.pool)
        .await?;

        warn!(job = id, stage, "ingestion job failed");
        Ok(())
    }

    // -- file registry: external transitions --------------------------------

    /// Apply a status transition requested from outside the worker
    /// (cancellation, soft delete, manual correction), validated against
    /// the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::Validation`] for illegal transitions.
    pub async fn set_status(&self, id: i64, next: FileStatus) -> Result<FileEntry, KbError> {
        let entry = self.file_by_id(id).await?;
        if !entry.status.can_transition_to(next) {
            return Err(KbError::Validation(format!(
                "illegal status transition {} → {}",
                entry.status.as_str(),
                next.as_str()
            )));
        }

        let now = Utc::now().to_rfc3339();
        let completed_at = matches!(next, FileStatus::Completed | FileStatus::Failed | FileStatus::Cancelled)
            .then_some(now.clone());

        sqlx::query(
            "UPDATE file_registry SET status = ?1, updated_at = ?2, \
             processing_completed_at = COALESCE(?3, processing_completed_at) WHERE id = ?4",
        )
        .bind(next.as_str())
        .bind(&now)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.file_by_id(id).await
    }

    /// Hard-delete a file row.
    ///
    /// # Errors
    ///
    /// Returns a database error on failure.
    pub async fn delete_file_row(&self, id: i64) -> Result<(), KbError> {
        sqlx::query("DELETE FROM file_registry WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_collection(row: sqlx::sqlite::SqliteRow) -> Collection {
    let visibility: String = row.get("visibility");
    let inline_raw: Option<String> = row.get("embeddings_model");
    let inline_embeddings = inline_raw.and_then(|raw| {
        serde_json::from_str(&raw)
            .map_err(|e| warn!(error = %e, "unparseable inline embeddings config"))
            .ok()
    });

    Collection {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        owner: row.get("owner"),
        visibility: Visibility::parse(&visibility),
        embeddings_setup_id: row.get("embeddings_setup_id"),
        inline_embeddings,
        embedding_dimensions: row.get("embedding_dimensions"),
        vector_store_uuid: row.get("vector_store_uuid"),
        created_at: row.get("created_at"),
    }
}

fn row_to_file(row: sqlx::sqlite::SqliteRow) -> FileEntry {
    let status: String = row.get("status");
    let params_raw: String = row.get("plugin_params");
    let error_details: Option<String> = row.get("error_details");
    let processing_stats: Option<String> = row.get("processing_stats");

    FileEntry {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        owner: row.get("owner"),
        original_filename: row.get("original_filename"),
        file_path: row.get("file_path"),
        file_url: row.get("file_url"),
        file_size: row.get("file_size"),
        content_type: row.get("content_type"),
        plugin_name: row.get("plugin_name"),
        plugin_params: serde_json::from_str(&params_raw).unwrap_or(Value::Null),
        status: FileStatus::parse(&status).unwrap_or(FileStatus::Pending),
        document_count: row.get("document_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        processing_started_at: row.get("processing_started_at"),
        processing_completed_at: row.get("processing_completed_at"),
        progress_current: row.get("progress_current"),
        progress_total: row.get("progress_total"),
        progress_message: row.get("progress_message"),
        error_message: row.get("error_message"),
        error_details: error_details.and_then(|raw| serde_json::from_str(&raw).ok()),
        processing_stats: processing_stats.and_then(|raw| serde_json::from_str(&raw).ok()),
    }
}
