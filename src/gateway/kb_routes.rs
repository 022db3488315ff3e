//! Knowledge-base HTTP handlers.
//!
//! Collections CRUD, the three ingestion entry points (file upload, URLs,
//! base), plugin-dispatched queries, file lifecycle, and the mode-gated
//! plugin catalogs. Ingestion endpoints return `200` with
//! `{file_registry_id, status: "processing"}` immediately; all subsequent
//! failure is captured into the job row.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::kb::models::{EmbeddingsConfig, FileStatus, Visibility};
use crate::kb::store::EmbeddingsChoice;

use super::{check_bearer, ApiError, AppState};

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

/// Body of `POST /collections`.
#[derive(Debug, Deserialize)]
pub struct CreateCollectionBody {
    /// Collection name (unique per owner).
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Owner identifier.
    pub owner: String,
    /// `private` (default) or `public`.
    #[serde(default)]
    pub visibility: Option<String>,
    /// Reference to a shared embeddings setup (current mode).
    #[serde(default)]
    pub embeddings_setup_id: Option<i64>,
    /// Inline embeddings configuration (legacy mode).
    #[serde(default)]
    pub embeddings_model: Option<EmbeddingsConfig>,
    /// Dimensionality, required with an inline config.
    #[serde(default)]
    pub embedding_dimensions: Option<i64>,
}

/// `POST /collections`.
pub async fn create_collection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateCollectionBody>,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;

    let visibility = match body.visibility.as_deref() {
        Some("public") => Visibility::Public,
        _ => Visibility::Private,
    };
    let embeddings = match (body.embeddings_setup_id, body.embeddings_model) {
        (Some(id), _) => EmbeddingsChoice::Setup(id),
        (None, Some(inline)) => EmbeddingsChoice::Inline(inline),
        (None, None) => {
            return Err(ApiError::Validation(
                "either embeddings_setup_id or embeddings_model is required".to_owned(),
            ))
        }
    };

    let collection = state
        .ingestion()
        .create_collection(
            &body.name,
            body.description.as_deref(),
            &body.owner,
            visibility,
            embeddings,
            body.embedding_dimensions,
        )
        .await?;

    Ok(Json(serde_json::to_value(&collection).unwrap_or(Value::Null)))
}

/// Query string of `GET /collections`.
#[derive(Debug, Deserialize)]
pub struct ListCollectionsQuery {
    /// Optional owner filter.
    #[serde(default)]
    pub owner: Option<String>,
}

/// `GET /collections`.
pub async fn list_collections(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListCollectionsQuery>,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;

    let collections = state
        .ingestion()
        .store()
        .list_collections(query.owner.as_deref())
        .await?;
    Ok(Json(json!({
        "total": collections.len(),
        "items": collections,
    })))
}

/// `GET /collections/{id}`.
pub async fn get_collection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;
    let collection = state.ingestion().store().collection_by_id(id).await?;
    Ok(Json(serde_json::to_value(&collection).unwrap_or(Value::Null)))
}

/// Body of `PUT /collections/{id}`.
#[derive(Debug, Deserialize)]
pub struct UpdateCollectionBody {
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// New visibility (`private` / `public`).
    #[serde(default)]
    pub visibility: Option<String>,
}

/// `PUT /collections/{id}` — description and visibility only; the
/// embedding function is immutable.
pub async fn update_collection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<UpdateCollectionBody>,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;

    let visibility = match body.visibility.as_deref() {
        None => None,
        Some("public") => Some(Visibility::Public),
        Some("private") => Some(Visibility::Private),
        Some(other) => {
            return Err(ApiError::Validation(format!("unknown visibility '{other}'")))
        }
    };

    let collection = state
        .ingestion()
        .store()
        .update_collection(id, body.description.as_deref(), visibility)
        .await?;
    Ok(Json(serde_json::to_value(&collection).unwrap_or(Value::Null)))
}

/// `DELETE /collections/{id}`.
pub async fn delete_collection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;
    state.ingestion().delete_collection(id).await?;
    Ok(Json(json!({"deleted": id})))
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// `POST /collections/{id}/ingest-file` (multipart: `file`, `plugin_name`,
/// `plugin_params` as a JSON string).
pub async fn ingest_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;

    let mut file: Option<(String, Vec<u8>, Option<String>)> = None;
    let mut plugin_name: Option<String> = None;
    let mut plugin_params = json!({});

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("multipart read error: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "file" => {
                let filename = field
                    .file_name()
                    .map(ToOwned::to_owned)
                    .ok_or_else(|| ApiError::Validation("file part has no filename".to_owned()))?;
                let content_type = field.content_type().map(ToOwned::to_owned);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Validation(format!("file read error: {e}")))?;
                file = Some((filename, bytes.to_vec(), content_type));
            }
            "plugin_name" => {
                plugin_name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::Validation(e.to_string()))?,
                );
            }
            "plugin_params" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Validation(e.to_string()))?;
                plugin_params = serde_json::from_str(&raw)
                    .map_err(|e| ApiError::Validation(format!("invalid plugin_params: {e}")))?;
            }
            _ => {}
        }
    }

    let (filename, bytes, content_type) =
        file.ok_or_else(|| ApiError::Validation("missing 'file' part".to_owned()))?;
    let plugin_name =
        plugin_name.ok_or_else(|| ApiError::Validation("missing 'plugin_name'".to_owned()))?;

    let file_registry_id = state
        .ingestion()
        .create_file_job(
            id,
            &filename,
            &bytes,
            content_type.as_deref(),
            &plugin_name,
            plugin_params,
        )
        .await?;

    info!(collection = id, job = file_registry_id, "file ingestion accepted");
    Ok(Json(json!({
        "file_registry_id": file_registry_id,
        "status": "processing",
    })))
}

/// Body of the URL-shaped ingestion endpoints.
#[derive(Debug, Deserialize)]
pub struct IngestUrlBody {
    /// URLs to ingest (`url` singular also accepted).
    #[serde(default)]
    pub urls: Vec<String>,
    /// Single-URL convenience field.
    #[serde(default)]
    pub url: Option<String>,
    /// Single-video convenience field.
    #[serde(default)]
    pub video_url: Option<String>,
    /// Plugin to run.
    pub plugin_name: String,
    /// Plugin parameters.
    #[serde(default)]
    pub plugin_params: Value,
}

impl IngestUrlBody {
    fn all_urls(&self) -> Vec<String> {
        let mut urls = self.urls.clone();
        if let Some(url) = &self.url {
            urls.push(url.clone());
        }
        if let Some(url) = &self.video_url {
            urls.push(url.clone());
        }
        urls
    }
}

/// `POST /collections/{id}/ingest-url`.
pub async fn ingest_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<IngestUrlBody>,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;

    let params = if body.plugin_params.is_null() {
        json!({})
    } else {
        body.plugin_params.clone()
    };
    let file_registry_id = state
        .ingestion()
        .create_url_job(id, body.all_urls(), &body.plugin_name, params)
        .await?;

    Ok(Json(json!({
        "file_registry_id": file_registry_id,
        "status": "processing",
    })))
}

/// `POST /collections/{id}/ingest-base` — mirrors `ingest-url` for plugins
/// that take non-file sources (video transcripts and similar).
pub async fn ingest_base(
    state: State<AppState>,
    headers: HeaderMap,
    path: Path<i64>,
    body: Json<IngestUrlBody>,
) -> Result<Json<Value>, ApiError> {
    ingest_url(state, headers, path, body).await
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Body of `POST /collections/{id}/query`.
#[derive(Debug, Deserialize)]
pub struct QueryBody {
    /// The query text.
    pub query_text: String,
    /// Result count override.
    #[serde(default)]
    pub top_k: Option<u32>,
    /// Similarity floor override.
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Query plugin override.
    #[serde(default)]
    pub plugin_name: Option<String>,
    /// Additional plugin parameters.
    #[serde(default)]
    pub plugin_params: Value,
}

/// `POST /collections/{id}/query`.
pub async fn query_collection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<QueryBody>,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;

    let mut params = if body.plugin_params.is_object() {
        body.plugin_params.clone()
    } else {
        json!({})
    };
    if let Some(map) = params.as_object_mut() {
        if let Some(top_k) = body.top_k {
            map.insert("top_k".to_owned(), json!(top_k));
        }
        if let Some(threshold) = body.threshold {
            map.insert("threshold".to_owned(), json!(threshold));
        }
    }

    let hits = state
        .query()
        .query(id, &body.query_text, body.plugin_name.as_deref(), params)
        .await?;

    Ok(Json(json!({
        "count": hits.len(),
        "results": hits,
    })))
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// `GET /collections/{id}/files`.
pub async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;

    // 404 for unknown collections rather than an empty listing.
    state.ingestion().store().collection_by_id(id).await?;
    let files = state.ingestion().store().list_files(id).await?;
    let items: Vec<Value> = files.iter().map(|f| f.to_job_json()).collect();
    Ok(Json(json!({"total": items.len(), "items": items})))
}

/// `GET /collections/{id}/files/{file_id}` — the registry row in job form.
pub async fn get_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((collection_id, file_id)): Path<(i64, i64)>,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;

    let entry = state.ingestion().store().file_by_id(file_id).await?;
    if entry.collection_id != collection_id {
        return Err(ApiError::NotFound("file not found in this collection".to_owned()));
    }
    Ok(Json(entry.to_job_json()))
}

/// Query string of `DELETE .../files/{file_id}`.
#[derive(Debug, Deserialize)]
pub struct DeleteFileQuery {
    /// Hard-delete the row and the stored file.
    #[serde(default)]
    pub hard: bool,
}

/// `DELETE /collections/{id}/files/{file_id}?hard=bool`.
pub async fn delete_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((collection_id, file_id)): Path<(i64, i64)>,
    Query(query): Query<DeleteFileQuery>,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;

    let entry = state.ingestion().store().file_by_id(file_id).await?;
    if entry.collection_id != collection_id {
        return Err(ApiError::NotFound("file not found in this collection".to_owned()));
    }

    state.ingestion().delete_file(file_id, query.hard).await?;
    Ok(Json(json!({"deleted": file_id, "hard": query.hard})))
}

/// Body of `PUT /files/{file_id}/status`.
#[derive(Debug, Deserialize)]
pub struct UpdateStatusBody {
    /// Target status.
    pub status: String,
}

/// `PUT /files/{file_id}/status` — external status transitions
/// (cancellation, manual correction), validated against the state machine.
pub async fn update_file_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(file_id): Path<i64>,
    Json(body): Json<UpdateStatusBody>,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;

    let status = FileStatus::parse(&body.status)
        .ok_or_else(|| ApiError::Validation(format!("unknown status '{}'", body.status)))?;
    let entry = state.ingestion().store().set_status(file_id, status).await?;
    Ok(Json(entry.to_job_json()))
}

// ---------------------------------------------------------------------------
// Plugin catalogs
// ---------------------------------------------------------------------------

/// `GET /ingestion-plugins`.
pub async fn list_ingestion_plugins(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;
    Ok(Json(json!({
        "plugins": state.ingestion().registry().ingest_catalog(),
    })))
}

/// `GET /query-plugins`.
pub async fn list_query_plugins(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;
    Ok(Json(json!({
        "plugins": state.ingestion().registry().query_catalog(),
    })))
}
