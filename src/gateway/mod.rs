//! HTTP surface: the OpenAI-compatible chat gateway plus the embedded
//! knowledge-base API, served from one axum router.
//!
//! Authentication is a single process-level bearer key; all organization
//! and user authorization happens inside the assistant and sharing
//! services.

pub mod analytics_routes;
pub mod completions;
pub mod kb_routes;

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;

use crate::analytics::AnalyticsService;
use crate::assistant::executor::AssistantExecutor;
use crate::assistant::store::AssistantStore;
use crate::assistant::AssistantError;
use crate::config::Settings;
use crate::kb::ingestion::IngestionService;
use crate::kb::query::QueryService;
use crate::kb::KbError;
use crate::org::resolver::ConfigResolver;
use crate::providers::probe::StatusProbe;
use crate::tools::ToolRegistry;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    settings: Settings,
    executor: AssistantExecutor,
    assistants: AssistantStore,
    ingestion: IngestionService,
    query: QueryService,
    tools: Arc<ToolRegistry>,
    analytics: Option<AnalyticsService>,
    resolver: ConfigResolver,
    probe: StatusProbe,
}

impl AppState {
    /// Bundle the services into shared state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        executor: AssistantExecutor,
        assistants: AssistantStore,
        ingestion: IngestionService,
        query: QueryService,
        tools: Arc<ToolRegistry>,
        analytics: Option<AnalyticsService>,
        resolver: ConfigResolver,
        probe: StatusProbe,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                settings,
                executor,
                assistants,
                ingestion,
                query,
                tools,
                analytics,
                resolver,
                probe,
            }),
        }
    }

    /// Process settings.
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Assistant executor.
    pub fn executor(&self) -> &AssistantExecutor {
        &self.inner.executor
    }

    /// Assistant store.
    pub fn assistants(&self) -> &AssistantStore {
        &self.inner.assistants
    }

    /// Ingestion service.
    pub fn ingestion(&self) -> &IngestionService {
        &self.inner.ingestion
    }

    /// Query service.
    pub fn query(&self) -> &QueryService {
        &self.inner.query
    }

    /// Tool registry.
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.inner.tools
    }

    /// Analytics read model, when the external chat store is configured.
    pub fn analytics(&self) -> Option<&AnalyticsService> {
        self.inner.analytics.as_ref()
    }

    /// Organization config resolver.
    pub fn resolver(&self) -> &ConfigResolver {
        &self.inner.resolver
    }

    /// Provider status probe.
    pub fn probe(&self) -> &StatusProbe {
        &self.inner.probe
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// HTTP-facing error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 401 — bad or missing API key.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// 403 — authenticated but not allowed.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// 404 — unknown assistant / collection / file / plugin.
    #[error("not found: {0}")]
    NotFound(String),
    /// 400 — malformed request.
    #[error("validation error: {0}")]
    Validation(String),
    /// 500 — unknown invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({"error": self.to_string()}));
        (status, body).into_response()
    }
}

impl From<AssistantError> for ApiError {
    fn from(err: AssistantError) -> Self {
        match err {
            AssistantError::NotFound => Self::NotFound("assistant not found".to_owned()),
            AssistantError::Forbidden(message) => Self::Forbidden(message),
            AssistantError::InvalidName(message) => Self::Validation(message),
            AssistantError::Database(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<KbError> for ApiError {
    fn from(err: KbError) -> Self {
        match err {
            KbError::NotFound { entity } => Self::NotFound(format!("{entity} not found")),
            KbError::UnknownPlugin(name) => Self::NotFound(format!("unknown plugin: {name}")),
            KbError::Validation(message) => Self::Validation(message),
            KbError::Database(e) => Self::Internal(e.to_string()),
            KbError::VectorStore(message) | KbError::Embedding(message) | KbError::Storage(message) => {
                Self::Internal(message)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Verify the process-level bearer key.
///
/// # Errors
///
/// Returns [`ApiError::Unauthorized`] for a missing or wrong key.
pub fn check_bearer(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("no API key provided".to_owned()))?;

    let token = header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| ApiError::Unauthorized("invalid Authorization header".to_owned()))?;

    if token != expected {
        return Err(ApiError::Unauthorized("invalid API key".to_owned()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Chat surface.
        .route("/status", get(completions::status))
        .route("/v1/models", get(completions::list_models))
        .route("/models", get(completions::list_models))
        .route("/v1/chat/completions", post(completions::chat_completions))
        .route("/chat/completions", post(completions::chat_completions))
        // Knowledge-base surface.
        .route("/collections", post(kb_routes::create_collection))
        .route("/collections", get(kb_routes::list_collections))
        .route("/collections/{id}", get(kb_routes::get_collection))
        .route("/collections/{id}", put(kb_routes::update_collection))
        .route("/collections/{id}", delete(kb_routes::delete_collection))
        .route("/collections/{id}/ingest-file", post(kb_routes::ingest_file))
        .route("/collections/{id}/ingest-url", post(kb_routes::ingest_url))
        .route("/collections/{id}/ingest-base", post(kb_routes::ingest_base))
        .route("/collections/{id}/query", post(kb_routes::query_collection))
        .route("/collections/{id}/files", get(kb_routes::list_files))
        .route("/collections/{id}/files/{file_id}", get(kb_routes::get_file))
        .route(
            "/collections/{id}/files/{file_id}",
            delete(kb_routes::delete_file),
        )
        .route("/files/{file_id}/status", put(kb_routes::update_file_status))
        .route("/ingestion-plugins", get(kb_routes::list_ingestion_plugins))
        .route("/query-plugins", get(kb_routes::list_query_plugins))
        .route("/tools", get(completions::list_tools))
        // Admin surface.
        .route(
            "/v1/admin/provider-status",
            get(completions::provider_status),
        )
        // Analytics read model.
        .route(
            "/v1/analytics/assistants/{id}/chats",
            get(analytics_routes::assistant_chats),
        )
        .route(
            "/v1/analytics/assistants/{id}/timeline",
            get(analytics_routes::assistant_timeline),
        )
        .with_state(state)
}
