//! Analytics read-model handlers.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::analytics::Period;

use super::{check_bearer, ApiError, AppState};

/// Query string of the chats listing.
#[derive(Debug, Deserialize)]
pub struct ChatsQuery {
    /// Anonymize internal creator chats too (org policy).
    #[serde(default)]
    pub anonymize: bool,
}

/// `GET /v1/analytics/assistants/{id}/chats`.
pub async fn assistant_chats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<ChatsQuery>,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;

    let Some(analytics) = state.analytics() else {
        return Err(ApiError::NotFound(
            "analytics store is not configured".to_owned(),
        ));
    };

    let chats = analytics
        .chats_for_assistant(id, query.anonymize)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let stats = analytics
        .assistant_stats(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(json!({"stats": stats, "chats": chats})))
}

/// Query string of the timeline endpoint.
#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    /// Bucket granularity: `day`, `week`, or `month`.
    #[serde(default)]
    pub period: Option<String>,
}

/// `GET /v1/analytics/assistants/{id}/timeline`.
pub async fn assistant_timeline(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<Value>, ApiError> {
    check_bearer(&headers, &state.settings().api_key)?;

    let Some(analytics) = state.analytics() else {
        return Err(ApiError::NotFound(
            "analytics store is not configured".to_owned(),
        ));
    };

    let period = match query.period.as_deref() {
        None => Period::Day,
        Some(raw) => Period::parse(raw)
            .ok_or_else(|| ApiError::Validation(format!("unknown period '{raw}'")))?,
    };

    let timeline = analytics
        .timeline(id, period)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({"period": query.period.unwrap_or_else(|| "day".to_owned()), "timeline": timeline})))
}
