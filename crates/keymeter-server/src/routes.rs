//! REST routes over the usage service

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use keymeter_common::{
    AggregatedReport, BatchDeleteResult, ImportResult, Key, KeymeterError, MaskedKey,
};
use keymeter_engine::{PoolStats, UsageService};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<UsageService>,
}

/// Error body returned by every failing route
pub struct ApiError(KeymeterError);

impl From<KeymeterError> for ApiError {
    fn from(err: KeymeterError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            KeymeterError::NotFound(_) => StatusCode::NOT_FOUND,
            KeymeterError::Validation(_) | KeymeterError::DuplicateKey => StatusCode::BAD_REQUEST,
            other => {
                error!("Request failed: {}", other);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct AddKeyRequest {
    key: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BatchDeleteRequest {
    #[serde(default)]
    ids: Vec<String>,
}

/// Build the application router
pub fn router(service: Arc<UsageService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/data", get(get_report))
        .route("/api/keys", get(list_keys).post(add_key))
        .route("/api/keys/import", post(import_keys))
        .route("/api/keys/batch-delete", post(batch_delete_keys))
        .route("/api/keys/:id", axum::routing::delete(delete_key))
        .route("/api/keys/:id/full", get(get_full_key))
        .route("/api/pool/stats", get(pool_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { service })
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": keymeter_common::VERSION,
    }))
}

async fn get_report(State(state): State<AppState>) -> ApiResult<Json<AggregatedReport>> {
    Ok(Json(state.service.aggregated_report().await?))
}

async fn list_keys(State(state): State<AppState>) -> ApiResult<Json<Vec<MaskedKey>>> {
    Ok(Json(state.service.list_keys_masked().await?))
}

async fn add_key(
    State(state): State<AppState>,
    Json(req): Json<AddKeyRequest>,
) -> ApiResult<(StatusCode, Json<MaskedKey>)> {
    let key = state.service.add_key(&req.key, req.name.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(key.masked())))
}

async fn import_keys(
    State(state): State<AppState>,
    Json(req): Json<ImportRequest>,
) -> ApiResult<Json<ImportResult>> {
    if req.keys.is_empty() {
        return Err(KeymeterError::Validation("no keys provided".into()).into());
    }
    Ok(Json(state.service.import_keys(&req.keys).await?))
}

async fn get_full_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Key>> {
    Ok(Json(state.service.get_full_key(&id).await?))
}

async fn delete_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.service.delete_key(&id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn batch_delete_keys(
    State(state): State<AppState>,
    Json(req): Json<BatchDeleteRequest>,
) -> ApiResult<Json<BatchDeleteResult>> {
    if req.ids.is_empty() {
        return Err(KeymeterError::Validation("no ids provided".into()).into());
    }
    Ok(Json(state.service.batch_delete_keys(&req.ids).await?))
}

async fn pool_stats(State(state): State<AppState>) -> Json<PoolStats> {
    Json(state.service.pool_stats())
}
