use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::export::ExportSelection;
use crate::workspace::{Analysis, RenderedExport};
use axum::body::Bytes;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::header;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

pub const SESSION_HEADER: &str = "x-session-id";

/// Session id taken from the `x-session-id` header
pub struct SessionId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for SessionId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| SessionId(value.to_string()))
            .ok_or(ApiError::MissingSessionHeader)
    }
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub repo_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ArchiveQuery {
    pub file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub repo_name: String,
    #[serde(flatten)]
    pub selection: ExportSelection,
}

pub async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "API_URL": state.api_url }))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.manager.session_count().await;
    Json(json!({ "status": "ok", "sessions": sessions }))
}

pub async fn analyze(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    Json(request): Json<AnalyzeRequest>,
) -> ApiResult<Json<Analysis>> {
    let analysis = state.manager.analyze(&session_id, &request.repo_url).await?;
    Ok(Json(analysis))
}

pub async fn analyze_archive(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    Query(query): Query<ArchiveQuery>,
    body: Bytes,
) -> ApiResult<Json<Analysis>> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("Request body is empty".to_string()));
    }
    let analysis = state
        .manager
        .analyze_archive(&session_id, body, query.file_name.as_deref())
        .await?;
    Ok(Json(analysis))
}

pub async fn export_file(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    Json(request): Json<ExportRequest>,
) -> ApiResult<Response> {
    let export = render(&state, &session_id, request).await?;
    let disposition = format!("attachment; filename=\"{}\"", export.export_file);
    Ok((
        [
            (header::CONTENT_TYPE, "text/markdown; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        export.content,
    )
        .into_response())
}

pub async fn export_text(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    Json(request): Json<ExportRequest>,
) -> ApiResult<Json<RenderedExport>> {
    Ok(Json(render(&state, &session_id, request).await?))
}

async fn render(
    state: &AppState,
    session_id: &str,
    request: ExportRequest,
) -> ApiResult<RenderedExport> {
    Ok(state
        .manager
        .export(session_id, &request.repo_name, request.selection)
        .await?)
}
