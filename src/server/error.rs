//! HTTP mapping of workspace errors

use crate::workspace::WorkspaceError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("Missing x-session-id header")]
    MissingSessionHeader,

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingSessionHeader | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Workspace(err) => match err {
                WorkspaceError::PathEscape { .. }
                | WorkspaceError::CloneFailed { .. }
                | WorkspaceError::ArchiveFailed { .. } => StatusCode::BAD_REQUEST,
                WorkspaceError::SessionNotFound(_)
                | WorkspaceError::RepoNotFound { .. }
                | WorkspaceError::NothingToExport { .. } => StatusCode::NOT_FOUND,
                WorkspaceError::TeardownPartialFailure { .. }
                | WorkspaceError::Io { .. }
                | WorkspaceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            debug!("Request rejected ({}): {}", status, self);
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (WorkspaceError::path_escape(".."), StatusCode::BAD_REQUEST),
            (WorkspaceError::clone_failed("nope"), StatusCode::BAD_REQUEST),
            (WorkspaceError::archive_failed("bad"), StatusCode::BAD_REQUEST),
            (
                WorkspaceError::SessionNotFound("s".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                WorkspaceError::NothingToExport {
                    repo_name: "r".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                WorkspaceError::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
        assert_eq!(
            ApiError::MissingSessionHeader.status(),
            StatusCode::BAD_REQUEST
        );
    }
}
