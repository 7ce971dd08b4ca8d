//! API error type and response mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error")]
    Internal(anyhow::Error),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "internal api error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<chengis_core::Error> for ApiError {
    fn from(e: chengis_core::Error) -> Self {
        match e {
            chengis_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            chengis_core::Error::Validation(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(anyhow::anyhow!(other)),
        }
    }
}

impl From<chengis_db::DbError> for ApiError {
    fn from(e: chengis_db::DbError) -> Self {
        match e {
            chengis_db::DbError::NotFound(msg) => ApiError::NotFound(msg),
            chengis_db::DbError::Conflict(msg) => ApiError::Conflict(msg),
            other => ApiError::Internal(anyhow::anyhow!(other)),
        }
    }
}
