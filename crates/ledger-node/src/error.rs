use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Missing field: {0}")]
    MissingField(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Unknown mining job {0}")]
    UnknownJob(u64),
    #[error("Too many mining jobs in progress")]
    TooManyJobs,
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingField(_) | ApiError::InvalidTransaction(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownJob(_) => StatusCode::NOT_FOUND,
            ApiError::TooManyJobs => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(err) => {
                error!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}
