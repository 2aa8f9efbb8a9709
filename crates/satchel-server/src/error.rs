use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use satchel_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Unknown, undecodable and unreadable handles all land here alike.
    #[error("Not found")]
    NotFound,

    #[error("Upload too large (max {max} bytes)")]
    TooLarge { max: u64 },

    #[error("Missing or invalid user id")]
    Unauthorized,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Collapse internal failures of the upload path into a generic answer.
    pub fn during_upload(self) -> Self {
        match self {
            ServerError::Internal(detail) => ServerError::UploadFailed(detail),
            other => other,
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServerError::NotFound,
            StoreError::TooLarge { max } => ServerError::TooLarge { max },
            StoreError::EmptyUpload => ServerError::BadRequest("Empty upload".to_string()),
            StoreError::InvalidGrant(what) => ServerError::BadRequest(what.to_string()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::TooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::UploadFailed(detail) => {
                error!(error = %detail, "upload failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Upload failed".to_string())
            }
            ServerError::Internal(detail) => {
                error!(error = %detail, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
