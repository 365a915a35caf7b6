use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use commons_types::error::MessagingError;

/// HTTP face of `MessagingError`.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub MessagingError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            MessagingError::Authorization => StatusCode::FORBIDDEN,
            MessagingError::NotFound(_) => StatusCode::NOT_FOUND,
            MessagingError::Validation(_) => StatusCode::BAD_REQUEST,
            MessagingError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(MessagingError::Storage(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            MessagingError::Storage(e) => {
                error!("storage failure: {:#}", e);
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
