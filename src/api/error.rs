use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::error;

use crate::backup::manager::ManagerError;
use crate::storage::StorageError;

/// Error body returned by every endpoint: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        let status = match &err {
            ManagerError::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            ManagerError::Storage(StorageError::EmptyName | StorageError::LastProfile) => {
                StatusCode::BAD_REQUEST
            }
            ManagerError::Storage(StorageError::Io { .. } | StorageError::Parse { .. }) => {
                error!("Settings storage failed: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ManagerError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ManagerError::Busy => StatusCode::CONFLICT,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ManagerError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
