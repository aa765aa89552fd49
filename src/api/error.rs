use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::controller::ControllerError;
use crate::core::CoreError;
use crate::registry::RegistryError;
use crate::task::TaskError;

/// Error half of a handler result, rendered as `{"error": {...}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn registry_status(e: &RegistryError) -> StatusCode {
    match e {
        RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
        RegistryError::Conflict { .. } => StatusCode::CONFLICT,
        RegistryError::Invalid { .. } => StatusCode::BAD_REQUEST,
    }
}

fn controller_status(e: &ControllerError) -> StatusCode {
    match e {
        ControllerError::Validation(_) | ControllerError::NotRegistered(_) => StatusCode::BAD_REQUEST,
        ControllerError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let status = match &e {
            CoreError::Registry(e) | CoreError::Task(TaskError::Registry(e)) => registry_status(e),
            CoreError::Controller(e) | CoreError::Task(TaskError::Controller(e)) => controller_status(e),
            CoreError::Task(TaskError::Cycle(_)) => StatusCode::CONFLICT,
            CoreError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = self.status.as_u16(), error = %self.message, "request failed");
        }
        let body = json!({
            "error": {
                "code": self.status.as_u16(),
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}
