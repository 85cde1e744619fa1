use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use isoforge_service::ServiceError;
use std::fmt;

pub type RpcResult<T> = Result<T, RpcError>;

#[derive(Debug)]
pub enum RpcError {
    NotFound(String),
    InvalidRequest(String),
    /// The build exists but cannot serve the request in its current state
    NotReady(String),
    InternalError(String),
}

impl RpcError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RpcError::NotFound(_) => StatusCode::NOT_FOUND,
            RpcError::InvalidRequest(_) | RpcError::NotReady(_) => StatusCode::BAD_REQUEST,
            RpcError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::NotFound(msg) => write!(f, "Not found: {}", msg),
            RpcError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            RpcError::NotReady(msg) => write!(f, "Not ready: {}", msg),
            RpcError::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<ServiceError> for RpcError {
    fn from(err: ServiceError) -> Self {
        match &err {
            ServiceError::NotFound(_) | ServiceError::ArtifactMissing { .. } => {
                RpcError::NotFound(err.to_string())
            }
            ServiceError::Validation(_) => RpcError::InvalidRequest(err.to_string()),
            ServiceError::NotReady { .. } => RpcError::NotReady(err.to_string()),
            ServiceError::Workspace { .. } | ServiceError::Config(_) | ServiceError::IoError(_) => {
                RpcError::InternalError(err.to_string())
            }
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
