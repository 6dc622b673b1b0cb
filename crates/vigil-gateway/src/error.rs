use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;
use vigil_core::VigilError;

pub type ApiResult<T> = Result<T, ApiError>;

/// A [`VigilError`] rendered as `{error, kind}` with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub VigilError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            VigilError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            VigilError::NotFound(_) => StatusCode::NOT_FOUND,
            VigilError::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            VigilError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<VigilError> for ApiError {
    fn from(err: VigilError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, kind = self.0.kind(), "Request failed");
        }
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}
