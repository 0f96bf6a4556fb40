use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use fleet_core::error::{CoreError, ErrorKind};
use serde_json::json;

/// Uniform error envelope: `{"error": {"code", "message"}}` with the status
/// code derived from the taxonomy.
pub struct ApiError(pub CoreError);

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0.kind {
            ErrorKind::AuthRequired => StatusCode::UNAUTHORIZED,
            ErrorKind::AuthFailed => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::ServiceBusy => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.0.kind.to_string(),
                "message": self.0.message,
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(CoreError::from(err))
    }
}
