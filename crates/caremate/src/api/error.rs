//! Maps [`CareError`] onto HTTP responses of the form
//! `{ "error": <category>, "message": ... }`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, warn};

use crate::error::CareError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError(pub CareError);

impl From<CareError> for ApiError {
    fn from(e: CareError) -> Self {
        ApiError(e)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn status_for(err: &CareError) -> StatusCode {
    match err {
        CareError::NotFound { .. } => StatusCode::NOT_FOUND,
        CareError::Forbidden { .. } => StatusCode::FORBIDDEN,
        CareError::SessionArchived(_) => StatusCode::CONFLICT,
        CareError::InvalidTrigger { .. } | CareError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        CareError::ModelUnavailable(_) | CareError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        CareError::GenerationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        CareError::SummarizationFailed(_) | CareError::Persistence(_) | CareError::InvalidConfig(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let message = match &self.0 {
            // Storage details stay in the log.
            CareError::Persistence(detail) => {
                error!("Request failed on storage: {}", detail);
                "the request could not be stored or read".to_string()
            }
            other => {
                if status.is_server_error() {
                    warn!("Request failed: {}", other);
                }
                other.to_string()
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.category(),
                message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&CareError::NotFound { kind: "session", id: "x".into() }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_for(&CareError::SessionArchived("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&CareError::GenerationTimeout { stage: "slot_wait", waited_ms: 5 }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&CareError::invalid_trigger("25:00", "hour out of range")),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_persistence_details_are_hidden() {
        let response = ApiError(CareError::Persistence("disk I/O error at /secret/path".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
