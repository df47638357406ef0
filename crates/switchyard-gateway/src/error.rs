//! Error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use switchyard_core::error::{ErrorKind, SwitchyardError};

/// Non-standard status for requests the client abandoned.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// An error rendered as `{"kind": ..., "message": ...}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorKind::Authorization, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorKind::Validation, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, ErrorKind::Validation, message)
    }
}

/// HTTP status for an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Authorization => StatusCode::UNAUTHORIZED,
        ErrorKind::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::GuardrailBlocked => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::BackendRateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::BackendError | ErrorKind::Protocol => StatusCode::BAD_GATEWAY,
        ErrorKind::Cancelled => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<SwitchyardError> for ApiError {
    fn from(e: SwitchyardError) -> Self {
        let kind = e.kind();
        if kind == ErrorKind::Internal {
            error!(error = %e, "Internal error");
        }
        Self::new(status_for(kind), kind, e.public_message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "kind": self.kind,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::error::{BackendError, GuardrailOrigin};

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::QuotaExceeded), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(
            status_for(ErrorKind::GuardrailBlocked),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(ErrorKind::BackendTimeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::Cancelled).as_u16(), 499);
    }

    #[test]
    fn test_from_switchyard_error_hides_detail() {
        let err: ApiError = SwitchyardError::from(BackendError::from_http(503, "secret body")).into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.kind, ErrorKind::BackendUnavailable);
        assert!(!err.message.contains("secret"));

        let err: ApiError = SwitchyardError::GuardrailBlocked {
            origin: GuardrailOrigin::Standalone,
            details: vec!["pii".into()],
        }
        .into();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(!err.message.contains("pii"));
    }
}
