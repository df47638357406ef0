use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error category, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authorization,
    QuotaExceeded,
    GuardrailBlocked,
    BackendTimeout,
    BackendUnavailable,
    BackendRateLimited,
    BackendError,
    Protocol,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Authorization => "authorization",
            Self::QuotaExceeded => "quota_exceeded",
            Self::GuardrailBlocked => "guardrail_blocked",
            Self::BackendTimeout => "backend_timeout",
            Self::BackendUnavailable => "backend_unavailable",
            Self::BackendRateLimited => "backend_rate_limited",
            Self::BackendError => "backend_error",
            Self::Protocol => "protocol",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a guardrail verdict came from.
///
/// Only standalone screening is raised as [`SwitchyardError::GuardrailBlocked`].
/// An inline intervention ends the turn normally with
/// `StopReason::GuardrailIntervened` and is charged, never returned as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailOrigin {
    /// Screening ran inside the inference call. Reported through the stop
    /// reason rather than an error.
    Inline,
    /// Screening ran as a separate pre-flight call.
    Standalone,
}

impl std::fmt::Display for GuardrailOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline => f.write_str("inline"),
            Self::Standalone => f.write_str("standalone"),
        }
    }
}

/// Failure class reported by an inference or guardrail backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Timeout,
    Unavailable,
    RateLimited,
    Error,
}

impl BackendStatus {
    /// Classify an HTTP status code returned by a backend.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            408 | 504 => Self::Timeout,
            502 | 503 => Self::Unavailable,
            429 => Self::RateLimited,
            _ => Self::Error,
        }
    }
}

/// Normalized backend failure. Vendor error bodies stay in `message`, which is
/// logged but never shown to callers.
#[derive(Debug, Clone, Error)]
#[error("backend {status:?}: {message}")]
pub struct BackendError {
    pub status: BackendStatus,
    pub message: String,
}

impl BackendError {
    pub fn new(status: BackendStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(BackendStatus::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(BackendStatus::Unavailable, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(BackendStatus::Error, message)
    }

    /// Build from a non-success HTTP response status and body.
    pub fn from_http(status: u16, body: &str) -> Self {
        Self::new(
            BackendStatus::from_http_status(status),
            format!("HTTP {status}: {body}"),
        )
    }
}

#[derive(Debug, Error)]
pub enum SwitchyardError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Quota exceeded for user {user_id}")]
    QuotaExceeded { user_id: String },

    #[error("Blocked by {origin} guardrail")]
    GuardrailBlocked {
        origin: GuardrailOrigin,
        details: Vec<String>,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SwitchyardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Self::GuardrailBlocked { .. } => ErrorKind::GuardrailBlocked,
            Self::Backend(e) => match e.status {
                BackendStatus::Timeout => ErrorKind::BackendTimeout,
                BackendStatus::Unavailable => ErrorKind::BackendUnavailable,
                BackendStatus::RateLimited => ErrorKind::BackendRateLimited,
                BackendStatus::Error => ErrorKind::BackendError,
            },
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) | Self::Storage(_) | Self::Io(_) | Self::Json(_) | Self::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Message safe to show to a caller. Internal details are replaced by a
    /// generic sentence; the full error goes to the log.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(msg) | Self::Authorization(msg) => msg.clone(),
            Self::QuotaExceeded { .. } => "Your usage budget is exhausted".into(),
            Self::GuardrailBlocked { origin, .. } => {
                format!("The request was blocked by the {origin} content guardrail")
            }
            Self::Backend(e) => match e.status {
                BackendStatus::Timeout => "The model backend timed out".into(),
                BackendStatus::Unavailable => "The model backend is unavailable".into(),
                BackendStatus::RateLimited => "The model backend is rate limiting requests".into(),
                BackendStatus::Error => "The model backend returned an error".into(),
            },
            Self::Cancelled => "The request was cancelled".into(),
            _ => "Internal error".into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SwitchyardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(BackendStatus::from_http_status(408), BackendStatus::Timeout);
        assert_eq!(BackendStatus::from_http_status(504), BackendStatus::Timeout);
        assert_eq!(BackendStatus::from_http_status(503), BackendStatus::Unavailable);
        assert_eq!(BackendStatus::from_http_status(502), BackendStatus::Unavailable);
        assert_eq!(BackendStatus::from_http_status(429), BackendStatus::RateLimited);
        assert_eq!(BackendStatus::from_http_status(400), BackendStatus::Error);
        assert_eq!(BackendStatus::from_http_status(500), BackendStatus::Error);
    }

    #[test]
    fn test_backend_kind() {
        let err: SwitchyardError = BackendError::from_http(503, "down").into();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(err.kind().as_str(), "backend_unavailable");
    }

    #[test]
    fn test_public_message_hides_internals() {
        let err = SwitchyardError::Storage("/var/lib/switchyard/budgets.json: EACCES".into());
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.public_message(), "Internal error");

        let err: SwitchyardError = BackendError::from_http(429, "{\"secret\":\"x\"}").into();
        assert!(!err.public_message().contains("secret"));
    }

    #[test]
    fn test_guardrail_message_names_origin() {
        let err = SwitchyardError::GuardrailBlocked {
            origin: GuardrailOrigin::Standalone,
            details: vec![],
        };
        assert_eq!(err.kind(), ErrorKind::GuardrailBlocked);
        assert!(err.public_message().contains("standalone"));
    }
}
