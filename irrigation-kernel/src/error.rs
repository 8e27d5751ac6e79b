use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Caller-input errors of the state manager. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Invalid mode '{0}'. Must be \"automatic\", \"manual\" or \"ai\"")]
    InvalidMode(String),
    #[error("Pump is already running")]
    AlreadyRunning,
    #[error("Pump is not running")]
    NotRunning,
    #[error("Cannot manually start pump in AI mode")]
    ModeConflict,
    #[error("Invalid pump duration {secs}s (must be between 1 and {max}s)")]
    InvalidDuration { secs: u64, max: u64 },
}

impl ControlError {
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::InvalidMode(_) => "invalid_mode",
            ControlError::AlreadyRunning => "already_running",
            ControlError::NotRunning => "not_running",
            ControlError::ModeConflict => "mode_conflict",
            ControlError::InvalidDuration { .. } => "invalid_duration",
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string(), "code": self.code() });
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}
