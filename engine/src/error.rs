use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input from the caller. Nothing was changed.
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// ffmpeg failed. `diagnostics` is the last meaningful stderr line (already redacted).
    #[error("ffmpeg failed: {message}")]
    Process {
        message: String,
        diagnostics: Option<String>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn job_not_found(id: uuid::Uuid) -> Self {
        Self::NotFound(format!("job {id}"))
    }

    pub fn playlist_not_found(id: uuid::Uuid) -> Self {
        Self::NotFound(format!("playlist {id}"))
    }

    pub fn process(message: impl Into<String>, diagnostics: Option<String>) -> Self {
        Self::Process {
            message: message.into(),
            diagnostics,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Process { .. } => StatusCode::BAD_GATEWAY,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            Self::Process { diagnostics, .. } => json!({
                "ok": false,
                "error": self.to_string(),
                "diagnostics": diagnostics,
            }),
            _ => json!({"ok": false, "error": self.to_string()}),
        };
        (status, Json(body)).into_response()
    }
}
