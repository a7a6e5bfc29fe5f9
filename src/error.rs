use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum RjError {
    #[error("no downloader available: {0}")]
    DependencyMissing(String),

    #[error("{program} exited with status {exit_code:?}: {stderr}")]
    Process {
        program: String,
        args: Vec<String>,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("render failed: {0}")]
    Render(String),

    #[error("tts failed: {0}")]
    Tts(String),

    #[error("unsupported tts payload (keys seen: {})", keys_seen.join(", "))]
    TtsUnsupportedPayload { keys_seen: Vec<String> },

    #[error("commentary failed: {0}")]
    Commentary(String),

    #[error("invalid catalog: {0}")]
    CatalogInvalid(String),

    #[error("unknown segment: {0}")]
    QueueMiss(String),

    #[error("timeline rebuild failed: {0}")]
    SchedulerRebuild(String),

    #[error("publisher exited with code {0:?}")]
    PublisherExited(Option<i32>),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for RjError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            RjError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            RjError::CatalogInvalid(msg) => {
                (StatusCode::BAD_REQUEST, format!("invalid catalog: {}", msg))
            }
            RjError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            RjError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            RjError::QueueMiss(id) => (StatusCode::NOT_FOUND, format!("unknown segment: {}", id)),
            RjError::Http(e) => {
                tracing::error!("Upstream HTTP error: {:?}", e);
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
            other => {
                tracing::error!("Internal error: {:?}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        };

        let body = Json(json!({
            "ok": false,
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, RjError>;
