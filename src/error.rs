use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors that abort a pipeline run. Everything source-local is reported
/// through `SourceFailure` instead and never reaches this type.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Classification config error: {0}")]
    ClassificationConfig(String),

    #[error("Snapshot is corrupt: {0}")]
    SnapshotCorruption(String),

    #[error("Another run holds the snapshot lock")]
    SnapshotBusy,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the read-only HTTP API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Snapshot unavailable: {0}")]
    Snapshot(#[from] PipelineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Snapshot(PipelineError::SnapshotCorruption(msg)) => {
                tracing::error!("Snapshot corruption: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Snapshot is corrupt".to_string(),
                )
            }
            ApiError::Snapshot(e) => {
                tracing::error!("Snapshot load failed: {e}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Snapshot unavailable".to_string(),
                )
            }
        };

        let body = axum::Json(json!({ "error": message }));
        (status, body).into_response()
    }
}
