use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("missing multipart field `{0}`")]
    MissingInput(&'static str),
    #[error("invalid multipart upload: {0}")]
    Upload(#[from] MultipartError),
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match self {
            // Decode failures carry no body; the client only needs the status.
            ServiceError::Decode(ref reason) => {
                tracing::debug!(%reason, "rejecting undecodable upload");
                StatusCode::BAD_REQUEST.into_response()
            }
            ServiceError::MissingInput(_) => {
                let body = serde_json::json!({
                    "error": self.to_string(),
                });
                (StatusCode::BAD_REQUEST, axum::Json(body)).into_response()
            }
            // Oversized bodies keep axum's 413, malformed ones its 400.
            ServiceError::Upload(ref err) => {
                let body = serde_json::json!({
                    "error": err.body_text(),
                });
                (err.status(), axum::Json(body)).into_response()
            }
            ServiceError::ModelLoad(_) | ServiceError::Inference(_) | ServiceError::Io(_) => {
                tracing::error!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
