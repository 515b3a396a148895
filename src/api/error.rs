//! API error types with structured JSON responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::core_state::CoreError;
use crate::models::DiseaseLabel;
use crate::workflow::PredictionError;

/// Error body: `{success: false, message, debug_info?}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<DebugInfo>,
}

/// Model state attached to failed predictions.
#[derive(Debug, Clone, Serialize)]
pub struct DebugInfo {
    pub models_loaded: usize,
    pub available_models: Vec<DiseaseLabel>,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Prediction failed: {message}")]
    PredictionFailed { message: String, debug_info: DebugInfo },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, debug_info) = match self {
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail, None),
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail, None),
            ApiError::PredictionFailed { message, debug_info } => {
                tracing::warn!(%message, models_loaded = debug_info.models_loaded, "Prediction failed");
                (StatusCode::INTERNAL_SERVER_ERROR, message, Some(debug_info))
            }
            ApiError::Internal(detail) => {
                tracing::error!(%detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorBody {
            success: false,
            message,
            debug_info,
        };
        (status, Json(body)).into_response()
    }
}

impl ApiError {
    /// Map a workflow failure; `debug_info` is only used for inference failures.
    pub fn from_prediction(err: PredictionError, debug_info: DebugInfo) -> Self {
        match err {
            PredictionError::PatientNotFound(_) | PredictionError::PredictionNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            PredictionError::InvalidImage(e) => ApiError::BadRequest(e.to_string()),
            PredictionError::Inference(e) => ApiError::PredictionFailed {
                message: format!("Prediction failed: {e}"),
                debug_info,
            },
            PredictionError::GradCamUnavailable(detail) => {
                ApiError::NotFound(format!("Grad-CAM not available: {detail}"))
            }
            PredictionError::Database(e) => ApiError::Internal(e.to_string()),
            PredictionError::Media(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<crate::db::DatabaseError> for ApiError {
    fn from(err: crate::db::DatabaseError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("blocking task failed: {err}"))
    }
}
