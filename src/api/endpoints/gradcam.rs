//! Grad-CAM endpoints.
//!
//! - `GET /api/ml/predictions/:id/gradcam/` - overlay PNG, optional `?disease=`
//! - `POST /api/ml/predictions/:id/regenerate-gradcam/` - re-render, optional `{disease}`

use std::str::FromStr;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, ApiResponse};
use crate::models::DiseaseLabel;
use crate::workflow;

fn parse_label(value: Option<&str>) -> Result<Option<DiseaseLabel>, ApiError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => DiseaseLabel::from_str(v)
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("Unknown disease '{v}'"))),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GradCamQuery {
    pub disease: Option<String>,
}

/// `GET /api/ml/predictions/:id/gradcam/`
pub async fn image(
    State(ctx): State<ApiContext>,
    Path(id): Path<i64>,
    Query(query): Query<GradCamQuery>,
) -> Result<Response, ApiError> {
    let label = parse_label(query.disease.as_deref())?;
    let core = ctx.core.clone();
    let png = tokio::task::spawn_blocking(move || workflow::render_gradcam(&core, id, label))
        .await?
        .map_err(|e| ApiError::from_prediction(e, ctx.debug_info()))?;

    Ok(([(header::CONTENT_TYPE, "image/png")], Bytes::from(png)).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct RegenerateBody {
    #[serde(default)]
    pub disease: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegenerateView {
    pub prediction_id: i64,
    pub disease: DiseaseLabel,
    pub gradcam_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gradcam_image: Option<String>,
}

/// `POST /api/ml/predictions/:id/regenerate-gradcam/`
pub async fn regenerate(
    State(ctx): State<ApiContext>,
    Path(id): Path<i64>,
    body: Option<Json<RegenerateBody>>,
) -> Result<Json<ApiResponse<RegenerateView>>, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let label = parse_label(body.disease.as_deref())?;
    let core = ctx.core.clone();
    let outcome = tokio::task::spawn_blocking(move || workflow::regenerate_gradcam(&core, id, label))
        .await?
        .map_err(|e| ApiError::from_prediction(e, ctx.debug_info()))?;

    let message = if outcome.gradcam_available {
        "Grad-CAM regenerated"
    } else {
        "Grad-CAM could not be generated"
    };
    Ok(Json(
        ApiResponse::data(RegenerateView {
            prediction_id: id,
            disease: outcome.label,
            gradcam_available: outcome.gradcam_available,
            gradcam_image: outcome.gradcam_image,
        })
        .with_message(message),
    ))
}
