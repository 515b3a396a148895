//! Model diagnostics endpoints.
//!
//! - `GET /api/ml/diseases/` - labels with display names and availability
//! - `GET /api/ml/models/status/` - per-model load diagnostics

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, ApiResponse};
use crate::inference::ModelStatus;
use crate::models::DiseaseLabel;

#[derive(Debug, Serialize)]
pub struct DiseaseView {
    pub key: DiseaseLabel,
    pub name: &'static str,
    pub model_loaded: bool,
    pub gradcam_available: bool,
}

/// `GET /api/ml/diseases/`
pub async fn diseases(State(ctx): State<ApiContext>) -> Result<Json<ApiResponse<Vec<DiseaseView>>>, ApiError> {
    let registry = &ctx.core.registry;
    let views: Vec<DiseaseView> = DiseaseLabel::ALL
        .iter()
        .map(|&label| {
            let model = registry.get(label).ok();
            DiseaseView {
                key: label,
                name: label.display_name(),
                model_loaded: model.is_some(),
                gradcam_available: model.is_some_and(|m| m.gradcam_layer.is_some()),
            }
        })
        .collect();
    let count = views.len();
    Ok(Json(ApiResponse::data(views).with_count(count)))
}

#[derive(Debug, Serialize)]
pub struct ModelsStatusView {
    pub models_loaded: usize,
    pub total_models: usize,
    pub ml_predict_path: String,
    pub model_status: Vec<ModelStatus>,
}

/// `GET /api/ml/models/status/`
pub async fn status(State(ctx): State<ApiContext>) -> Result<Json<ApiResponse<ModelsStatusView>>, ApiError> {
    let registry = &ctx.core.registry;
    Ok(Json(ApiResponse::data(ModelsStatusView {
        models_loaded: registry.len(),
        total_models: DiseaseLabel::ALL.len(),
        ml_predict_path: ctx.core.config.models_dir.display().to_string(),
        model_status: registry.statuses().to_vec(),
    })))
}
