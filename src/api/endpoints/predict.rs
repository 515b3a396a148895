//! `POST /api/ml/predict/` - run the ensemble on an uploaded X-ray.
//!
//! Multipart fields: `patient_id` (text) and `xray_image` (file).

use axum::extract::{Multipart, State};
use axum::Json;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, ApiResponse};
use crate::models::{DiseaseLabel, PredictionRecord};
use crate::workflow;

#[derive(Debug, Serialize)]
pub struct PredictionView {
    #[serde(flatten)]
    pub record: PredictionRecord,
    pub gradcam_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gradcam_url: Option<String>,
    pub available_diseases: Vec<DiseaseLabel>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invalid_models: Vec<DiseaseLabel>,
}

pub(crate) fn gradcam_url(id: i64) -> String {
    format!("/api/ml/predictions/{id}/gradcam/")
}

struct PredictUpload {
    patient_id: i64,
    image: Vec<u8>,
}

async fn read_upload(mut multipart: Multipart) -> Result<PredictUpload, ApiError> {
    let mut patient_id = None;
    let mut image = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or("") {
            "patient_id" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Unreadable patient_id: {e}")))?;
                let id = text
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| ApiError::BadRequest(format!("Invalid patient_id '{text}'")))?;
                patient_id = Some(id);
            }
            "xray_image" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Unreadable xray_image: {e}")))?;
                image = Some(bytes.to_vec());
            }
            _ => {}
        }
    }

    Ok(PredictUpload {
        patient_id: patient_id.ok_or_else(|| ApiError::BadRequest("patient_id is required".into()))?,
        image: image.ok_or_else(|| ApiError::BadRequest("xray_image is required".into()))?,
    })
}

/// `POST /api/ml/predict/`
pub async fn predict(
    State(ctx): State<ApiContext>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<PredictionView>>, ApiError> {
    let upload = read_upload(multipart).await?;
    tracing::info!(
        patient_id = upload.patient_id,
        bytes = upload.image.len(),
        "Prediction requested"
    );

    let core = ctx.core.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        workflow::predict_and_record(&core, upload.patient_id, &upload.image)
    })
    .await?
    .map_err(|e| ApiError::from_prediction(e, ctx.debug_info()))?;

    let id = outcome.record.id;
    let view = PredictionView {
        gradcam_url: outcome.gradcam_available.then(|| gradcam_url(id)),
        record: outcome.record,
        gradcam_available: outcome.gradcam_available,
        available_diseases: ctx.core.registry.loaded_labels(),
        invalid_models: outcome.invalid_models,
    };
    Ok(Json(
        ApiResponse::data(view).with_message("Prediction completed successfully"),
    ))
}
