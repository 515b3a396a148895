//! Prediction workflow: upload -> ensemble -> persisted record -> Grad-CAM.
//!
//! Everything here is synchronous and CPU-bound; HTTP handlers run it on
//! tokio's blocking pool. The ensemble runs on the decoded image before
//! anything is written, and the record is inserted in one statement with its
//! full outcome, so other requests never observe an unlabelled prediction.

use image::RgbImage;
use rusqlite::Connection;
use thiserror::Error;

use crate::core_state::{CoreError, CoreState};
use crate::db::{self, DatabaseError, NewPrediction};
use crate::inference::preprocess::decode_image;
use crate::inference::{ensemble, gradcam, InferenceError};
use crate::media::{MediaError, MediaStore};
use crate::models::{DiseaseLabel, PredictionRecord};

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Patient {0} not found")]
    PatientNotFound(i64),

    #[error("Prediction {0} not found")]
    PredictionNotFound(i64),

    #[error("Invalid image: {0}")]
    InvalidImage(InferenceError),

    #[error("Prediction failed: {0}")]
    Inference(InferenceError),

    #[error("Grad-CAM unavailable: {0}")]
    GradCamUnavailable(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Media(#[from] MediaError),
}

impl From<CoreError> for PredictionError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Database(e) => PredictionError::Database(e),
            CoreError::Media(e) => PredictionError::Media(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PredictionOutcome {
    pub record: PredictionRecord,
    pub gradcam_available: bool,
    /// Models that errored or produced a non-finite score (recorded as 0.0).
    pub invalid_models: Vec<DiseaseLabel>,
}

/// Run the ensemble on an upload and persist the result for `patient_id`.
pub fn predict_and_record(
    core: &CoreState,
    patient_id: i64,
    upload: &[u8],
) -> Result<PredictionOutcome, PredictionError> {
    let conn = core.open_db()?;
    if db::get_patient(&conn, patient_id)?.is_none() {
        return Err(PredictionError::PatientNotFound(patient_id));
    }

    let image = decode_image(upload, core.config.max_upload_bytes).map_err(PredictionError::InvalidImage)?;
    let prediction = ensemble::predict(&core.registry, &image).map_err(PredictionError::Inference)?;

    let xray_image = core.media.save_upload(upload)?;
    let new = NewPrediction {
        patient_id,
        xray_image: &xray_image,
        predicted_disease: prediction.predicted_label,
        confidence_score: prediction.confidence_score,
        all_predictions: &prediction.all_scores,
    };
    let id = match db::insert_prediction(&conn, &new) {
        Ok(id) => id,
        Err(e) => {
            discard_upload(&core.media, &xray_image);
            return Err(e.into());
        }
    };

    let gradcam_available = attach_gradcam(core, &conn, id, prediction.predicted_label, &image);

    let record = load_record(&conn, id)?;
    tracing::info!(
        prediction_id = id,
        patient_id,
        label = %prediction.predicted_label,
        confidence = prediction.confidence_score,
        gradcam_available,
        "Prediction recorded"
    );

    Ok(PredictionOutcome {
        record,
        gradcam_available,
        invalid_models: prediction.invalid_models,
    })
}

/// Render and store the primary heatmap. Failures only lose the heatmap.
fn attach_gradcam(
    core: &CoreState,
    conn: &Connection,
    id: i64,
    label: DiseaseLabel,
    image: &RgbImage,
) -> bool {
    let Some(output) = gradcam::explain(&core.registry, label, image) else {
        return false;
    };
    let stored = core
        .media
        .save_gradcam(id, label, &output.png)
        .map_err(PredictionError::from)
        .and_then(|path| db::set_gradcam_image(conn, id, Some(&path)).map_err(PredictionError::from));
    match stored {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(prediction_id = id, error = %e, "Could not store Grad-CAM overlay");
            false
        }
    }
}

fn discard_upload(media: &MediaStore, xray_image: &str) {
    if let Err(e) = media.remove(xray_image) {
        tracing::error!(path = xray_image, error = %e, "Rollback could not remove upload");
    }
}

fn load_record(conn: &Connection, id: i64) -> Result<PredictionRecord, PredictionError> {
    db::get_prediction(conn, id)?.ok_or(PredictionError::PredictionNotFound(id))
}

fn source_image(core: &CoreState, record: &PredictionRecord) -> Result<RgbImage, PredictionError> {
    let bytes = core.media.read(&record.xray_image)?;
    decode_image(&bytes, usize::MAX).map_err(|e| PredictionError::GradCamUnavailable(e.to_string()))
}

fn render(core: &CoreState, label: DiseaseLabel, image: &RgbImage) -> Result<Vec<u8>, PredictionError> {
    gradcam::generate_for(&core.registry, label, image)
        .map(|out| out.png)
        .map_err(|e| PredictionError::GradCamUnavailable(e.to_string()))
}

/// Overlay PNG for a prediction, for its own label or an alternate one.
///
/// The primary label's stored overlay is served when present (and
/// re-rendered and stored when it is missing). Alternate labels are
/// rendered on demand and never touch the record.
pub fn render_gradcam(
    core: &CoreState,
    id: i64,
    label: Option<DiseaseLabel>,
) -> Result<Vec<u8>, PredictionError> {
    let conn = core.open_db()?;
    let record = load_record(&conn, id)?;
    let primary = record.predicted_disease;
    let label = label.unwrap_or(primary);

    if label == primary {
        if let Some(path) = &record.gradcam_image {
            match core.media.read(path) {
                Ok(bytes) => return Ok(bytes),
                Err(e) => tracing::warn!(prediction_id = id, error = %e, "Stored overlay unreadable, regenerating"),
            }
        }
    }

    let image = source_image(core, &record)?;
    let png = render(core, label, &image)?;
    if label == primary {
        let path = core.media.save_gradcam(id, label, &png)?;
        db::set_gradcam_image(&conn, id, Some(&path))?;
    }
    Ok(png)
}

#[derive(Debug, Clone)]
pub struct RegenerateOutcome {
    pub label: DiseaseLabel,
    pub gradcam_available: bool,
    pub gradcam_image: Option<String>,
}

/// Re-run Grad-CAM. The stored overlay is replaced only for the primary label.
pub fn regenerate_gradcam(
    core: &CoreState,
    id: i64,
    label: Option<DiseaseLabel>,
) -> Result<RegenerateOutcome, PredictionError> {
    let conn = core.open_db()?;
    let record = load_record(&conn, id)?;
    let primary = record.predicted_disease;
    let label = label.unwrap_or(primary);
    let image = source_image(core, &record)?;

    let png = match render(core, label, &image) {
        Ok(png) => png,
        Err(e) => {
            tracing::warn!(prediction_id = id, %label, error = %e, "Grad-CAM regeneration failed");
            return Ok(RegenerateOutcome {
                label,
                gradcam_available: false,
                gradcam_image: record.gradcam_image.filter(|_| label == primary),
            });
        }
    };

    let gradcam_image = if label == primary {
        let path = core.media.save_gradcam(id, label, &png)?;
        db::set_gradcam_image(&conn, id, Some(&path))?;
        Some(path)
    } else {
        None
    };
    tracing::info!(prediction_id = id, %label, "Grad-CAM regenerated");

    Ok(RegenerateOutcome {
        label,
        gradcam_available: true,
        gradcam_image,
    })
}
