use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::DiseaseLabel;

/// Per-label confidence scores, ordered by label ordinal.
pub type ScoreMap = BTreeMap<DiseaseLabel, f64>;

/// A persisted X-ray prediction. Rows are written once the ensemble has
/// produced a label, so every record carries its full outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: i64,
    pub patient: i64,
    pub patient_name: String,
    pub xray_image: String,
    pub gradcam_image: Option<String>,
    pub predicted_disease: DiseaseLabel,
    pub confidence_score: f64,
    pub all_predictions: ScoreMap,
    pub created_at: DateTime<Utc>,
    pub reviewed_by_doctor: Option<i64>,
    pub doctor_confirmed: bool,
}

/// Optional filters for listing predictions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PredictionFilter {
    pub disease: Option<DiseaseLabel>,
    pub confirmed: Option<bool>,
    pub patient: Option<i64>,
}
