use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::DatabaseError;
use crate::models::*;

const SELECT_PREDICTION: &str =
    "SELECT r.id, r.patient_id, p.first_name, p.last_name, r.xray_image, r.gradcam_image,
            r.predicted_disease, r.confidence_score, r.all_predictions, r.created_at,
            r.reviewed_by_doctor, r.doctor_confirmed
     FROM prediction_results r
     JOIN patients p ON p.id = r.patient_id";

/// A prediction outcome ready to be stored.
#[derive(Debug, Clone, Copy)]
pub struct NewPrediction<'a> {
    pub patient_id: i64,
    pub xray_image: &'a str,
    pub predicted_disease: DiseaseLabel,
    pub confidence_score: f64,
    pub all_predictions: &'a ScoreMap,
}

/// Store a finished prediction and return its id.
pub fn insert_prediction(conn: &Connection, new: &NewPrediction<'_>) -> Result<i64, DatabaseError> {
    let confidence = new.confidence_score;
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(DatabaseError::ConstraintViolation(format!(
            "confidence score {confidence} outside [0, 1]"
        )));
    }
    if let Some((label, score)) = new
        .all_predictions
        .iter()
        .find(|(_, s)| !s.is_finite() || !(0.0..=1.0).contains(*s))
    {
        return Err(DatabaseError::ConstraintViolation(format!(
            "score for {label} is {score}, outside [0, 1]"
        )));
    }

    let json = serde_json::to_string(new.all_predictions)?;
    conn.execute(
        "INSERT INTO prediction_results
             (patient_id, xray_image, predicted_disease, confidence_score, all_predictions, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            new.patient_id,
            new.xray_image,
            new.predicted_disease.as_str(),
            confidence,
            json,
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Attach (or clear) the rendered heatmap path.
pub fn set_gradcam_image(
    conn: &Connection,
    id: i64,
    path: Option<&str>,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE prediction_results SET gradcam_image = ?2 WHERE id = ?1",
        params![id, path],
    )?;
    ensure_changed(changed, id)
}

/// Record a clinician's confirmation decision.
pub fn confirm_prediction(
    conn: &Connection,
    id: i64,
    confirmed: bool,
    reviewed_by: Option<i64>,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE prediction_results
         SET doctor_confirmed = ?2, reviewed_by_doctor = COALESCE(?3, reviewed_by_doctor)
         WHERE id = ?1",
        params![id, confirmed as i32, reviewed_by],
    )?;
    ensure_changed(changed, id)
}

pub fn get_prediction(conn: &Connection, id: i64) -> Result<Option<PredictionRecord>, DatabaseError> {
    let sql = format!("{SELECT_PREDICTION} WHERE r.id = ?1");
    let raw = conn
        .query_row(&sql, params![id], read_row)
        .optional()?;
    raw.map(PredictionRow::into_record).transpose()
}

/// List predictions newest first, applying the optional filters.
pub fn list_predictions(
    conn: &Connection,
    filter: &PredictionFilter,
) -> Result<Vec<PredictionRecord>, DatabaseError> {
    let sql = format!(
        "{SELECT_PREDICTION}
         WHERE (?1 IS NULL OR r.predicted_disease = ?1)
           AND (?2 IS NULL OR r.doctor_confirmed = ?2)
           AND (?3 IS NULL OR r.patient_id = ?3)
         ORDER BY r.created_at DESC, r.id DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![
            filter.disease.map(|d| d.as_str()),
            filter.confirmed.map(|c| c as i32),
            filter.patient,
        ],
        read_row,
    )?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?.into_record()?);
    }
    Ok(records)
}

fn ensure_changed(changed: usize, id: i64) -> Result<(), DatabaseError> {
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "prediction".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

struct PredictionRow {
    id: i64,
    patient_id: i64,
    first_name: String,
    last_name: String,
    xray_image: String,
    gradcam_image: Option<String>,
    predicted_disease: String,
    confidence_score: f64,
    all_predictions: String,
    created_at: String,
    reviewed_by_doctor: Option<i64>,
    doctor_confirmed: i32,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<PredictionRow> {
    Ok(PredictionRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        xray_image: row.get(4)?,
        gradcam_image: row.get(5)?,
        predicted_disease: row.get(6)?,
        confidence_score: row.get(7)?,
        all_predictions: row.get(8)?,
        created_at: row.get(9)?,
        reviewed_by_doctor: row.get(10)?,
        doctor_confirmed: row.get(11)?,
    })
}

impl PredictionRow {
    fn into_record(self) -> Result<PredictionRecord, DatabaseError> {
        let predicted_disease = DiseaseLabel::from_str(&self.predicted_disease)?;
        let all_predictions: ScoreMap = serde_json::from_str(&self.all_predictions)?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| DatabaseError::ConstraintViolation(format!("created_at: {e}")))?;

        Ok(PredictionRecord {
            id: self.id,
            patient: self.patient_id,
            patient_name: format!("{} {}", self.first_name, self.last_name),
            xray_image: self.xray_image,
            gradcam_image: self.gradcam_image,
            predicted_disease,
            confidence_score: self.confidence_score,
            all_predictions,
            created_at,
            reviewed_by_doctor: self.reviewed_by_doctor,
            doctor_confirmed: self.doctor_confirmed != 0,
        })
    }
}
