//! Prediction record endpoints.
//!
//! - `GET /api/ml/predictions/` - list, filter by `?disease=` / `?confirmed=`
//! - `GET /api/ml/predictions/patient/:patient_id/` - one patient's history
//! - `PATCH /api/ml/predictions/:id/confirm/` - clinician confirmation

use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, ApiResponse};
use crate::db;
use crate::models::{DiseaseLabel, PredictionFilter, PredictionRecord};

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub disease: Option<String>,
    pub confirmed: Option<String>,
}

impl ListQuery {
    fn into_filter(self) -> Result<PredictionFilter, ApiError> {
        let disease = self
            .disease
            .filter(|d| !d.is_empty())
            .map(|d| {
                DiseaseLabel::from_str(&d).map_err(|_| ApiError::BadRequest(format!("Unknown disease '{d}'")))
            })
            .transpose()?;
        let confirmed = match self.confirmed.as_deref() {
            None | Some("") => None,
            Some(v) if v.eq_ignore_ascii_case("true") => Some(true),
            Some(v) if v.eq_ignore_ascii_case("false") => Some(false),
            Some(v) => return Err(ApiError::BadRequest(format!("Invalid confirmed value '{v}'"))),
        };
        Ok(PredictionFilter {
            disease,
            confirmed,
            patient: None,
        })
    }
}

fn listing(records: Vec<PredictionRecord>) -> Json<ApiResponse<Vec<PredictionRecord>>> {
    let count = records.len();
    Json(ApiResponse::data(records).with_count(count))
}

/// `GET /api/ml/predictions/`
pub async fn list(
    State(ctx): State<ApiContext>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<PredictionRecord>>>, ApiError> {
    let filter = query.into_filter()?;
    let conn = ctx.core.open_db()?;
    Ok(listing(db::list_predictions(&conn, &filter)?))
}

/// `GET /api/ml/predictions/patient/:patient_id/`
pub async fn by_patient(
    State(ctx): State<ApiContext>,
    Path(patient_id): Path<i64>,
) -> Result<Json<ApiResponse<Vec<PredictionRecord>>>, ApiError> {
    let conn = ctx.core.open_db()?;
    if db::get_patient(&conn, patient_id)?.is_none() {
        return Err(ApiError::NotFound(format!("Patient {patient_id} not found")));
    }
    let filter = PredictionFilter {
        patient: Some(patient_id),
        ..Default::default()
    };
    Ok(listing(db::list_predictions(&conn, &filter)?))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmBody {
    pub confirmed: bool,
    #[serde(default)]
    pub reviewed_by_doctor: Option<i64>,
}

/// `PATCH /api/ml/predictions/:id/confirm/`
pub async fn confirm(
    State(ctx): State<ApiContext>,
    Path(id): Path<i64>,
    Json(body): Json<ConfirmBody>,
) -> Result<Json<ApiResponse<PredictionRecord>>, ApiError> {
    let conn = ctx.core.open_db()?;
    if db::get_prediction(&conn, id)?.is_none() {
        return Err(ApiError::NotFound(format!("Prediction {id} not found")));
    }
    db::confirm_prediction(&conn, id, body.confirmed, body.reviewed_by_doctor)?;
    let record = db::get_prediction(&conn, id)?
        .ok_or_else(|| ApiError::NotFound(format!("Prediction {id} not found")))?;
    tracing::info!(prediction_id = id, confirmed = body.confirmed, "Prediction reviewed");

    let message = if body.confirmed {
        "Prediction confirmed"
    } else {
        "Prediction marked as not confirmed"
    };
    Ok(Json(ApiResponse::data(record).with_message(message)))
}
