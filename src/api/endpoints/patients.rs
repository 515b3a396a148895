//! Patient reference endpoints.
//!
//! - `POST /api/patients` - create a patient
//! - `GET /api/patients/:id` - fetch one

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, ApiResponse};
use crate::db;
use crate::models::Patient;

#[derive(Deserialize)]
pub struct NewPatient {
    pub first_name: String,
    pub last_name: String,
}

/// `POST /api/patients`
pub async fn create(
    State(ctx): State<ApiContext>,
    Json(body): Json<NewPatient>,
) -> Result<(StatusCode, Json<ApiResponse<Patient>>), ApiError> {
    let first = body.first_name.trim();
    let last = body.last_name.trim();
    if first.is_empty() || last.is_empty() {
        return Err(ApiError::BadRequest("first_name and last_name are required".into()));
    }

    let conn = ctx.core.open_db()?;
    let patient = db::insert_patient(&conn, first, last)?;
    tracing::info!(patient_id = patient.id, "Patient created");

    Ok((StatusCode::CREATED, Json(ApiResponse::data(patient))))
}

/// `GET /api/patients/:id`
pub async fn detail(
    State(ctx): State<ApiContext>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Patient>>, ApiError> {
    let conn = ctx.core.open_db()?;
    let patient = db::get_patient(&conn, id)?
        .ok_or_else(|| ApiError::NotFound(format!("Patient {id} not found")))?;
    Ok(Json(ApiResponse::data(patient)))
}
