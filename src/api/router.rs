//! HTTP API router.
//!
//! Returns a composable `Router` with every route nested under `/api/`.
//! Layers (outermost first): CORS, body limit, request logging.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::endpoints;
use crate::api::middleware;
use crate::api::types::ApiContext;
use crate::core_state::CoreState;

/// Multipart framing on top of the image itself.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Build the API router over shared core state.
pub fn api_router(core: Arc<CoreState>) -> Router {
    let body_limit = core.config.max_upload_bytes + MULTIPART_OVERHEAD_BYTES;
    let ctx = ApiContext::new(core);

    // NOTE: Path params use `:param` syntax (matchit 0.7 / axum 0.7).
    let api = Router::new()
        .route("/health", get(endpoints::health::check))
        .route("/patients", post(endpoints::patients::create))
        .route("/patients/:id", get(endpoints::patients::detail))
        .route("/ml/predict/", post(endpoints::predict::predict))
        .route("/ml/predictions/", get(endpoints::predictions::list))
        .route(
            "/ml/predictions/patient/:patient_id/",
            get(endpoints::predictions::by_patient),
        )
        .route(
            "/ml/predictions/:id/confirm/",
            patch(endpoints::predictions::confirm),
        )
        .route("/ml/predictions/:id/gradcam/", get(endpoints::gradcam::image))
        .route(
            "/ml/predictions/:id/regenerate-gradcam/",
            post(endpoints::gradcam::regenerate),
        )
        .route("/ml/diseases/", get(endpoints::models::diseases))
        .route("/ml/models/status/", get(endpoints::models::status))
        .with_state(ctx)
        .layer(axum::middleware::from_fn(middleware::audit::log_access))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive());

    Router::new().nest("/api", api)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::inference::registry::TrainedModel;
    use crate::inference::test_support::{
        brightness_model, constant_model, failing_model, gradient_png, test_core,
    };
    use crate::models::DiseaseLabel;

    const BOUNDARY: &str = "chestcare-test-boundary";

    fn app(models: Vec<TrainedModel>) -> (tempfile::TempDir, Router) {
        let (dir, core) = test_core(models);
        (dir, api_router(Arc::new(core)))
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn predict_request(patient_id: &str, image: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"patient_id\"\r\n\r\n{patient_id}\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"xray_image\"; filename=\"xray.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(image);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method(Method::POST)
            .uri("/api/ml/predict/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn create_patient(router: &Router) -> i64 {
        let (status, json) = send(
            router,
            json_request(
                Method::POST,
                "/api/patients",
                json!({"first_name": "Grace", "last_name": "Hopper"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        json["data"]["id"].as_i64().unwrap()
    }

    async fn prediction_count(router: &Router) -> u64 {
        let (status, json) = send(router, get("/api/ml/predictions/")).await;
        assert_eq!(status, StatusCode::OK);
        json["count"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn health_reports_loaded_models() {
        let (_dir, router) = app(vec![constant_model(DiseaseLabel::Pneumonia, 0.5)]);
        let (status, json) = send(&router, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["models_loaded"], 1);
    }

    #[tokio::test]
    async fn patient_create_and_fetch() {
        let (_dir, router) = app(vec![]);
        let id = create_patient(&router).await;

        let (status, json) = send(&router, get(&format!("/api/patients/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["last_name"], "Hopper");

        let (status, json) = send(&router, get("/api/patients/9999")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["success"], false);

        let (status, _) = send(
            &router,
            json_request(Method::POST, "/api/patients", json!({"first_name": " ", "last_name": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn end_to_end_prediction_with_overlay() {
        let (_dir, router) = app(vec![
            constant_model(DiseaseLabel::Cardiomegaly, 0.12),
            constant_model(DiseaseLabel::Pneumonia, 0.91),
            constant_model(DiseaseLabel::Tuberculosis, 0.30),
            constant_model(DiseaseLabel::PulmonaryHypertension, 0.05),
        ]);
        let pid = create_patient(&router).await;

        let (status, json) = send(&router, predict_request(&pid.to_string(), &gradient_png(512, 512))).await;
        assert_eq!(status, StatusCode::OK, "{json}");
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "Prediction completed successfully");

        let data = &json["data"];
        assert_eq!(data["predicted_disease"], "pneumonia");
        assert!((data["confidence_score"].as_f64().unwrap() - 0.91).abs() < 1e-3);
        let all = data["all_predictions"].as_object().unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.values().all(|v| (0.0..=1.0).contains(&v.as_f64().unwrap())));
        assert_eq!(data["gradcam_available"], true);
        assert_eq!(data["patient"], pid);
        assert_eq!(data["patient_name"], "Grace Hopper");
        assert_eq!(data["doctor_confirmed"], false);
        assert_eq!(data["available_diseases"].as_array().unwrap().len(), 4);

        let id = data["id"].as_i64().unwrap();
        let response = router
            .clone()
            .oneshot(get(&format!("/api/ml/predictions/{id}/gradcam/")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let png = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let overlay = image::load_from_memory(&png).unwrap();
        assert_eq!((overlay.width(), overlay.height()), (512, 512));
    }

    #[tokio::test]
    async fn higher_scoring_model_wins() {
        let (_dir, router) = app(vec![
            constant_model(DiseaseLabel::Cardiomegaly, 0.82),
            constant_model(DiseaseLabel::Pneumonia, 0.35),
        ]);
        let pid = create_patient(&router).await;
        let (status, json) = send(&router, predict_request(&pid.to_string(), &gradient_png(64, 64))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["predicted_disease"], "cardiomegaly");
        let all = &json["data"]["all_predictions"];
        assert!((all["cardiomegaly"].as_f64().unwrap() - 0.82).abs() < 1e-3);
        assert!((all["pneumonia"].as_f64().unwrap() - 0.35).abs() < 1e-3);
    }

    #[tokio::test]
    async fn corrupt_upload_is_400_and_persists_nothing() {
        let (_dir, router) = app(vec![constant_model(DiseaseLabel::Pneumonia, 0.5)]);
        let pid = create_patient(&router).await;
        let (status, json) = send(&router, predict_request(&pid.to_string(), b"not an image at all")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);
        assert_eq!(prediction_count(&router).await, 0);
    }

    #[tokio::test]
    async fn zero_models_is_500_with_debug_info() {
        let (_dir, router) = app(vec![]);
        let pid = create_patient(&router).await;
        let (status, json) = send(&router, predict_request(&pid.to_string(), &gradient_png(32, 32))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["success"], false);
        assert_eq!(json["debug_info"]["models_loaded"], 0);
        assert!(json["debug_info"]["available_models"].as_array().unwrap().is_empty());
        assert_eq!(prediction_count(&router).await, 0);
    }

    #[tokio::test]
    async fn failed_ensemble_leaves_nothing_to_list_or_confirm() {
        let (_dir, router) = app(vec![failing_model(DiseaseLabel::Pneumonia)]);
        let pid = create_patient(&router).await;
        let (status, json) = send(&router, predict_request(&pid.to_string(), &gradient_png(16, 16))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["debug_info"]["models_loaded"], 1);

        assert_eq!(prediction_count(&router).await, 0);
        let (_, json) = send(&router, get(&format!("/api/ml/predictions/patient/{pid}/"))).await;
        assert_eq!(json["count"], 0);
        let (status, _) = send(
            &router,
            json_request(Method::PATCH, "/api/ml/predictions/1/confirm/", json!({"confirmed": true})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_predict_requests_are_400_or_404() {
        let (_dir, router) = app(vec![constant_model(DiseaseLabel::Pneumonia, 0.5)]);
        let (status, _) = send(&router, predict_request("abc", &gradient_png(8, 8))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = send(&router, predict_request("4242", &gradient_png(8, 8))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn listing_filtering_and_confirmation() {
        let (_dir, router) = app(vec![
            constant_model(DiseaseLabel::Tuberculosis, 0.7),
            constant_model(DiseaseLabel::Pneumonia, 0.2),
        ]);
        let pid = create_patient(&router).await;
        for _ in 0..2 {
            let (status, _) = send(&router, predict_request(&pid.to_string(), &gradient_png(16, 16))).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (_, json) = send(&router, get("/api/ml/predictions/?disease=tuberculosis")).await;
        assert_eq!(json["count"], 2);
        let (_, json) = send(&router, get("/api/ml/predictions/?disease=pneumonia")).await;
        assert_eq!(json["count"], 0);
        let (status, _) = send(&router, get("/api/ml/predictions/?disease=flu")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, json) = send(&router, get("/api/ml/predictions/")).await;
        let newest = json["data"][0]["id"].as_i64().unwrap();

        let (status, json) = send(
            &router,
            json_request(
                Method::PATCH,
                &format!("/api/ml/predictions/{newest}/confirm/"),
                json!({"confirmed": true, "reviewed_by_doctor": 17}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["doctor_confirmed"], true);
        assert_eq!(json["data"]["reviewed_by_doctor"], 17);

        let (_, json) = send(&router, get("/api/ml/predictions/?confirmed=true")).await;
        assert_eq!(json["count"], 1);
        let (_, json) = send(&router, get("/api/ml/predictions/?confirmed=false")).await;
        assert_eq!(json["count"], 1);

        let (status, _) = send(
            &router,
            json_request(Method::PATCH, "/api/ml/predictions/9999/confirm/", json!({"confirmed": true})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, json) = send(&router, get(&format!("/api/ml/predictions/patient/{pid}/"))).await;
        assert_eq!(json["count"], 2);
        let (status, _) = send(&router, get("/api/ml/predictions/patient/9999/")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn gradcam_alternate_labels_and_regeneration() {
        let (_dir, router) = app(vec![
            brightness_model(DiseaseLabel::Pneumonia),
            constant_model(DiseaseLabel::Tuberculosis, 0.99),
        ]);
        let pid = create_patient(&router).await;
        let (_, json) = send(&router, predict_request(&pid.to_string(), &gradient_png(48, 48))).await;
        let id = json["data"]["id"].as_i64().unwrap();
        let stored = json["data"]["gradcam_image"].clone();
        assert_eq!(json["data"]["predicted_disease"], "tuberculosis");

        let response = router
            .clone()
            .oneshot(get(&format!("/api/ml/predictions/{id}/gradcam/?disease=pneumonia")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (status, _) = send(&router, get(&format!("/api/ml/predictions/{id}/gradcam/?disease=cardiomegaly"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&router, get("/api/ml/predictions/777/gradcam/")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = send(
            &router,
            Request::builder()
                .method(Method::POST)
                .uri(format!("/api/ml/predictions/{id}/regenerate-gradcam/"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["gradcam_available"], true);
        assert_eq!(json["data"]["gradcam_image"], stored);

        let (status, json) = send(
            &router,
            json_request(
                Method::POST,
                &format!("/api/ml/predictions/{id}/regenerate-gradcam/"),
                json!({"disease": "cardiomegaly"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["gradcam_available"], false);

        // Alternate renders never replace the stored primary overlay.
        let (_, json) = send(&router, get(&format!("/api/ml/predictions/patient/{pid}/"))).await;
        assert_eq!(json["data"][0]["gradcam_image"], stored);
        assert_eq!(json["data"][0]["predicted_disease"], "tuberculosis");
    }

    #[tokio::test]
    async fn disease_and_model_diagnostics() {
        let (_dir, router) = app(vec![constant_model(DiseaseLabel::Pneumonia, 0.5)]);

        let (status, json) = send(&router, get("/api/ml/diseases/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 4);
        let pneumonia = json["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|d| d["key"] == "pneumonia")
            .unwrap()
            .clone();
        assert_eq!(pneumonia["model_loaded"], true);
        assert_eq!(pneumonia["gradcam_available"], true);
        assert_eq!(json["data"][3]["name"], "Pulmonary Hypertension");

        let (status, json) = send(&router, get("/api/ml/models/status/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["models_loaded"], 1);
        assert_eq!(json["data"]["total_models"], 4);
        assert_eq!(json["data"]["model_status"].as_array().unwrap().len(), 4);
    }
}
