//! Job submission and status endpoints.

use crate::{error::AppError, jobs::model::JobStatus, state::AppState};
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Body of `POST /api/v1/analyze`. Both `filePath` and `file_path` are accepted.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    #[serde(alias = "file_path")]
    pub file_path: String,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

pub async fn analyze(
    state: web::Data<AppState>,
    body: web::Json<AnalyzeRequest>,
) -> Result<HttpResponse, AppError> {
    let request = body.into_inner();
    let file_path = request.file_path.trim();
    if file_path.is_empty() {
        return Err(AppError::ValidationError("filePath must not be empty".to_string()));
    }

    let options = request.options.unwrap_or(Value::Null);
    let submission = state.gateway.submit(file_path, options);
    state.record_submission(submission.is_ok());
    let submission = submission?;

    Ok(HttpResponse::Ok().json(AnalyzeResponse {
        job_id: submission.job_id.to_string(),
        status: submission.status,
        message: "Task submitted successfully".to_string(),
    }))
}

pub async fn job_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let job_id = path.into_inner();
    let view = state
        .gateway
        .get_status(&job_id)
        .ok_or_else(|| AppError::NotFound(format!("Job not found: {}", job_id)))?;
    Ok(HttpResponse::Ok().json(view))
}

/// Service banner at `/`.
pub async fn root() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": "transcribe-jobs",
        "version": env!("CARGO_PKG_VERSION"),
        "message": "Transcription job service"
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::jobs::gateway::Gateway;
    use crate::jobs::model::{ErrorCode, ErrorRecord, JobId, Segment};
    use crate::jobs::queue::TaskQueue;
    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    fn state(capacity: usize) -> (AppState, Arc<InMemoryJobStore>) {
        let store = Arc::new(InMemoryJobStore::new());
        let gateway = Gateway::new(store.clone(), TaskQueue::new(capacity), false);
        (AppState::new(AppConfig::default(), gateway), store)
    }

    fn app_routes(cfg: &mut web::ServiceConfig) {
        cfg.route("/", web::get().to(root)).service(
            web::scope("/api/v1")
                .route("/analyze", web::post().to(analyze))
                .route("/status/{job_id}", web::get().to(job_status)),
        );
    }

    #[actix_web::test]
    async fn test_analyze_returns_pending_job() {
        let (state, _) = state(4);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(app_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/analyze")
            .set_json(json!({"filePath": "/data/a.wav", "options": {"no_align": true}}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "PENDING");
        let job_id = body["jobId"].as_str().unwrap().to_string();
        assert!(!job_id.is_empty());
        assert_eq!(state.gateway.queue().len(), 1);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/status/{}", job_id))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "PENDING");
        assert_eq!(body["progress"], 0.0);
        assert!(body.get("result").is_none());
    }

    #[actix_web::test]
    async fn test_analyze_validates_body() {
        let (state, _) = state(4);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(app_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/analyze")
            .set_json(json!({"filePath": "  "}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_full_queue_is_service_unavailable() {
        let (state, store) = state(1);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(app_routes),
        )
        .await;

        for expected in [StatusCode::OK, StatusCode::SERVICE_UNAVAILABLE] {
            let req = test::TestRequest::post()
                .uri("/api/v1/analyze")
                .set_json(json!({"file_path": "/data/a.wav"}))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), expected);
        }
        assert_eq!(state.get_metrics_snapshot().submissions_rejected, 1);
        let counts = store.counts();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.failure, 0);
    }

    #[actix_web::test]
    async fn test_status_of_finished_jobs() {
        let (state, store) = state(4);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(app_routes),
        )
        .await;

        let done = state.gateway.submit("/a.wav", Value::Null).unwrap().job_id;
        store.mark_processing(&done).unwrap();
        store
            .complete(&done, vec![Segment::new(0.0, 1.5, "hello")])
            .unwrap();

        let failed = state.gateway.submit("/b.wav", Value::Null).unwrap().job_id;
        store.mark_processing(&failed).unwrap();
        store
            .fail(&failed, ErrorRecord::new(ErrorCode::GpuOom, "GPU Out of Memory"))
            .unwrap();

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/status/{}", done))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "SUCCESS");
        assert_eq!(body["progress"], 100.0);
        assert_eq!(body["result"][0]["endTime"], 1.5);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/status/{}", failed))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "FAILURE");
        assert_eq!(body["errorCode"], "WORKER_001");
        assert_eq!(body["errorMessage"], "GPU Out of Memory");
    }

    #[actix_web::test]
    async fn test_unknown_job_is_not_found() {
        let (state, _) = state(4);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(app_routes),
        )
        .await;

        let unknown = JobId::generate();
        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/status/{}", unknown))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        state.gateway.set_unknown_job_as_pending(true);
        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/status/{}", unknown))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "PENDING");
    }

    #[actix_web::test]
    async fn test_root_banner() {
        let app = test::init_service(App::new().configure(app_routes)).await;
        let req = test::TestRequest::get().uri("/").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
    }
}
