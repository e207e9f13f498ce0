use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Partial update of the `gateway` section, applied to the running service.
/// Any other section is answered with 400.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    tracing::info!(
        unknown_job_as_pending = current_config.gateway.unknown_job_as_pending,
        "Configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::jobs::gateway::Gateway;
    use crate::jobs::queue::TaskQueue;
    use crate::jobs::store::InMemoryJobStore;
    use actix_web::{http::StatusCode, test, App};
    use serde_json::Value;
    use std::sync::Arc;

    fn state() -> AppState {
        let gateway = Gateway::new(Arc::new(InMemoryJobStore::new()), TaskQueue::new(2), false);
        AppState::new(AppConfig::default(), gateway)
    }

    #[actix_web::test]
    async fn test_get_and_update_config() {
        let state = state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["worker"]["default_model"], "large-v3-turbo");

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"gateway": {"unknown_job_as_pending": true}}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "success");
        assert!(state.gateway.get_status("missing").is_some());
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected() {
        let state = state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"queue": {"capacity": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().queue.capacity, 1024);
    }

    #[actix_web::test]
    async fn test_startup_only_update_is_rejected() {
        let state = state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({
                "gateway": {"unknown_job_as_pending": true},
                "worker": {"worker_count": 8}
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "validation_error");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("cannot be changed at runtime"));

        let config = state.get_config();
        assert_eq!(config.worker.worker_count, 1);
        assert!(!config.gateway.unknown_job_as_pending);
        assert!(state.gateway.get_status("missing").is_none());
    }
}
