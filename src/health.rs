use crate::device::DeviceManager;
use crate::jobs::queue::QueueStats;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

/// Fraction of queue capacity above which the service reports high load.
const QUEUE_HIGH_WATERMARK: f64 = 0.9;
const QUEUE_MODERATE_WATERMARK: f64 = 0.7;

/// Minimal liveness check for `/api/v1/health`.
pub async fn api_health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": "transcribe-jobs"
    }))
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let queue = state.gateway.queue().stats();
    let jobs = state.gateway.store().counts();

    HttpResponse::Ok().json(json!({
        "status": if queue.closed { "stopping" } else { "healthy" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "transcribe-jobs",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "jobs_submitted": metrics.jobs_submitted,
            "submissions_rejected": metrics.submissions_rejected
        },
        "jobs": jobs,
        "memory": get_memory_info(),
        "workers": {
            "count": config.worker.worker_count,
            "default_model": config.worker.default_model,
            "device": config.worker.device,
            "compute_type": config.worker.compute_type
        },
        "devices": DeviceManager::get_device_summary(),
        "system": get_system_status(&queue)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "queue": state.gateway.queue().stats(),
        "jobs": state.gateway.store().counts(),
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                let kb = || {
                    line.split_whitespace()
                        .nth(1)
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0)
                        * 1024
                };
                if line.starts_with("VmRSS:") {
                    vm_rss = kb();
                } else if line.starts_with("VmSize:") {
                    vm_size = kb();
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {}", process::id())
    })
}

fn get_system_status(queue: &QueueStats) -> serde_json::Value {
    let queue_usage = if queue.capacity > 0 {
        queue.queued as f64 / queue.capacity as f64
    } else {
        0.0
    };

    let status = if queue_usage > QUEUE_HIGH_WATERMARK {
        "high_load"
    } else if queue_usage > QUEUE_MODERATE_WATERMARK {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "queue_usage_percent": (queue_usage * 100.0).round(),
        "queue": queue,
        "load_warnings": if queue_usage > 0.8 {
            vec!["Task queue nearly full - consider adding workers or raising queue.capacity"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::jobs::gateway::Gateway;
    use crate::jobs::queue::TaskQueue;
    use crate::jobs::store::InMemoryJobStore;
    use actix_web::{test as actix_test, App};
    use serde_json::Value;
    use std::sync::Arc;

    #[test]
    fn test_system_status_thresholds() {
        let queue = QueueStats {
            queued: 95,
            capacity: 100,
            ..Default::default()
        };
        let status = get_system_status(&queue);
        assert_eq!(status["status"], "high_load");
        assert_eq!(status["load_warnings"].as_array().unwrap().len(), 1);

        let queue = QueueStats {
            queued: 1,
            capacity: 100,
            ..Default::default()
        };
        assert_eq!(get_system_status(&queue)["status"], "normal");
    }

    #[actix_web::test]
    async fn test_health_reports_jobs_and_queue() {
        let gateway = Gateway::new(Arc::new(InMemoryJobStore::new()), TaskQueue::new(4), false);
        gateway.submit("/a.wav", Value::Null).unwrap();
        let state = AppState::new(AppConfig::default(), gateway);

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check))
                .route("/api/v1/health", web::get().to(api_health)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["jobs"]["pending"], 1);
        assert_eq!(body["system"]["queue"]["queued"], 1);

        let req = actix_test::TestRequest::get().uri("/api/v1/health").to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
    }
}
