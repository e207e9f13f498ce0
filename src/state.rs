//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data`.
//!
//! ## What lives here:
//! - **config**: current configuration, replaceable at runtime via `PUT /api/v1/config`
//! - **gateway**: job submission and status reads (store + queue behind it)
//! - **metrics**: request counters collected by the middleware
//! - **start_time**: for uptime reporting
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every worker thread of the HTTP server holds a reference
//! - **RwLock**: many concurrent readers, one writer at a time
//!
//! The workers never see `AppState`; they share only the store and the queue.

use crate::config::AppConfig;
use crate::jobs::gateway::Gateway;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    pub gateway: Gateway,

    /// Performance metrics, updated on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub start_time: Instant,
}

/// Counters collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Submissions accepted by the gateway
    pub jobs_submitted: u64,
    /// Submissions refused because the queue was full or closed
    pub submissions_rejected: u64,
    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, gateway: Gateway) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            gateway,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately so handlers never hold it across
    /// an await point.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration after validating it, and push the values that
    /// apply at runtime into the running components.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        self.gateway
            .set_unknown_job_as_pending(new_config.gateway.unknown_job_as_pending);
        *self.config.write() = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    pub fn record_submission(&self, accepted: bool) {
        let mut metrics = self.metrics.write();
        if accepted {
            metrics.jobs_submitted += 1;
        } else {
            metrics.submissions_rejected += 1;
        }
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// The first time an endpoint is seen it gets a zeroed entry.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Snapshot for the metrics endpoint; the lock is released before serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queue::TaskQueue;
    use crate::jobs::store::InMemoryJobStore;

    fn state() -> AppState {
        let gateway = Gateway::new(Arc::new(InMemoryJobStore::new()), TaskQueue::new(2), false);
        AppState::new(AppConfig::default(), gateway)
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_update_config_applies_gateway_flag() {
        let state = state();
        assert!(state.gateway.get_status("missing").is_none());

        let mut config = state.get_config();
        config.gateway.unknown_job_as_pending = true;
        state.update_config(config).unwrap();

        assert!(state.gateway.get_status("missing").is_some());
        assert!(state.get_config().gateway.unknown_job_as_pending);
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let state = state();
        let mut config = state.get_config();
        config.queue.capacity = 0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().queue.capacity, 1024);
    }
}
