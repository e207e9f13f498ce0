//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables `HOST` and `PORT`
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_WORKER__WORKER_COUNT`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Section and field are separated by a double underscore because field names
//! contain single underscores themselves.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::device::{ComputePrecision, DevicePreference};
use crate::transcription::worker::WorkerSettings;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - **server**: HTTP bind address
/// - **worker**: how many workers run and which engine they default to
/// - **queue**: task queue sizing
/// - **storage**: temp artifacts and result mirroring
/// - **gateway**: status read behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub gateway: GatewayConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Worker pool and engine defaults.
///
/// ## Fields:
/// - `worker_count`: number of workers, each holding its own resident engine
/// - `default_model`: variant used when a job names none and nothing is resident
/// - `device`: "auto", "cpu", "cuda" or "metal"; unavailable accelerators fall back to CPU
/// - `compute_type`: "float32", "float16" or "bfloat16"
/// - `default_batch_size`: windows per encoder pass when a job does not say
/// - `warmup`: load `default_model` before the first job arrives
/// - `poll_interval_ms`: how long an idle worker blocks before checking for shutdown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_count: usize,
    pub default_model: String,
    pub device: String,
    pub compute_type: String,
    pub default_batch_size: usize,
    pub warmup: bool,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Work items that may wait at once; submissions beyond this get 503
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Where normalized audio artifacts are written
    pub temp_dir: String,
    /// Write `<stem>_result.json` next to each successfully transcribed input
    pub mirror_results: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Report an unknown job ID as PENDING instead of 404
    pub unknown_job_as_pending: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            worker: WorkerConfig {
                worker_count: 1,
                default_model: "large-v3-turbo".to_string(),
                device: "cuda".to_string(),
                compute_type: "float16".to_string(),
                default_batch_size: crate::jobs::model::DEFAULT_BATCH_SIZE,
                warmup: false,
                poll_interval_ms: 500,
            },
            queue: QueueConfig { capacity: 1024 },
            storage: StorageConfig {
                temp_dir: env::temp_dir()
                    .join("transcribe-jobs")
                    .to_string_lossy()
                    .into_owned(),
                mirror_results: true,
            },
            gateway: GatewayConfig {
                unknown_job_as_pending: false,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_WORKER__DEFAULT_MODEL=small`: Override the default model
    /// - `APP_GATEWAY__UNKNOWN_JOB_AS_PENDING=true`: Legacy unknown-job behavior
    /// - `HOST=0.0.0.0` / `PORT=3000`: Deployment platform conventions
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Deployment platforms set these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - At least one worker, a non-empty default model, batch size above 0
    /// - Device and compute type strings are recognized
    /// - Queue capacity above 0
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.worker.worker_count == 0 {
            return Err(anyhow::anyhow!("Worker count must be greater than 0"));
        }

        if self.worker.default_model.trim().is_empty() {
            return Err(anyhow::anyhow!("Default model cannot be empty"));
        }

        if self.worker.default_batch_size == 0 {
            return Err(anyhow::anyhow!("Default batch size must be greater than 0"));
        }

        self.worker
            .device
            .parse::<DevicePreference>()
            .map_err(|e| anyhow::anyhow!(e))?;
        self.worker
            .compute_type
            .parse::<ComputePrecision>()
            .map_err(|e| anyhow::anyhow!(e))?;

        if self.queue.capacity == 0 {
            return Err(anyhow::anyhow!("Queue capacity must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only `gateway` values apply to the running service, e.g.
    /// `{"gateway": {"unknown_job_as_pending": true}}`. Server, worker, queue and
    /// storage settings are fixed at startup, so an update naming any other
    /// section is rejected as a whole and nothing changes.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let sections = partial_config
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("Config update must be a JSON object"))?;

        if let Some(section) = sections.keys().find(|key| *key != "gateway") {
            return Err(anyhow::anyhow!(
                "Section '{}' cannot be changed at runtime; set it in config.toml or APP_ variables and restart",
                section
            ));
        }

        let mut updated = self.clone();

        if let Some(value) = partial_config
            .get("gateway")
            .and_then(|g| g.get("unknown_job_as_pending"))
        {
            updated.gateway.unknown_job_as_pending = value.as_bool().ok_or_else(|| {
                anyhow::anyhow!("gateway.unknown_job_as_pending must be a boolean")
            })?;
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Settings handed to every worker at startup.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            default_model: self.worker.default_model.clone(),
            device: self.worker.device.clone(),
            compute_type: self.worker.compute_type.clone(),
            default_batch_size: self.worker.default_batch_size,
            mirror_results: self.storage.mirror_results,
            warmup: self.worker.warmup,
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
        }
    }
}
