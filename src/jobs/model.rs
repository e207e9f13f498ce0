//! # Job Data Model
//!
//! The records the gateway and the workers exchange through the job store:
//! job status, segments, structured error records, and the per-job options
//! parsed out of the opaque submission map.
//!
//! ## Lifecycle:
//! PENDING → PROCESSING → SUCCESS | FAILURE
//!
//! Terminal records never change again. The store enforces this; the types here
//! only describe the data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Default inference batch size when the submission does not name one.
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// Opaque job identifier assigned at submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current position of a job in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Enqueued, not yet picked up by a worker
    Pending,
    /// A worker is executing the pipeline
    Processing,
    /// Terminal, carries a result
    Success,
    /// Terminal, carries an error record
    Failure,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed piece of transcript text.
///
/// Times are seconds from the start of the input. A formatted segment always
/// satisfies `end_time >= start_time >= 0` and has non-empty trimmed text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
}

impl Segment {
    pub fn new(start_time: f64, end_time: f64, text: impl Into<String>) -> Self {
        Self {
            start_time,
            end_time,
            text: text.into(),
        }
    }
}

/// Failure taxonomy surfaced to callers.
///
/// ## Wire codes:
/// Clients match on the `WORKER_xxx` strings, so those are what gets serialized.
/// - **GpuOom** (`WORKER_001`): device memory exhausted, retry with a smaller model or batch
/// - **FileNotSupported** (`WORKER_002`): input missing or unreadable, caller error
/// - **UnknownError** (`WORKER_999`): anything else, message is the raw failure text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "WORKER_001")]
    GpuOom,
    #[serde(rename = "WORKER_002")]
    FileNotSupported,
    #[serde(rename = "WORKER_999")]
    UnknownError,
}

impl ErrorCode {
    /// Code as sent to clients.
    pub fn wire_code(&self) -> &'static str {
        match self {
            ErrorCode::GpuOom => "WORKER_001",
            ErrorCode::FileNotSupported => "WORKER_002",
            ErrorCode::UnknownError => "WORKER_999",
        }
    }

    /// Symbolic name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::GpuOom => "GPU_OOM",
            ErrorCode::FileNotSupported => "FILE_NOT_SUPPORTED",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Whether resubmitting with different options can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCode::UnknownError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classified failure stored on a FAILURE record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Durable state of one submitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub file_path: String,
    pub status: JobStatus,
    /// 0.0 to 100.0, never decreases while processing
    pub progress: f64,
    /// Submission options exactly as received
    pub options: Value,
    pub result: Option<Vec<Segment>>,
    pub error: Option<ErrorRecord>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A freshly submitted job in the PENDING state.
    pub fn pending(id: JobId, file_path: impl Into<String>, options: Value) -> Self {
        Self {
            id,
            file_path: file_path.into(),
            status: JobStatus::Pending,
            progress: 0.0,
            options,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Caller-facing view of a job, serialized by the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<Segment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobStatusView {
    /// View for an ID the store has no record of.
    pub fn unknown_as_pending(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Pending,
            progress: 0.0,
            result: None,
            error_code: None,
            error_message: None,
        }
    }
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            status: job.status,
            progress: job.progress,
            result: job.result.clone(),
            error_code: job.error.as_ref().map(|e| e.code),
            error_message: job.error.as_ref().map(|e| e.message.clone()),
        }
    }
}

/// Options a worker recognizes in the opaque submission map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Requested model variant; `None` means "whatever is resident"
    pub model: Option<String>,
    pub batch_size: usize,
    pub align: bool,
    /// Language hint; `None` means auto-detect
    pub language: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            model: None,
            batch_size: DEFAULT_BATCH_SIZE,
            align: true,
            language: None,
        }
    }
}

impl JobOptions {
    /// Parse the recognized keys out of a submission map.
    ///
    /// `null` and missing keys take defaults, unknown keys are ignored. A present
    /// key with the wrong type is an error so a typo never silently changes
    /// behavior.
    pub fn parse(raw: &Value, default_batch_size: usize) -> Result<Self, String> {
        let mut options = JobOptions {
            batch_size: default_batch_size,
            ..JobOptions::default()
        };

        let map = match raw {
            Value::Null => return Ok(options),
            Value::Object(map) => map,
            other => return Err(format!("options must be an object, got {}", other)),
        };

        if let Some(model) = non_null(map.get("model")) {
            let model = model
                .as_str()
                .ok_or_else(|| format!("invalid option model: {}", model))?
                .trim();
            if !model.is_empty() {
                options.model = Some(model.to_string());
            }
        }

        if let Some(batch) = non_null(map.get("batch_size")) {
            match batch.as_u64() {
                Some(n) if n >= 1 => options.batch_size = n as usize,
                _ => return Err(format!("invalid option batch_size: {}", batch)),
            }
        }

        if let Some(no_align) = non_null(map.get("no_align")) {
            let no_align = no_align
                .as_bool()
                .ok_or_else(|| format!("invalid option no_align: {}", no_align))?;
            options.align = !no_align;
        }

        if let Some(language) = non_null(map.get("language")) {
            let language = language
                .as_str()
                .ok_or_else(|| format!("invalid option language: {}", language))?
                .trim();
            if !language.is_empty() {
                options.language = Some(language.to_lowercase());
            }
        }

        Ok(options)
    }
}

fn non_null(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}
