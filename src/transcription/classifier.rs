//! # Error Classifier
//!
//! The single funnel that turns a terminal pipeline failure into the
//! `ErrorRecord` stored on the job, and decides whether the worker's model slot
//! must be released before the next job.
//!
//! ## Mapping:
//! - device out-of-memory → `GPU_OOM`, slot released
//! - missing / unreadable input → `FILE_NOT_SUPPORTED`
//! - anything else → `UNKNOWN_ERROR` with the raw failure text

use crate::jobs::model::{ErrorCode, ErrorRecord};
use crate::jobs::store::StoreError;
use crate::transcription::capability::{is_out_of_memory, CapabilityError};
use thiserror::Error;

const GPU_OOM_MESSAGE: &str = "GPU Out of Memory. Please try a smaller model or batch size.";

/// Every way a job's pipeline can end in failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("job store rejected update: {0}")]
    Store(#[from] StoreError),

    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// Outcome of classifying one failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub record: ErrorRecord,
    /// The worker must drop its resident models before taking the next job
    pub release_slot: bool,
}

pub fn classify(err: &PipelineError, file_path: &str) -> Classification {
    match err {
        PipelineError::Capability(CapabilityError::ResourceExhausted(_)) => oom(),
        PipelineError::Capability(CapabilityError::InputUnavailable { reason, .. }) => {
            Classification {
                record: ErrorRecord::new(
                    ErrorCode::FileNotSupported,
                    format!("Audio file not found or not supported: {} ({})", file_path, reason),
                ),
                release_slot: false,
            }
        }
        PipelineError::Capability(CapabilityError::Other(inner))
            if is_out_of_memory(&format!("{:#}", inner)) =>
        {
            oom()
        }
        PipelineError::Panicked(message) if is_out_of_memory(message) => oom(),
        PipelineError::Panicked(_) => Classification {
            record: ErrorRecord::new(ErrorCode::UnknownError, err.to_string()),
            // Whatever the slot held may be half torn down.
            release_slot: true,
        },
        other => Classification {
            record: ErrorRecord::new(ErrorCode::UnknownError, other.to_string()),
            release_slot: false,
        },
    }
}

fn oom() -> Classification {
    Classification {
        record: ErrorRecord::new(ErrorCode::GpuOom, GPU_OOM_MESSAGE),
        release_slot: true,
    }
}
