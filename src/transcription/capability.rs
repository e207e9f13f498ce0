//! # Capability Interfaces
//!
//! The control plane drives three external capabilities without knowing how
//! they work inside:
//! - **AudioNormalizer**: any input file → canonical 16 kHz mono samples
//! - **Transcriber**: loads speech engines and alignment models
//! - **SpeechEngine / Aligner**: the loaded handles that do the actual work
//!
//! All of them are blocking. Workers call them from dedicated blocking threads,
//! never from the async runtime.
//!
//! Version shims and runtime quirks belong in the adapters implementing these
//! traits (see `whisper.rs`, `aligner.rs`, `audio/normalizer.rs`).

use crate::jobs::model::Segment;
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Sample rate every engine consumes.
pub const SAMPLE_RATE: u32 = 16_000;

/// Identifies a loaded inference configuration.
///
/// Two jobs can share a resident engine only if their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineKey {
    /// Model variant, e.g. "large-v3-turbo"
    pub model: String,
    /// Compute device, e.g. "cuda", "cpu"
    pub device: String,
    /// Numeric precision, e.g. "float16"
    pub compute_type: String,
}

impl EngineKey {
    pub fn new(
        model: impl Into<String>,
        device: impl Into<String>,
        compute_type: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            device: device.into(),
            compute_type: compute_type.into(),
        }
    }
}

impl fmt::Display for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.model, self.device, self.compute_type)
    }
}

/// Failures raised by capability implementations.
///
/// The variants are the only distinctions the error classifier needs; adapters
/// map their own errors onto them.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// The compute device ran out of memory
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The input file is missing, unreadable, or not decodable audio
    #[error("input unavailable: {path}: {reason}")]
    InputUnavailable { path: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CapabilityError {
    /// Map a runtime error message, recognizing device out-of-memory reports.
    pub fn from_runtime(err: impl fmt::Display) -> Self {
        let message = err.to_string();
        if is_out_of_memory(&message) {
            CapabilityError::ResourceExhausted(message)
        } else {
            CapabilityError::Other(anyhow::anyhow!(message))
        }
    }

    pub fn input_unavailable(path: &Path, reason: impl fmt::Display) -> Self {
        CapabilityError::InputUnavailable {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// True when a runtime message describes device memory exhaustion.
pub fn is_out_of_memory(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("out of memory") || lower.contains("cuda_error_out_of_memory")
}

/// Canonical audio produced by the normalizer.
///
/// When backed by a temporary artifact, the file is removed as soon as this
/// value is dropped, on success and failure paths alike.
#[derive(Debug)]
pub struct NormalizedAudio {
    samples: Vec<f32>,
    path: Option<PathBuf>,
    artifact: Option<NamedTempFile>,
}

impl NormalizedAudio {
    /// Samples backed by a temporary file on disk.
    pub fn with_artifact(samples: Vec<f32>, artifact: NamedTempFile) -> Self {
        Self {
            samples,
            path: Some(artifact.path().to_path_buf()),
            artifact: Some(artifact),
        }
    }

    /// Samples held only in memory.
    pub fn in_memory(samples: Vec<f32>) -> Self {
        Self {
            samples,
            path: None,
            artifact: None,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Location of the canonical artifact, if one was written.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / SAMPLE_RATE as f64
    }
}

/// Engine output before formatting.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTranscript {
    pub segments: Vec<Segment>,
    /// Hinted or detected language code
    pub language: String,
}

pub trait AudioNormalizer: Send {
    fn normalize(&self, path: &Path) -> Result<NormalizedAudio, CapabilityError>;
}

/// A loaded inference engine.
pub trait SpeechEngine: Send {
    fn transcribe(
        &mut self,
        audio: &NormalizedAudio,
        batch_size: usize,
        language: Option<&str>,
    ) -> Result<RawTranscript, CapabilityError>;
}

/// A loaded alignment model for one language.
pub trait Aligner: Send {
    fn refine(
        &mut self,
        segments: Vec<Segment>,
        audio: &NormalizedAudio,
    ) -> Result<Vec<Segment>, CapabilityError>;
}

/// Factory for engines and alignment models.
pub trait Transcriber: Send {
    type Engine: SpeechEngine;
    type Alignment: Aligner;

    fn load_engine(&self, key: &EngineKey) -> Result<Self::Engine, CapabilityError>;

    fn load_alignment(&self, language_code: &str) -> Result<Self::Alignment, CapabilityError>;

    /// Ask the runtime to give freed device memory back. Called after a handle
    /// is dropped.
    fn reclaim_memory(&self) {}
}
