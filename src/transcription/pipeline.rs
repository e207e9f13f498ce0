//! # Transcription Pipeline
//!
//! The fixed stage sequence one job goes through:
//!
//! 1. **Normalize**: input file → canonical audio (temp artifact)
//! 2. **Acquire engine**: `ModelSlotManager::ensure`
//! 3. **Transcribe**: checkpoint 20 before inference starts
//! 4. **Align** (optional): failures fall back to unaligned segments; checkpoint 90
//! 5. **Format**: millisecond rounding, trimming, ordering
//!
//! Persisting the result (SUCCESS, progress 100) is the worker's job. Any stage
//! error short-circuits the rest; the normalized artifact is dropped on every
//! exit path because it lives on this function's stack.

use crate::jobs::model::{JobId, JobOptions, Segment};
use crate::jobs::store::JobStore;
use crate::transcription::capability::{
    Aligner, AudioNormalizer, EngineKey, SpeechEngine, Transcriber,
};
use crate::transcription::classifier::PipelineError;
use crate::transcription::slot::ModelSlotManager;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Progress written once the engine is resident and inference begins.
pub const CHECKPOINT_TRANSCRIBING: f64 = 20.0;
/// Progress written once transcription (and alignment, if any) is done.
pub const CHECKPOINT_TRANSCRIBED: f64 = 90.0;

/// Everything the pipeline needs to know about the job it runs.
#[derive(Debug, Clone)]
pub struct PipelineRequest<'a> {
    pub job_id: &'a JobId,
    pub file_path: &'a str,
    pub options: &'a JobOptions,
    pub engine_key: EngineKey,
}

/// Run stages 1-5 for one job and return the formatted segments.
pub fn run_pipeline<T, N>(
    slot: &mut ModelSlotManager<T>,
    normalizer: &N,
    store: &dyn JobStore,
    request: &PipelineRequest<'_>,
) -> Result<Vec<Segment>, PipelineError>
where
    T: Transcriber,
    N: AudioNormalizer + ?Sized,
{
    let job_id = request.job_id;

    let audio = normalizer.normalize(Path::new(request.file_path))?;
    tracing::debug!(
        job_id = %job_id,
        duration_secs = audio.duration_secs(),
        "Audio normalized"
    );

    let engine = slot.ensure(&request.engine_key)?;
    store.update_progress(job_id, CHECKPOINT_TRANSCRIBING)?;

    tracing::info!(
        job_id = %job_id,
        model = %request.engine_key,
        language = request.options.language.as_deref().unwrap_or("auto"),
        batch_size = request.options.batch_size,
        "Transcribing"
    );
    let raw = engine.transcribe(
        &audio,
        request.options.batch_size,
        request.options.language.as_deref(),
    )?;
    tracing::info!(
        job_id = %job_id,
        segments = raw.segments.len(),
        language = %raw.language,
        "Transcription finished"
    );

    let segments = if request.options.align {
        let aligned = slot
            .ensure_alignment(&raw.language)
            .and_then(|aligner| aligner.refine(raw.segments.clone(), &audio));
        match aligned {
            Ok(segments) => segments,
            Err(e) => {
                tracing::warn!(
                    job_id = %job_id,
                    language = %raw.language,
                    error = %e,
                    "Alignment failed, keeping unaligned segments"
                );
                raw.segments
            }
        }
    } else {
        raw.segments
    };
    store.update_progress(job_id, CHECKPOINT_TRANSCRIBED)?;

    Ok(format_segments(segments))
}

/// Round times to milliseconds, trim text, drop empty segments, sort by start.
///
/// Negative times are clamped to zero and an end before its start is pulled up
/// to the start, so every returned segment satisfies `end >= start >= 0`.
pub fn format_segments(segments: Vec<Segment>) -> Vec<Segment> {
    let mut formatted: Vec<Segment> = segments
        .into_iter()
        .filter_map(|segment| {
            let text = segment.text.trim();
            if text.is_empty() {
                return None;
            }
            let start = round_ms(segment.start_time.max(0.0));
            let end = round_ms(segment.end_time.max(0.0)).max(start);
            if !start.is_finite() || !end.is_finite() {
                return None;
            }
            Some(Segment::new(start, end, text))
        })
        .collect();

    formatted.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
    formatted
}

fn round_ms(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

/// Where the mirrored result for `file_path` is written: `<stem>_result.json`
/// next to the input.
pub fn mirror_path(file_path: &str) -> PathBuf {
    let path = Path::new(file_path);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    path.with_file_name(format!("{}_result.json", stem))
}

/// Write the segments as pretty JSON next to the input file.
pub fn mirror_result(file_path: &str, segments: &[Segment]) -> Result<PathBuf> {
    let output = mirror_path(file_path);
    write_result(&output, segments)?;
    Ok(output)
}

/// Write the segments as pretty JSON to `output`.
pub fn write_result(output: &Path, segments: &[Segment]) -> Result<()> {
    let json = serde_json::to_string_pretty(segments)?;
    std::fs::write(output, json).with_context(|| format!("failed to write {}", output.display()))
}
