//! # Energy Aligner
//!
//! Boundary refinement for transcribed segments. Each segment's start is moved
//! forward past leading low-energy frames and its end is pulled back before
//! trailing ones, so timestamps hug the speech inside the decoded window.
//!
//! An aligner is loaded per language, like a phoneme alignment model would be;
//! languages outside [`SUPPORTED_LANGUAGES`] fail to load, which the pipeline
//! treats as non-fatal.

use crate::jobs::model::Segment;
use crate::transcription::capability::{Aligner, CapabilityError, NormalizedAudio, SAMPLE_RATE};

/// Languages with an alignment model.
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "en", "fr", "de", "es", "it", "ja", "zh", "nl", "uk", "pt", "ar", "cs", "ru", "pl", "hu",
    "fi", "fa", "el", "tr", "da", "he", "vi", "ko", "ur", "te", "hi", "ca", "ml", "no", "nn",
    "sk", "sl", "hr", "ro", "eu", "gl", "ka", "lv", "tl",
];

/// 20 ms analysis frames at 16 kHz
const FRAME_LEN: usize = 320;
/// Frames quieter than this fraction of the mean frame energy count as silence
const RELATIVE_THRESHOLD: f32 = 0.1;
const ABSOLUTE_FLOOR: f32 = 1e-4;

#[derive(Debug, Clone)]
pub struct EnergyAligner {
    language: String,
}

impl EnergyAligner {
    pub fn for_language(language_code: &str) -> Result<Self, CapabilityError> {
        let language = language_code.to_lowercase();
        if !SUPPORTED_LANGUAGES.contains(&language.as_str()) {
            return Err(CapabilityError::Other(anyhow::anyhow!(
                "no alignment model for language '{}'",
                language_code
            )));
        }
        Ok(Self { language })
    }

    pub fn language(&self) -> &str {
        &self.language
    }
}

impl Aligner for EnergyAligner {
    fn refine(
        &mut self,
        segments: Vec<Segment>,
        audio: &NormalizedAudio,
    ) -> Result<Vec<Segment>, CapabilityError> {
        let energies = frame_energies(audio.samples());
        if energies.is_empty() {
            return Ok(segments);
        }
        let mean = energies.iter().sum::<f32>() / energies.len() as f32;
        let threshold = (mean * RELATIVE_THRESHOLD).max(ABSOLUTE_FLOOR);

        Ok(segments
            .into_iter()
            .map(|segment| refine_segment(segment, &energies, threshold))
            .collect())
    }
}

fn frame_energies(samples: &[f32]) -> Vec<f32> {
    samples
        .chunks(FRAME_LEN)
        .map(|frame| (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt())
        .collect()
}

fn frame_time(frame: usize) -> f64 {
    (frame * FRAME_LEN) as f64 / SAMPLE_RATE as f64
}

fn refine_segment(segment: Segment, energies: &[f32], threshold: f32) -> Segment {
    let frames_per_sec = SAMPLE_RATE as f64 / FRAME_LEN as f64;
    let first = ((segment.start_time.max(0.0) * frames_per_sec).floor() as usize).min(energies.len());
    let last = ((segment.end_time.max(0.0) * frames_per_sec).ceil() as usize).min(energies.len());
    if first >= last {
        return segment;
    }

    let window = &energies[first..last];
    let Some(lead) = window.iter().position(|e| *e >= threshold) else {
        // Nothing audible: leave the boundaries alone.
        return segment;
    };
    let trail = window.iter().rposition(|e| *e >= threshold).unwrap_or(lead);

    let start = frame_time(first + lead).max(segment.start_time);
    let end = frame_time(first + trail + 1).min(segment.end_time).max(start);
    Segment::new(start, end, segment.text)
}
