//! # WAV Normalizer
//!
//! Turns an input WAV file into the canonical form every engine consumes:
//! 16 kHz, mono, f32 samples in [-1.0, 1.0]. The canonical audio is also
//! written as a 16-bit PCM WAV artifact in the configured temp directory; the
//! artifact lives exactly as long as the returned `NormalizedAudio`.

use crate::transcription::capability::{AudioNormalizer, CapabilityError, NormalizedAudio, SAMPLE_RATE};
use anyhow::Context;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct WavNormalizer {
    temp_dir: PathBuf,
}

impl WavNormalizer {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
        }
    }

    fn decode(&self, path: &Path) -> Result<Vec<f32>, CapabilityError> {
        if !path.is_file() {
            return Err(CapabilityError::input_unavailable(path, "No such file or directory"));
        }
        let mut reader =
            WavReader::open(path).map_err(|e| CapabilityError::input_unavailable(path, e))?;
        let spec = reader.spec();
        tracing::debug!(
            file = %path.display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            bits = spec.bits_per_sample,
            "Decoding WAV input"
        );

        let interleaved = match spec.sample_format {
            SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<Vec<f32>, _>>(),
            SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|sample| sample as f32 / scale))
                    .collect::<Result<Vec<f32>, _>>()
            }
        }
        .map_err(|e| CapabilityError::input_unavailable(path, e))?;

        let mono = downmix(&interleaved, spec.channels);
        Ok(resample_linear(&mono, spec.sample_rate, SAMPLE_RATE))
    }

    fn write_artifact(&self, samples: &[f32]) -> anyhow::Result<tempfile::NamedTempFile> {
        std::fs::create_dir_all(&self.temp_dir)
            .with_context(|| format!("failed to create {}", self.temp_dir.display()))?;
        let mut artifact = tempfile::Builder::new()
            .prefix("normalized-")
            .suffix(".wav")
            .tempfile_in(&self.temp_dir)
            .context("failed to create normalized artifact")?;

        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::new(artifact.as_file_mut(), spec)?;
        for sample in samples {
            writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
        Ok(artifact)
    }
}

impl AudioNormalizer for WavNormalizer {
    fn normalize(&self, path: &Path) -> Result<NormalizedAudio, CapabilityError> {
        let samples = self.decode(path)?;
        let artifact = self.write_artifact(&samples)?;
        Ok(NormalizedAudio::with_artifact(samples, artifact))
    }
}

/// Average interleaved frames down to one channel.
fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 | 1 => interleaved.to_vec(),
        n => interleaved
            .chunks_exact(n as usize)
            .map(|frame| frame.iter().sum::<f32>() / n as f32)
            .collect(),
    }
}

/// Linear-interpolation resampler.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i as f64 * step;
            let index = (position.floor() as usize).min(last);
            let next = (index + 1).min(last);
            let fraction = (position - index as f64) as f32;
            samples[index] + (samples[next] - samples[index]) * fraction
        })
        .collect()
}
