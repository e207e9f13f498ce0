//! # Audio Module
//!
//! Input normalization ahead of transcription. Engines only ever see the
//! canonical format produced here:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Channels**: Mono (1 channel)
//! - **Samples**: 32-bit float in [-1.0, 1.0]

pub mod normalizer; // WAV decode, downmix, resample

pub use normalizer::WavNormalizer;
