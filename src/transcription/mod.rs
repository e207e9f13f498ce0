//! # Transcription Module
//!
//! The worker side of the service: everything between pulling a work item and
//! writing the job's terminal state.
//!
//! ## Key Components:
//! - **Capabilities**: traits for the normalizer, engine and aligner
//! - **Slot Manager**: one resident engine per worker, reused across jobs
//! - **Pipeline**: normalize → transcribe → align → format
//! - **Classifier**: failure → stored error code
//! - **Worker**: the blocking loop tying the above to the queue and store
//!
//! ## Adapters:
//! - **whisper**: candle Whisper engine, weights from the HuggingFace hub
//! - **aligner**: energy-based boundary refinement per language

pub mod aligner;
pub mod capability;
pub mod classifier;
pub mod pipeline;
pub mod slot;
pub mod whisper;
pub mod worker;

pub use whisper::WhisperTranscriber;
pub use worker::spawn_workers;
