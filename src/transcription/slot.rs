//! # Model Slot Manager
//!
//! Owns the single resident speech engine (and the single resident alignment
//! model) of one worker. Swapping an engine takes seconds, so the manager keeps
//! the current one for as long as consecutive jobs ask for the same key.
//!
//! ## Policy:
//! - **ensure(key)**: same key → reuse; different key → release, reclaim, load
//! - **ensure_alignment(lang)**: same policy, keyed only on the language code
//! - **release()**: drop both handles and reclaim; safe to call repeatedly
//!
//! The manager is constructed per worker and passed into the pipeline
//! explicitly; the handles it holds never leave the worker that owns it.

use crate::transcription::capability::{CapabilityError, EngineKey, Transcriber};
use std::time::Instant;

pub struct ModelSlotManager<T: Transcriber> {
    transcriber: T,
    engine: Option<(EngineKey, T::Engine)>,
    alignment: Option<(String, T::Alignment)>,
}

impl<T: Transcriber> ModelSlotManager<T> {
    /// An empty slot; nothing is loaded until the first `ensure`.
    pub fn new(transcriber: T) -> Self {
        Self {
            transcriber,
            engine: None,
            alignment: None,
        }
    }

    /// Return the engine for `key`, loading it if the resident one differs.
    pub fn ensure(&mut self, key: &EngineKey) -> Result<&mut T::Engine, CapabilityError> {
        let slot = match self.engine.take() {
            Some((resident, engine)) if resident == *key => {
                tracing::debug!(model = %key, "Reusing resident engine");
                (resident, engine)
            }
            previous => {
                if let Some((resident, engine)) = previous {
                    tracing::info!(from = %resident, to = %key, "Switching engine");
                    drop(engine);
                    self.transcriber.reclaim_memory();
                }

                tracing::info!(model = %key, "Loading engine");
                let started = Instant::now();
                let engine = self.transcriber.load_engine(key)?;
                tracing::info!(
                    model = %key,
                    load_secs = started.elapsed().as_secs_f64(),
                    "Engine loaded"
                );
                (key.clone(), engine)
            }
        };

        let (_, engine) = self.engine.insert(slot);
        Ok(engine)
    }

    /// Return the alignment model for `language_code`, replacing any other.
    pub fn ensure_alignment(
        &mut self,
        language_code: &str,
    ) -> Result<&mut T::Alignment, CapabilityError> {
        let slot = match self.alignment.take() {
            Some((resident, aligner)) if resident == language_code => (resident, aligner),
            previous => {
                if let Some((resident, aligner)) = previous {
                    tracing::info!(from = %resident, to = %language_code, "Switching alignment model");
                    drop(aligner);
                    self.transcriber.reclaim_memory();
                }

                tracing::info!(language = %language_code, "Loading alignment model");
                let aligner = self.transcriber.load_alignment(language_code)?;
                (language_code.to_string(), aligner)
            }
        };

        let (_, aligner) = self.alignment.insert(slot);
        Ok(aligner)
    }

    /// Drop every resident handle and reclaim device memory.
    pub fn release(&mut self) {
        let had_engine = self.engine.take().is_some();
        let had_alignment = self.alignment.take().is_some();
        if had_engine || had_alignment {
            tracing::info!("Model slot released");
            self.transcriber.reclaim_memory();
        }
    }

    pub fn resident_key(&self) -> Option<&EngineKey> {
        self.engine.as_ref().map(|(key, _)| key)
    }

    pub fn resident_language(&self) -> Option<&str> {
        self.alignment.as_ref().map(|(language, _)| language.as_str())
    }
}
