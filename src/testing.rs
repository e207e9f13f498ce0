//! Counting test doubles for the capability traits.

use crate::jobs::model::Segment;
use crate::transcription::capability::{
    Aligner, AudioNormalizer, CapabilityError, EngineKey, NormalizedAudio, RawTranscript,
    SpeechEngine, Transcriber,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeCounters {
    pub engine_loads: u64,
    pub engine_drops: u64,
    pub live_engines: u64,
    pub max_live_engines: u64,
    pub alignment_loads: u64,
    pub alignment_drops: u64,
    pub reclaims: u64,
    pub transcribe_calls: u64,
    pub refine_calls: u64,
    pub last_batch_size: Option<usize>,
    pub last_language_hint: Option<String>,
}

#[derive(Default)]
struct FakeState {
    counters: FakeCounters,
    fail_next_load: Option<CapabilityError>,
    fail_next_transcribe: Option<CapabilityError>,
    fail_refine: bool,
    panic_on_transcribe: bool,
    detected_language: Option<String>,
    loaded_keys: Vec<EngineKey>,
}

/// Transcriber double whose handles report into shared counters.
#[derive(Clone, Default)]
pub struct FakeTranscriber {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTranscriber {
    pub fn counters(&self) -> FakeCounters {
        self.state.lock().counters.clone()
    }

    pub fn loaded_keys(&self) -> Vec<EngineKey> {
        self.state.lock().loaded_keys.clone()
    }

    pub fn fail_next_load(&self, err: CapabilityError) {
        self.state.lock().fail_next_load = Some(err);
    }

    pub fn fail_next_transcribe(&self, err: CapabilityError) {
        self.state.lock().fail_next_transcribe = Some(err);
    }

    pub fn fail_refine(&self, fail: bool) {
        self.state.lock().fail_refine = fail;
    }

    /// Make every `transcribe` call panic until switched off.
    pub fn panic_on_transcribe(&self, enabled: bool) {
        self.state.lock().panic_on_transcribe = enabled;
    }

    pub fn set_detected_language(&self, language: &str) {
        self.state.lock().detected_language = Some(language.to_string());
    }
}

pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.counters.engine_drops += 1;
        state.counters.live_engines -= 1;
    }
}

impl SpeechEngine for FakeEngine {
    fn transcribe(
        &mut self,
        _audio: &NormalizedAudio,
        batch_size: usize,
        language: Option<&str>,
    ) -> Result<RawTranscript, CapabilityError> {
        let mut state = self.state.lock();
        state.counters.transcribe_calls += 1;
        state.counters.last_batch_size = Some(batch_size);
        state.counters.last_language_hint = language.map(str::to_string);
        if state.panic_on_transcribe {
            drop(state);
            panic!("engine exploded");
        }
        if let Some(err) = state.fail_next_transcribe.take() {
            return Err(err);
        }
        let segments = vec![
            Segment::new(0.0, 1.2344, "  hello there "),
            Segment::new(1.2344, 2.5, "general kenobi"),
        ];
        let language = language
            .map(str::to_string)
            .or_else(|| state.detected_language.clone())
            .unwrap_or_else(|| "en".to_string());
        Ok(RawTranscript { segments, language })
    }
}

pub struct FakeAligner {
    state: Arc<Mutex<FakeState>>,
}

impl Drop for FakeAligner {
    fn drop(&mut self) {
        self.state.lock().counters.alignment_drops += 1;
    }
}

impl Aligner for FakeAligner {
    fn refine(
        &mut self,
        segments: Vec<Segment>,
        _audio: &NormalizedAudio,
    ) -> Result<Vec<Segment>, CapabilityError> {
        let mut state = self.state.lock();
        state.counters.refine_calls += 1;
        if state.fail_refine {
            return Err(CapabilityError::Other(anyhow::anyhow!("alignment exploded")));
        }
        Ok(segments
            .into_iter()
            .map(|s| Segment::new(s.start_time + 0.1, s.end_time, s.text))
            .collect())
    }
}

impl Transcriber for FakeTranscriber {
    type Engine = FakeEngine;
    type Alignment = FakeAligner;

    fn load_engine(&self, key: &EngineKey) -> Result<FakeEngine, CapabilityError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next_load.take() {
            return Err(err);
        }
        state.counters.engine_loads += 1;
        state.counters.live_engines += 1;
        state.counters.max_live_engines = state
            .counters
            .max_live_engines
            .max(state.counters.live_engines);
        state.loaded_keys.push(key.clone());
        Ok(FakeEngine {
            state: Arc::clone(&self.state),
        })
    }

    fn load_alignment(&self, language_code: &str) -> Result<FakeAligner, CapabilityError> {
        let mut state = self.state.lock();
        if language_code == "xx" {
            return Err(CapabilityError::Other(anyhow::anyhow!(
                "no alignment model for language xx"
            )));
        }
        state.counters.alignment_loads += 1;
        Ok(FakeAligner {
            state: Arc::clone(&self.state),
        })
    }

    fn reclaim_memory(&self) {
        self.state.lock().counters.reclaims += 1;
    }
}

/// Normalizer double: existing files succeed with one second of silence backed
/// by a real temp artifact; missing files fail like the real one.
#[derive(Clone, Default)]
pub struct FakeNormalizer {
    artifacts: Arc<Mutex<Vec<PathBuf>>>,
    calls: Arc<Mutex<u64>>,
}

impl FakeNormalizer {
    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.artifacts.lock().clone()
    }

    pub fn calls(&self) -> u64 {
        *self.calls.lock()
    }
}

impl AudioNormalizer for FakeNormalizer {
    fn normalize(&self, path: &Path) -> Result<NormalizedAudio, CapabilityError> {
        *self.calls.lock() += 1;
        if !path.exists() {
            return Err(CapabilityError::input_unavailable(path, "No such file or directory"));
        }
        let artifact = tempfile::NamedTempFile::new().map_err(anyhow::Error::from)?;
        self.artifacts.lock().push(artifact.path().to_path_buf());
        Ok(NormalizedAudio::with_artifact(vec![0.0; 32_000], artifact))
    }
}
