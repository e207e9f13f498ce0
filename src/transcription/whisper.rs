//! # Whisper Engine (Candle)
//!
//! `Transcriber` implementation backed by candle's Whisper model. Weights,
//! config and tokenizer are fetched from the HuggingFace hub (cached locally by
//! hf-hub) the first time a variant is requested.
//!
//! ## Decoding:
//! 1. Log-mel spectrogram of the whole input
//! 2. Split into 30 s windows (3000 mel frames)
//! 3. Encode `batch_size` windows per encoder pass
//! 4. Greedy-decode each window without timestamps; one segment per window
//!
//! The language is the caller's hint when given, otherwise it is detected from
//! the first window. English-only variants (`*.en`) always report "en".

use crate::device::{create_device_from_string, ComputePrecision};
use crate::jobs::model::Segment;
use crate::transcription::aligner::EnergyAligner;
use crate::transcription::capability::{
    CapabilityError, EngineKey, NormalizedAudio, RawTranscript, SpeechEngine, Transcriber,
};
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use std::path::PathBuf;
use tokenizers::Tokenizer;

/// Language codes Whisper has a `<|xx|>` token for.
pub const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su",
];

/// HuggingFace repository for a model variant name. Names containing a `/`
/// are taken as repository IDs as-is.
pub fn repo_for_model(model: &str) -> Result<String, CapabilityError> {
    if model.contains('/') {
        return Ok(model.to_string());
    }
    let repo = match model.to_lowercase().as_str() {
        "tiny" => "openai/whisper-tiny",
        "tiny.en" => "openai/whisper-tiny.en",
        "base" => "openai/whisper-base",
        "base.en" => "openai/whisper-base.en",
        "small" => "openai/whisper-small",
        "small.en" => "openai/whisper-small.en",
        "medium" => "openai/whisper-medium",
        "medium.en" => "openai/whisper-medium.en",
        "large-v1" => "openai/whisper-large",
        "large-v2" => "openai/whisper-large-v2",
        "large" | "large-v3" => "openai/whisper-large-v3",
        "large-v3-turbo" | "turbo" => "openai/whisper-large-v3-turbo",
        "distil-large-v3" => "distil-whisper/distil-large-v3",
        "distil-medium.en" => "distil-whisper/distil-medium.en",
        _ => {
            return Err(CapabilityError::Other(anyhow!(
                "unknown model variant '{}'",
                model
            )))
        }
    };
    Ok(repo.to_string())
}

fn is_multilingual(model: &str) -> bool {
    !model.to_lowercase().ends_with(".en")
}

/// Slaney-style mel filterbank, `n_mels` rows of `n_fft / 2 + 1` weights.
pub fn mel_filters(n_mels: usize, n_fft: usize, sample_rate: u32) -> Vec<f32> {
    let n_bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;
    let fft_freqs: Vec<f64> = (0..n_bins)
        .map(|k| k as f64 * nyquist / (n_bins - 1) as f64)
        .collect();

    let max_mel = hz_to_mel(nyquist);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_bins];
    for row in 0..n_mels {
        let (lower, center, upper) = (mel_points[row], mel_points[row + 1], mel_points[row + 2]);
        let norm = 2.0 / (upper - lower);
        for (k, freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[row * n_bins + k] = (weight * norm) as f32;
        }
    }
    filters
}

const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = 15.0;
const LINEAR_STEP: f64 = 200.0 / 3.0;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz < MIN_LOG_HZ {
        hz / LINEAR_STEP
    } else {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel < MIN_LOG_MEL {
        mel * LINEAR_STEP
    } else {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    }
}

/// `(start_frame, frame_count)` for each 30 s window over `content_frames`.
pub fn plan_windows(content_frames: usize) -> Vec<(usize, usize)> {
    (0..content_frames)
        .step_by(m::N_FRAMES)
        .map(|start| (start, m::N_FRAMES.min(content_frames - start)))
        .collect()
}

fn frames_to_secs(frames: usize) -> f64 {
    (frames * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64
}

/// Loads candle Whisper engines; alignment models are [`EnergyAligner`]s.
#[derive(Debug, Clone, Default)]
pub struct WhisperTranscriber {
    token: Option<String>,
    cache_dir: Option<PathBuf>,
}

impl WhisperTranscriber {
    /// Hub access configured from `HF_TOKEN`, `HF_HUB_CACHE` and `HF_HOME`.
    pub fn from_env() -> Self {
        let token = std::env::var("HF_TOKEN").ok();
        let cache_dir = std::env::var("HF_HUB_CACHE")
            .map(PathBuf::from)
            .or_else(|_| std::env::var("HF_HOME").map(|home| PathBuf::from(home).join("hub")))
            .ok();
        Self { token, cache_dir }
    }

    fn fetch(&self, repo_id: &str) -> Result<(PathBuf, PathBuf, PathBuf)> {
        let mut builder = hf_hub::api::sync::ApiBuilder::new()
            .with_progress(false)
            .with_token(self.token.clone());
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        let api = builder.build().context("failed to create HuggingFace API client")?;
        let repo = api.model(repo_id.to_string());

        let config = repo
            .get("config.json")
            .with_context(|| format!("failed to download config.json from {}", repo_id))?;
        let tokenizer = repo
            .get("tokenizer.json")
            .with_context(|| format!("failed to download tokenizer.json from {}", repo_id))?;
        let weights = repo
            .get("model.safetensors")
            .with_context(|| format!("failed to download model.safetensors from {}", repo_id))?;
        Ok((config, tokenizer, weights))
    }

    fn load(&self, key: &EngineKey) -> Result<WhisperEngine> {
        let repo_id = repo_for_model(&key.model)?;
        let device = create_device_from_string(&key.device);
        let precision: ComputePrecision = key.compute_type.parse().map_err(|e: String| anyhow!(e))?;
        let dtype = precision.dtype_for(&device);

        let (config_path, tokenizer_path, weights_path) = self.fetch(&repo_id)?;
        let config: Config = serde_json::from_reader(std::fs::File::open(&config_path)?)
            .context("invalid Whisper config.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("failed to load tokenizer: {}", e))?;

        // SAFETY: the weights file is owned by the hub cache and not modified
        // while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let tokens = SpecialTokens::from_tokenizer(&tokenizer)?;
        let filters = mel_filters(config.num_mel_bins, m::N_FFT, m::SAMPLE_RATE as u32);

        Ok(WhisperEngine {
            multilingual: is_multilingual(&key.model),
            model,
            config,
            tokenizer,
            tokens,
            filters,
            device,
            dtype,
        })
    }
}

impl Transcriber for WhisperTranscriber {
    type Engine = WhisperEngine;
    type Alignment = EnergyAligner;

    fn load_engine(&self, key: &EngineKey) -> Result<WhisperEngine, CapabilityError> {
        self.load(key)
            .map_err(|e| CapabilityError::from_runtime(format!("{:#}", e)))
    }

    fn load_alignment(&self, language_code: &str) -> Result<EnergyAligner, CapabilityError> {
        EnergyAligner::for_language(language_code)
    }

    fn reclaim_memory(&self) {
        // candle returns device buffers when the last tensor referencing them
        // drops; nothing is cached on our side.
        tracing::debug!("Engine handles dropped, device memory returned to allocator");
    }
}

#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
}

impl SpecialTokens {
    fn from_tokenizer(tokenizer: &Tokenizer) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("tokenizer has no {} token", token))
        };
        Ok(Self {
            sot: id(m::SOT_TOKEN)?,
            eot: id(m::EOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            no_timestamps: id(m::NO_TIMESTAMPS_TOKEN)?,
        })
    }
}

/// A loaded Whisper model on one device.
pub struct WhisperEngine {
    model: m::model::Whisper,
    config: Config,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    filters: Vec<f32>,
    device: Device,
    dtype: DType,
    multilingual: bool,
}

impl WhisperEngine {
    fn language_token(&self, code: &str) -> Option<u32> {
        self.tokenizer.token_to_id(&format!("<|{}|>", code))
    }

    /// Most likely language for one window's encoder output.
    fn detect_language(&mut self, features: &Tensor) -> Result<String> {
        let candidates: Vec<(&str, u32)> = LANGUAGES
            .iter()
            .filter_map(|code| self.language_token(code).map(|id| (*code, id)))
            .collect();

        let tokens = Tensor::new(&[self.tokens.sot], &self.device)?.unsqueeze(0)?;
        let ys = self.model.decoder.forward(&tokens, features, true)?;
        let logits = self
            .model
            .decoder
            .final_linear(&ys.i((..1, ..1))?)?
            .i(0)?
            .i(0)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;

        candidates
            .into_iter()
            .filter_map(|(code, id)| logits.get(id as usize).map(|score| (code, *score)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(code, _)| code.to_string())
            .ok_or_else(|| anyhow!("language detection produced no candidates"))
    }

    /// Greedy decode of one window given its encoder output.
    fn decode_window(&mut self, features: &Tensor, language: &str) -> Result<String> {
        let mut tokens = vec![self.tokens.sot];
        if self.multilingual {
            let language_token = self
                .language_token(language)
                .ok_or_else(|| anyhow!("unsupported language '{}'", language))?;
            tokens.push(language_token);
        }
        tokens.push(self.tokens.transcribe);
        tokens.push(self.tokens.no_timestamps);
        let prompt_len = tokens.len();
        let max_tokens = self.config.max_target_positions / 2;

        for i in 0..max_tokens {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .to_dtype(DType::F32)?;
            let next = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;
            if next == self.tokens.eot || tokens.len() > self.config.max_target_positions {
                break;
            }
            tokens.push(next);
        }

        self.tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|e| anyhow!("tokenizer decode error: {}", e))
    }

    fn run(
        &mut self,
        samples: &[f32],
        batch_size: usize,
        language: Option<&str>,
    ) -> Result<RawTranscript> {
        let mut language = match (language, self.multilingual) {
            (_, false) => Some("en".to_string()),
            (Some(hint), true) => Some(hint.to_lowercase()),
            (None, true) => None,
        };
        if samples.is_empty() {
            return Ok(RawTranscript {
                segments: Vec::new(),
                language: language.unwrap_or_else(|| "en".to_string()),
            });
        }

        let n_mels = self.config.num_mel_bins;
        let mel = audio::pcm_to_mel(&self.config, samples, &self.filters);
        let mel_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_frames), &self.device)?.to_dtype(self.dtype)?;
        let content_frames = (samples.len() / m::HOP_LENGTH).min(mel_frames);

        let windows = plan_windows(content_frames);
        let mut segments = Vec::with_capacity(windows.len());

        for batch in windows.chunks(batch_size.max(1)) {
            let inputs = batch
                .iter()
                .map(|&(start, len)| {
                    mel.narrow(2, start, len)?
                        .pad_with_zeros(D::Minus1, 0, m::N_FRAMES - len)
                })
                .collect::<candle_core::Result<Vec<_>>>()?;
            let inputs = Tensor::cat(&inputs, 0)?;
            let features = self.model.encoder.forward(&inputs, true)?;

            for (index, &(start, len)) in batch.iter().enumerate() {
                let window_features = features.i(index..index + 1)?;
                let code = match &language {
                    Some(code) => code.clone(),
                    None => {
                        let detected = self.detect_language(&window_features)?;
                        tracing::info!(language = %detected, "Detected language");
                        language = Some(detected.clone());
                        detected
                    }
                };
                let text = self.decode_window(&window_features, &code)?;
                tracing::debug!(
                    start = frames_to_secs(start),
                    chars = text.len(),
                    "Decoded window"
                );
                segments.push(Segment::new(
                    frames_to_secs(start),
                    frames_to_secs(start + len),
                    text,
                ));
            }
        }

        Ok(RawTranscript {
            segments,
            language: language.unwrap_or_else(|| "en".to_string()),
        })
    }
}

impl SpeechEngine for WhisperEngine {
    fn transcribe(
        &mut self,
        audio: &NormalizedAudio,
        batch_size: usize,
        language: Option<&str>,
    ) -> Result<RawTranscript, CapabilityError> {
        self.run(audio.samples(), batch_size, language)
            .map_err(|e| CapabilityError::from_runtime(format!("{:#}", e)))
    }
}
