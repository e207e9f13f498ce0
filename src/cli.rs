//! # Command Line
//!
//! Without a subcommand the binary runs the HTTP service and its worker pool.
//! `transcribe` runs a single file through the same pipeline and model slot a
//! worker uses, writes the segments as JSON and unloads the model on exit.
//!
//! Flags left out fall back to the loaded configuration (`worker.*`).

use crate::config::AppConfig;
use crate::jobs::model::{Job, JobId, JobOptions, Segment};
use crate::jobs::store::{InMemoryJobStore, JobStore};
use crate::transcription::capability::{AudioNormalizer, EngineKey, Transcriber};
use crate::transcription::classifier::classify;
use crate::transcription::pipeline::{run_pipeline, write_result, PipelineRequest};
use crate::transcription::slot::ModelSlotManager;
use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "transcribe-jobs")]
#[command(about = "Asynchronous transcription job service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP service and worker pool (default)
    Serve,
    /// Transcribe one file and write the segments as JSON
    Transcribe(TranscribeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct TranscribeArgs {
    /// Input audio file path
    #[arg(long)]
    pub input: PathBuf,

    /// Output JSON path
    #[arg(long, default_value = "result.json")]
    pub output: PathBuf,

    /// Whisper model variant (default: worker.default_model)
    #[arg(long)]
    pub model: Option<String>,

    /// Execution device: auto, cpu, cuda or metal
    #[arg(long)]
    pub device: Option<String>,

    /// Numeric precision: float32, float16 or bfloat16
    #[arg(long)]
    pub compute_type: Option<String>,

    /// Windows per encoder pass
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Language code (ko, en, ...); detected when absent
    #[arg(long)]
    pub language: Option<String>,

    /// Skip the alignment stage
    #[arg(long)]
    pub no_align: bool,

    /// Load the model before the input is read
    #[arg(long)]
    pub warmup: bool,
}

/// A single transcription with flags and configuration merged.
#[derive(Debug, Clone)]
pub struct OneShot {
    pub input: PathBuf,
    pub output: PathBuf,
    pub key: EngineKey,
    pub options: JobOptions,
    pub warmup: bool,
}

impl TranscribeArgs {
    /// Overlay the flags on `config.worker` and validate the result the same
    /// way startup configuration is validated.
    pub fn resolve(&self, config: &AppConfig) -> Result<OneShot> {
        let mut config = config.clone();
        if let Some(model) = &self.model {
            config.worker.default_model = model.clone();
        }
        if let Some(device) = &self.device {
            config.worker.device = device.clone();
        }
        if let Some(compute_type) = &self.compute_type {
            config.worker.compute_type = compute_type.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.worker.default_batch_size = batch_size;
        }
        config.validate()?;

        let settings = config.worker_settings();
        Ok(OneShot {
            input: self.input.clone(),
            output: self.output.clone(),
            key: settings.default_key(),
            options: JobOptions {
                model: Some(settings.default_model.clone()),
                batch_size: settings.default_batch_size,
                align: !self.no_align,
                language: self.language.clone(),
            },
            warmup: self.warmup,
        })
    }
}

/// Run one file through the pipeline and write its segments to `run.output`.
///
/// The slot is released before returning, whether the run succeeded or not.
/// An empty transcript is reported but not written.
pub fn transcribe_file<T, N>(transcriber: T, normalizer: &N, run: &OneShot) -> Result<Vec<Segment>>
where
    T: Transcriber,
    N: AudioNormalizer + ?Sized,
{
    if !run.input.exists() {
        bail!("Input file not found: {}", run.input.display());
    }
    let file_path = run.input.to_string_lossy().into_owned();

    let mut slot = ModelSlotManager::new(transcriber);
    if run.warmup {
        info!(model = %run.key, "Warming up model");
        if let Err(e) = slot.ensure(&run.key) {
            slot.release();
            return Err(e.into());
        }
    }

    // A private store gives the pipeline somewhere to report progress
    let store = InMemoryJobStore::new();
    let job_id = JobId::generate();
    store.create(Job::pending(job_id.clone(), &file_path, Value::Null))?;
    store.mark_processing(&job_id)?;

    let started = Instant::now();
    let request = PipelineRequest {
        job_id: &job_id,
        file_path: &file_path,
        options: &run.options,
        engine_key: run.key.clone(),
    };
    let result = run_pipeline(&mut slot, normalizer, &store, &request);
    slot.release();

    let segments = match result {
        Ok(segments) => segments,
        Err(err) => {
            let classification = classify(&err, &file_path);
            bail!(
                "{} [{}]: {}",
                classification.record.message,
                classification.record.code.wire_code(),
                err
            );
        }
    };
    info!(
        segments = segments.len(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Total processed"
    );

    if segments.is_empty() {
        warn!(input = %file_path, "No speech found, nothing written");
    } else {
        write_result(&run.output, &segments)?;
        info!(path = %run.output.display(), "Saved results");
    }
    Ok(segments)
}
