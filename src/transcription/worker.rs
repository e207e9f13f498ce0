//! # Worker Loop
//!
//! Pulls one work item at a time from the task queue, drives the pipeline with
//! the worker's own model slot, and writes the job's lifecycle into the store.
//!
//! ## Per-job sequence:
//! 1. PENDING → PROCESSING (progress 0); a job that is not PENDING is skipped
//! 2. Parse options, resolve the engine key, run the pipeline
//! 3. SUCCESS (progress 100) with the result, or FAILURE via the classifier
//! 4. Ack the delivery
//!
//! A worker never runs two jobs at once. Parallelism comes from running several
//! workers, each with its own slot and its own resident engine. Once a job is
//! picked up it runs to a terminal state; there is no mid-job cancellation.

use crate::jobs::model::{ErrorRecord, JobOptions};
use crate::jobs::queue::{TaskQueue, WorkItem};
use crate::jobs::store::JobStore;
use crate::transcription::capability::{AudioNormalizer, CapabilityError, EngineKey, Transcriber};
use crate::transcription::classifier::{classify, PipelineError};
use crate::transcription::pipeline::{mirror_result, run_pipeline, PipelineRequest};
use crate::transcription::slot::ModelSlotManager;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Worker behavior taken from configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Model used when a job names none and nothing is resident
    pub default_model: String,
    pub device: String,
    pub compute_type: String,
    pub default_batch_size: usize,
    /// Write `<stem>_result.json` next to each successful input
    pub mirror_results: bool,
    /// Load the default model before taking the first job
    pub warmup: bool,
    /// How long one queue pull blocks before re-checking for shutdown
    pub poll_interval: Duration,
}

impl WorkerSettings {
    pub fn default_key(&self) -> EngineKey {
        EngineKey::new(&self.default_model, &self.device, &self.compute_type)
    }
}

/// What happened to one pulled item.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded { segments: usize },
    Failed(ErrorRecord),
    /// The job was not PENDING (redelivered or already handled)
    Skipped,
}

pub struct Worker<T: Transcriber, N: AudioNormalizer> {
    id: usize,
    slot: ModelSlotManager<T>,
    normalizer: N,
    store: Arc<dyn JobStore>,
    queue: TaskQueue,
    settings: WorkerSettings,
}

impl<T: Transcriber, N: AudioNormalizer> Worker<T, N> {
    pub fn new(
        id: usize,
        transcriber: T,
        normalizer: N,
        store: Arc<dyn JobStore>,
        queue: TaskQueue,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            slot: ModelSlotManager::new(transcriber),
            normalizer,
            store,
            queue,
            settings,
        }
    }

    /// Load the default engine ahead of the first job.
    pub fn warmup(&mut self) -> Result<(), CapabilityError> {
        let key = self.settings.default_key();
        tracing::info!(worker = self.id, model = %key, "Warming up model slot");
        self.slot.ensure(&key).map(|_| ())
    }

    /// Run until `shutdown` is cancelled or the queue closes.
    pub fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(worker = self.id, "Worker started, waiting for jobs");

        if self.settings.warmup {
            if let Err(e) = self.warmup() {
                tracing::error!(worker = self.id, error = %e, "Warmup failed, continuing with empty slot");
                self.slot.release();
            }
        }

        loop {
            if shutdown.is_cancelled() {
                tracing::info!(worker = self.id, "Worker shutting down (cancellation requested)");
                break;
            }
            match self.queue.pull(self.settings.poll_interval) {
                Some(delivery) => {
                    self.handle(delivery.item());
                    delivery.ack();
                }
                None if self.queue.stats().closed => {
                    tracing::info!(worker = self.id, "Worker shutting down (queue closed)");
                    break;
                }
                None => continue,
            }
        }

        self.slot.release();
    }

    /// Pull and handle at most one item, waiting up to `timeout`.
    pub fn process_next(&mut self, timeout: Duration) -> Option<JobOutcome> {
        let delivery = self.queue.pull(timeout)?;
        let outcome = self.handle(delivery.item());
        delivery.ack();
        Some(outcome)
    }

    /// Execute one job to a terminal state.
    pub fn handle(&mut self, item: &WorkItem) -> JobOutcome {
        let job_id = &item.job_id;

        if let Err(e) = self.store.mark_processing(job_id) {
            tracing::warn!(
                worker = self.id,
                job_id = %job_id,
                redeliveries = item.redeliveries,
                error = %e,
                "Skipping work item"
            );
            return JobOutcome::Skipped;
        }

        tracing::info!(worker = self.id, job_id = %job_id, file = %item.file_path, "Job started");
        let started = Instant::now();

        let result = match JobOptions::parse(&item.options, self.settings.default_batch_size) {
            Err(message) => Err(PipelineError::InvalidOptions(message)),
            Ok(options) => {
                let request = PipelineRequest {
                    job_id,
                    file_path: &item.file_path,
                    engine_key: self.resolve_key(&options),
                    options: &options,
                };
                let slot = &mut self.slot;
                let normalizer = &self.normalizer;
                let store = self.store.as_ref();
                panic::catch_unwind(AssertUnwindSafe(|| {
                    run_pipeline(slot, normalizer, store, &request)
                }))
                .unwrap_or_else(|payload| Err(PipelineError::Panicked(panic_message(payload.as_ref()))))
            }
        };

        match result {
            Ok(segments) => {
                let count = segments.len();
                if self.settings.mirror_results {
                    match mirror_result(&item.file_path, &segments) {
                        Ok(path) => tracing::info!(job_id = %job_id, path = %path.display(), "Result mirrored"),
                        Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to mirror result"),
                    }
                }
                if let Err(e) = self.store.complete(job_id, segments) {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record job success");
                }
                tracing::info!(
                    worker = self.id,
                    job_id = %job_id,
                    segments = count,
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "Job succeeded"
                );
                JobOutcome::Succeeded { segments: count }
            }
            Err(err) => {
                let classification = classify(&err, &item.file_path);
                if classification.release_slot {
                    self.slot.release();
                }
                tracing::error!(
                    worker = self.id,
                    job_id = %job_id,
                    code = %classification.record.code,
                    error = %err,
                    "Job failed: {}",
                    classification.record.message
                );
                if let Err(e) = self.store.fail(job_id, classification.record.clone()) {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record job failure");
                }
                JobOutcome::Failed(classification.record)
            }
        }
    }

    /// Requested model, else the resident one, else the configured default.
    fn resolve_key(&self, options: &JobOptions) -> EngineKey {
        let model = options
            .model
            .clone()
            .or_else(|| self.slot.resident_key().map(|key| key.model.clone()))
            .unwrap_or_else(|| self.settings.default_model.clone());
        EngineKey::new(model, &self.settings.device, &self.settings.compute_type)
    }

    pub fn slot(&self) -> &ModelSlotManager<T> {
        &self.slot
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Start `count` workers on blocking threads.
///
/// `factory` builds the transcriber and normalizer for each worker so no two
/// workers share a capability instance.
pub fn spawn_workers<T, N, F>(
    count: usize,
    factory: F,
    store: Arc<dyn JobStore>,
    queue: TaskQueue,
    settings: WorkerSettings,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>>
where
    T: Transcriber + 'static,
    N: AudioNormalizer + 'static,
    F: Fn(usize) -> (T, N),
{
    (0..count)
        .map(|id| {
            let (transcriber, normalizer) = factory(id);
            let worker = Worker::new(
                id,
                transcriber,
                normalizer,
                Arc::clone(&store),
                queue.clone(),
                settings.clone(),
            );
            let shutdown = shutdown.clone();
            tokio::task::spawn_blocking(move || worker.run(shutdown))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{ErrorCode, Job, JobId, JobStatus};
    use crate::jobs::store::InMemoryJobStore;
    use crate::testing::{FakeNormalizer, FakeTranscriber};
    use serde_json::{json, Value};

    struct Harness {
        store: Arc<InMemoryJobStore>,
        queue: TaskQueue,
        fake: FakeTranscriber,
        normalizer: FakeNormalizer,
        worker: Worker<FakeTranscriber, FakeNormalizer>,
        input: tempfile::NamedTempFile,
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            default_model: "large-v3-turbo".into(),
            device: "cpu".into(),
            compute_type: "float32".into(),
            default_batch_size: 16,
            mirror_results: false,
            warmup: false,
            poll_interval: Duration::from_millis(10),
        }
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = TaskQueue::new(8);
        let fake = FakeTranscriber::default();
        let normalizer = FakeNormalizer::default();
        let worker = Worker::new(
            0,
            fake.clone(),
            normalizer.clone(),
            store.clone(),
            queue.clone(),
            settings(),
        );
        Harness {
            store,
            queue,
            fake,
            normalizer,
            worker,
            input: tempfile::NamedTempFile::new().unwrap(),
        }
    }

    impl Harness {
        fn submit(&self, file_path: &str, options: Value) -> JobId {
            let id = JobId::generate();
            self.store
                .create(Job::pending(id.clone(), file_path, options.clone()))
                .unwrap();
            self.queue
                .push(WorkItem::new(id.clone(), file_path, options))
                .unwrap();
            id
        }

        fn input_path(&self) -> String {
            self.input.path().to_string_lossy().into_owned()
        }
    }

    /// Records every distinct progress value seen on a job.
    struct ProgressRecorder {
        inner: Arc<InMemoryJobStore>,
        seen: parking_lot::Mutex<Vec<f64>>,
    }

    impl JobStore for ProgressRecorder {
        fn create(&self, job: Job) -> Result<(), crate::jobs::store::StoreError> {
            self.inner.create(job)
        }
        fn get(&self, id: &JobId) -> Option<Job> {
            self.inner.get(id)
        }
        fn mark_processing(&self, id: &JobId) -> Result<(), crate::jobs::store::StoreError> {
            self.inner.mark_processing(id)?;
            self.seen.lock().push(0.0);
            Ok(())
        }
        fn update_progress(&self, id: &JobId, p: f64) -> Result<(), crate::jobs::store::StoreError> {
            self.inner.update_progress(id, p)?;
            self.seen.lock().push(p);
            Ok(())
        }
        fn complete(
            &self,
            id: &JobId,
            result: Vec<crate::jobs::model::Segment>,
        ) -> Result<(), crate::jobs::store::StoreError> {
            self.inner.complete(id, result)?;
            self.seen.lock().push(100.0);
            Ok(())
        }
        fn fail(&self, id: &JobId, error: ErrorRecord) -> Result<(), crate::jobs::store::StoreError> {
            self.inner.fail(id, error)
        }
        fn counts(&self) -> crate::jobs::store::StoreCounts {
            self.inner.counts()
        }
    }

    #[test]
    fn test_no_align_job_on_fresh_worker() {
        let inner = Arc::new(InMemoryJobStore::new());
        let recorder = Arc::new(ProgressRecorder {
            inner: inner.clone(),
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let queue = TaskQueue::new(4);
        let fake = FakeTranscriber::default();
        let mut worker = Worker::new(
            0,
            fake.clone(),
            FakeNormalizer::default(),
            recorder.clone(),
            queue.clone(),
            settings(),
        );
        let input = tempfile::NamedTempFile::new().unwrap();
        let path = input.path().to_string_lossy().into_owned();
        let id = JobId::generate();
        recorder
            .create(Job::pending(id.clone(), &path, json!({"no_align": true})))
            .unwrap();
        queue
            .push(WorkItem::new(id.clone(), &path, json!({"no_align": true})))
            .unwrap();

        let outcome = worker.process_next(Duration::from_millis(10)).unwrap();
        assert_eq!(outcome, JobOutcome::Succeeded { segments: 2 });

        let counters = fake.counters();
        assert_eq!(counters.engine_loads, 1);
        assert_eq!(counters.alignment_loads, 0);
        assert_eq!(*recorder.seen.lock(), vec![0.0, 20.0, 90.0, 100.0]);

        let job = inner.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.progress, 100.0);
        for segment in job.result.unwrap() {
            assert!(segment.end_time >= segment.start_time && segment.start_time >= 0.0);
            assert!(!segment.text.trim().is_empty());
        }
    }

    #[test]
    fn test_same_model_across_jobs_loads_once() {
        let mut h = harness();
        let path = h.input_path();
        let first = h.submit(&path, json!({"model": "small", "no_align": true}));
        let second = h.submit(&path, json!({"model": "small", "no_align": true}));

        h.worker.process_next(Duration::from_millis(10)).unwrap();
        h.worker.process_next(Duration::from_millis(10)).unwrap();

        assert_eq!(h.fake.counters().engine_loads, 1);
        assert_eq!(h.store.get(&first).unwrap().status, JobStatus::Success);
        assert_eq!(h.store.get(&second).unwrap().status, JobStatus::Success);
    }

    #[test]
    fn test_missing_model_option_reuses_resident_engine() {
        let mut h = harness();
        let path = h.input_path();
        h.submit(&path, json!({"model": "small"}));
        h.submit(&path, Value::Null);

        h.worker.process_next(Duration::from_millis(10)).unwrap();
        h.worker.process_next(Duration::from_millis(10)).unwrap();

        assert_eq!(h.fake.counters().engine_loads, 1);
        assert_eq!(h.worker.slot().resident_key().unwrap().model, "small");
    }

    #[test]
    fn test_default_model_used_on_empty_slot() {
        let mut h = harness();
        let path = h.input_path();
        h.submit(&path, Value::Null);
        h.worker.process_next(Duration::from_millis(10)).unwrap();
        assert_eq!(
            h.fake.loaded_keys(),
            vec![EngineKey::new("large-v3-turbo", "cpu", "float32")]
        );
    }

    #[test]
    fn test_out_of_memory_fails_job_and_clears_slot() {
        let mut h = harness();
        let path = h.input_path();
        h.fake
            .fail_next_transcribe(CapabilityError::ResourceExhausted("CUDA out of memory".into()));
        let id = h.submit(&path, Value::Null);

        let outcome = h.worker.process_next(Duration::from_millis(10)).unwrap();
        assert!(matches!(outcome, JobOutcome::Failed(ref r) if r.code == ErrorCode::GpuOom));

        let job = h.store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failure);
        assert_eq!(job.error.unwrap().code, ErrorCode::GpuOom);
        assert!(job.result.is_none());
        assert!(job.progress < 100.0);
        assert!(h.worker.slot().resident_key().is_none());

        h.submit(&path, Value::Null);
        h.worker.process_next(Duration::from_millis(10)).unwrap();
        assert_eq!(h.fake.counters().engine_loads, 2);
    }

    #[test]
    fn test_out_of_memory_during_load_fails_job_and_reloads_next_time() {
        let mut h = harness();
        let path = h.input_path();
        h.worker.warmup().unwrap();

        h.fake
            .fail_next_load(CapabilityError::ResourceExhausted("CUDA out of memory".into()));
        let id = h.submit(&path, json!({"model": "large-v3"}));
        let outcome = h.worker.process_next(Duration::from_millis(10)).unwrap();
        assert!(matches!(outcome, JobOutcome::Failed(ref r) if r.code == ErrorCode::GpuOom));

        let job = h.store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failure);
        assert_eq!(job.error.unwrap().code, ErrorCode::GpuOom);
        assert_eq!(job.progress, 0.0);
        assert!(h.worker.slot().resident_key().is_none());
        assert_eq!(h.fake.counters().live_engines, 0);

        let id = h.submit(&path, json!({"model": "large-v3"}));
        h.worker.process_next(Duration::from_millis(10)).unwrap();
        assert_eq!(h.store.get(&id).unwrap().status, JobStatus::Success);
        assert_eq!(h.fake.counters().engine_loads, 2);
        assert_eq!(
            h.fake.loaded_keys().last(),
            Some(&EngineKey::new("large-v3", "cpu", "float32"))
        );
    }

    #[test]
    fn test_panicking_engine_fails_job_and_releases_slot() {
        let mut h = harness();
        let path = h.input_path();
        h.fake.panic_on_transcribe(true);
        let id = h.submit(&path, json!({"no_align": true}));

        let outcome = h.worker.process_next(Duration::from_millis(10)).unwrap();
        assert!(matches!(outcome, JobOutcome::Failed(ref r) if r.code == ErrorCode::UnknownError));

        let job = h.store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failure);
        assert!(job.error.unwrap().message.contains("engine exploded"));
        assert!(h.worker.slot().resident_key().is_none());
        assert_eq!(h.fake.counters().engine_drops, 1);
        assert!(!h.normalizer.artifacts()[0].exists());

        // Acked, not redelivered
        let stats = h.queue.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.redelivered_total, 0);
        assert!(h.worker.process_next(Duration::from_millis(10)).is_none());

        h.fake.panic_on_transcribe(false);
        let id = h.submit(&path, json!({"no_align": true}));
        h.worker.process_next(Duration::from_millis(10)).unwrap();
        assert_eq!(h.store.get(&id).unwrap().status, JobStatus::Success);
        assert_eq!(h.fake.counters().engine_loads, 2);
    }

    #[test]
    fn test_missing_file_fails_without_engine_load() {
        let mut h = harness();
        let id = h.submit("/no/such/input.wav", Value::Null);

        h.worker.process_next(Duration::from_millis(10)).unwrap();

        let job = h.store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failure);
        assert_eq!(job.error.unwrap().code, ErrorCode::FileNotSupported);
        assert_eq!(h.fake.counters().engine_loads, 0);
        assert_eq!(h.normalizer.calls(), 1);
    }

    #[test]
    fn test_alignment_failure_still_succeeds() {
        let mut h = harness();
        let path = h.input_path();
        h.fake.fail_refine(true);
        let id = h.submit(&path, Value::Null);

        h.worker.process_next(Duration::from_millis(10)).unwrap();

        let job = h.store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.result.unwrap()[0].start_time, 0.0);
    }

    #[test]
    fn test_invalid_options_fail_as_unknown() {
        let mut h = harness();
        let path = h.input_path();
        let id = h.submit(&path, json!({"batch_size": 0}));

        h.worker.process_next(Duration::from_millis(10)).unwrap();

        let job = h.store.get(&id).unwrap();
        assert_eq!(job.error.unwrap().code, ErrorCode::UnknownError);
        assert_eq!(h.fake.counters().engine_loads, 0);
    }

    #[test]
    fn test_non_pending_job_is_skipped() {
        let mut h = harness();
        let path = h.input_path();
        let id = h.submit(&path, Value::Null);
        h.store.mark_processing(&id).unwrap();

        let outcome = h.worker.process_next(Duration::from_millis(10)).unwrap();
        assert_eq!(outcome, JobOutcome::Skipped);
        assert_eq!(h.queue.stats().in_flight, 0);
        assert_eq!(h.fake.counters().engine_loads, 0);
    }

    #[test]
    fn test_mirror_results_written() {
        let mut h = harness();
        h.worker.settings.mirror_results = true;
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("talk.wav");
        std::fs::write(&input, b"RIFF").unwrap();
        let path = input.to_string_lossy().into_owned();
        h.submit(&path, json!({"no_align": true}));

        h.worker.process_next(Duration::from_millis(10)).unwrap();
        assert!(dir.path().join("talk_result.json").exists());
    }

    #[test]
    fn test_run_stops_on_cancellation() {
        let h = harness();
        let token = CancellationToken::new();
        token.cancel();
        h.worker.run(token);
    }

    #[test]
    fn test_warmup_loads_default_model() {
        let mut h = harness();
        h.worker.warmup().unwrap();
        assert_eq!(h.fake.counters().engine_loads, 1);

        let path = h.input_path();
        h.submit(&path, Value::Null);
        h.worker.process_next(Duration::from_millis(10)).unwrap();
        assert_eq!(h.fake.counters().engine_loads, 1);
    }
}
